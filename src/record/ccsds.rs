//! CCSDS space packet primary header helpers.
//!
//! CCSDS records carry no type-name prefix; the 6-byte primary header (APID,
//! command flag, packet length) plus the command function code identify the
//! registered definition through a cross-reference keyed by
//! `(subtype << 11) | apid`, where subtype is the function code for commands
//! and zero for telemetry.

use super::RecordKind;

pub const PRIMARY_HEADER_LEN: usize = 6;

const APID_MASK: u16 = 0x07FF;
const CMD_FLAG: u8 = 0x10;
const SHDR_FLAG: u8 = 0x08;
const FC_MASK: u8 = 0x7F;
const SEQFLG_NONE: u8 = 0xC0;

pub fn apid(packet: &[u8]) -> u16 {
    ((u16::from(packet[0]) << 8) | u16::from(packet[1])) & APID_MASK
}

pub fn is_command(packet: &[u8]) -> bool {
    packet[0] & CMD_FLAG != 0
}

pub fn function_code(packet: &[u8]) -> u8 {
    packet.get(6).map(|b| b & FC_MASK).unwrap_or(0)
}

/// Total packet length in bytes, including the primary header.
pub fn packet_len(packet: &[u8]) -> usize {
    ((usize::from(packet[4]) << 8) | usize::from(packet[5])) + 7
}

/// Cross-reference key for a registered packet kind.
pub fn xref_key(kind: RecordKind) -> Option<u32> {
    match kind {
        RecordKind::Generic => None,
        RecordKind::CcsdsCommand { apid, function_code } => {
            Some((u32::from(function_code & FC_MASK) << 11) | u32::from(apid & APID_MASK))
        }
        RecordKind::CcsdsTelemetry { apid } => Some(u32::from(apid & APID_MASK)),
    }
}

/// Cross-reference key decoded from a raw packet, if the header is usable.
pub fn packet_key(packet: &[u8]) -> Option<u32> {
    if packet.len() < PRIMARY_HEADER_LEN || packet_len(packet) > packet.len() {
        return None;
    }
    let subtype = if is_command(packet) { u32::from(function_code(packet)) } else { 0 };
    Some((subtype << 11) | u32::from(apid(packet)))
}

/// Writes a fresh primary header for a packet of `size` bytes.
pub fn populate_header(packet: &mut [u8], kind: RecordKind, size: usize) {
    if packet.len() < PRIMARY_HEADER_LEN {
        return;
    }
    let apid = match kind {
        RecordKind::Generic => return,
        RecordKind::CcsdsCommand { apid, .. } | RecordKind::CcsdsTelemetry { apid } => apid,
    };

    packet[0] = (packet[0] & 0xF8) | ((apid >> 8) & 0x07) as u8;
    packet[1] = (apid & 0xFF) as u8;

    let len = size.saturating_sub(7);
    packet[4] = ((len >> 8) & 0xFF) as u8;
    packet[5] = (len & 0xFF) as u8;

    packet[0] |= SHDR_FLAG;
    packet[2] = (packet[2] & 0x3F) | SEQFLG_NONE;

    match kind {
        RecordKind::CcsdsCommand { function_code, .. } => {
            packet[0] |= CMD_FLAG;
            if let Some(fc) = packet.get_mut(6) {
                *fc = function_code & FC_MASK;
            }
        }
        _ => packet[0] &= !CMD_FLAG,
    }
}
