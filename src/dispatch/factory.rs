//! Record construction strategies used by the dispatcher.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::record::{RecordKind, RecordObject, RecordRegistry};
use crate::{Result, TracklineError};

/// Builds a typed record from a raw queue buffer.
pub trait RecordFactory: Send + Sync {
    fn create(&self, registry: &RecordRegistry, bytes: Bytes) -> Result<RecordObject>;
}

/// `type\0data` framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericFactory;

impl RecordFactory for GenericFactory {
    fn create(&self, registry: &RecordRegistry, bytes: Bytes) -> Result<RecordObject> {
        RecordObject::interface(registry, bytes)
    }
}

/// CCSDS command packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcsdsCommandFactory;

impl RecordFactory for CcsdsCommandFactory {
    fn create(&self, registry: &RecordRegistry, bytes: Bytes) -> Result<RecordObject> {
        let rec = RecordObject::ccsds_interface(registry, bytes)?;
        match rec.definition().kind() {
            RecordKind::CcsdsCommand { .. } => Ok(rec),
            _ => Err(TracklineError::invalid_data(
                "CCSDS command",
                format!("packet resolved to non-command type '{}'", rec.record_type()),
            )),
        }
    }
}

/// CCSDS telemetry packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcsdsTelemetryFactory;

impl RecordFactory for CcsdsTelemetryFactory {
    fn create(&self, registry: &RecordRegistry, bytes: Bytes) -> Result<RecordObject> {
        let rec = RecordObject::ccsds_interface(registry, bytes)?;
        match rec.definition().kind() {
            RecordKind::CcsdsTelemetry { .. } => Ok(rec),
            _ => Err(TracklineError::invalid_data(
                "CCSDS telemetry",
                format!("packet resolved to non-telemetry type '{}'", rec.record_type()),
            )),
        }
    }
}

/// Wire framing of a dispatcher's input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    #[default]
    Generic,
    CcsdsCommand,
    CcsdsTelemetry,
}

impl RecordFormat {
    pub fn factory(self) -> Box<dyn RecordFactory> {
        match self {
            RecordFormat::Generic => Box::new(GenericFactory),
            RecordFormat::CcsdsCommand => Box::new(CcsdsCommandFactory),
            RecordFormat::CcsdsTelemetry => Box::new(CcsdsTelemetryFactory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldType, SchemaBuilder, SerialMode, ccsds};

    #[test]
    fn factories_check_packet_type() {
        let registry = RecordRegistry::new();
        let cmd = registry
            .define_ccsds_command(
                SchemaBuilder::new("cmd").field_at("arg", FieldType::UInt8, 8, 1),
                0x20,
                1,
                10,
            )
            .unwrap();
        let mut pkt = vec![0u8; 10];
        ccsds::populate_header(&mut pkt, cmd.kind(), 10);
        let pkt = Bytes::from(pkt);

        assert!(CcsdsCommandFactory.create(&registry, pkt.clone()).is_ok());
        assert!(CcsdsTelemetryFactory.create(&registry, pkt.clone()).is_err());
        assert!(GenericFactory.create(&registry, pkt).is_err());
    }

    #[test]
    fn generic_factory_reads_prefix() {
        let registry = RecordRegistry::with_builtin_records().unwrap();
        let rec = RecordObject::new(&registry, "exceptrec").unwrap();
        let wire = Bytes::from(rec.serialize(SerialMode::Copy).into_owned());
        let made = RecordFormat::Generic.factory().create(&registry, wire).unwrap();
        assert!(made.is_type("exceptrec"));
    }
}
