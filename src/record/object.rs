//! Self-describing record buffers with by-name field access.
//!
//! A [`RecordObject`] pairs a byte buffer with the shared definition that
//! interprets it. Owned records hold a `Vec<u8>`; interface records are
//! zero-copy views over a reference-counted [`Bytes`] payload (for example a
//! message received from a queue) and copy on first write.
//!
//! ## Sizes
//!
//! The declared size comes from the definition and excludes variable-length
//! trailing arrays. The allocated size is the real data length. Batch senders
//! allocate room for many elements and transmit only the populated prefix with
//! [`RecordObject::serialize_with_size`].
//!
//! ```rust
//! use trackline::record::{RecordObject, RecordRegistry, SerialMode};
//!
//! let registry = RecordRegistry::with_builtin_records().unwrap();
//! let mut rec = RecordObject::new(&registry, "exceptrec").unwrap();
//! rec.set_integer("code", 0, -4).unwrap();
//! rec.set_text("text", 0, "no photons in region").unwrap();
//!
//! let wire = rec.serialize(SerialMode::Copy).into_owned();
//! let back = RecordObject::deserialize(&registry, &wire).unwrap();
//! assert_eq!(back.get_integer("code", 0).unwrap(), -4);
//! assert_eq!(back.get_text("text", 0).unwrap(), "no photons in region");
//! ```

use bytes::Bytes;
use std::borrow::Cow;
use std::sync::Arc;

use super::field::{Field, FieldFlags, FieldType};
use super::registry::RecordRegistry;
use super::schema::RecordDefinition;
use super::value::{FieldData, Value, pack_bits, unpack_bits};
use super::ccsds;
use crate::{Result, TracklineError};

/// Longest accepted type-name prefix, including the terminator.
pub const MAX_TYPE_NAME: usize = 128;

const SUBSECONDS_PER_SECOND: f64 = 4_294_967_296.0;

/// How [`RecordObject::serialize`] hands out the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialMode {
    /// Fresh owned copy
    Copy,
    /// Borrow of the record's own buffer
    Reference,
}

#[derive(Debug, Clone)]
enum Buffer {
    Owned(Vec<u8>),
    Shared(Bytes),
}

impl Buffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Shared(b) => b,
        }
    }
}

/// A record instance: wire buffer plus definition.
#[derive(Debug, Clone)]
pub struct RecordObject {
    definition: Arc<RecordDefinition>,
    buffer: Buffer,
    data_start: usize,
}

impl RecordObject {
    /// Zero-filled record of the declared size.
    pub fn new(registry: &RecordRegistry, name: &str) -> Result<Self> {
        let definition = registry.get(name)?;
        let size = definition.size();
        Ok(Self::from_definition(definition, size))
    }

    /// Zero-filled record with room for trailing data.
    pub fn with_size(registry: &RecordRegistry, name: &str, size: usize) -> Result<Self> {
        let definition = registry.get(name)?;
        if size < definition.size() {
            return Err(TracklineError::buffer_too_small(definition.size(), size));
        }
        Ok(Self::from_definition(definition, size))
    }

    /// Zero-filled record of `size` data bytes; CCSDS headers are populated.
    ///
    /// `size` is raised to the declared size when smaller.
    pub fn from_definition(definition: Arc<RecordDefinition>, size: usize) -> Self {
        let size = size.max(definition.size());
        let kind = definition.kind();
        if kind.is_ccsds() {
            let mut packet = vec![0u8; size];
            ccsds::populate_header(&mut packet, kind, definition.size());
            return Self { definition, buffer: Buffer::Owned(packet), data_start: 0 };
        }

        let name = definition.name().as_bytes();
        let mut buf = Vec::with_capacity(name.len() + 1 + size);
        buf.extend_from_slice(name);
        buf.push(0);
        buf.resize(name.len() + 1 + size, 0);
        Self { data_start: name.len() + 1, definition, buffer: Buffer::Owned(buf) }
    }

    /// Owned copy of a serialized `type\0data` buffer.
    pub fn deserialize(registry: &RecordRegistry, bytes: &[u8]) -> Result<Self> {
        let (definition, data_start) = parse_prefix(registry, bytes)?;
        Ok(Self { definition, buffer: Buffer::Owned(bytes.to_vec()), data_start })
    }

    /// Zero-copy view over a serialized `type\0data` buffer.
    pub fn interface(registry: &RecordRegistry, bytes: Bytes) -> Result<Self> {
        let (definition, data_start) = parse_prefix(registry, &bytes)?;
        Ok(Self { definition, buffer: Buffer::Shared(bytes), data_start })
    }

    /// Zero-copy view over a CCSDS packet, typed through the packet cross-reference.
    pub fn ccsds_interface(registry: &RecordRegistry, bytes: Bytes) -> Result<Self> {
        let definition = registry.ccsds_lookup(&bytes).ok_or_else(|| {
            TracklineError::invalid_data("CCSDS packet", "no definition for packet header")
        })?;
        if bytes.len() < definition.size() {
            return Err(TracklineError::buffer_too_small(definition.size(), bytes.len()));
        }
        Ok(Self { definition, buffer: Buffer::Shared(bytes), data_start: 0 })
    }

    pub fn record_type(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &Arc<RecordDefinition> {
        &self.definition
    }

    pub fn is_type(&self, name: &str) -> bool {
        self.definition.name() == name
    }

    /// Schema size, excluding variable-length payload.
    pub fn declared_size(&self) -> usize {
        self.definition.size()
    }

    /// Real length of the data buffer.
    pub fn allocated_size(&self) -> usize {
        self.buffer.as_slice().len() - self.data_start
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer.as_slice()[self.data_start..]
    }

    /// Mutable data; interface records are copied into an owned buffer first.
    pub fn data_mut(&mut self) -> &mut [u8] {
        if let Buffer::Shared(bytes) = &self.buffer {
            self.buffer = Buffer::Owned(bytes.to_vec());
        }
        match &mut self.buffer {
            Buffer::Owned(v) => &mut v[self.data_start..],
            Buffer::Shared(_) => &mut [],
        }
    }

    /// Wire form of the whole allocation.
    pub fn serialize(&self, mode: SerialMode) -> Cow<'_, [u8]> {
        self.serialize_with_size(mode, self.allocated_size())
    }

    /// Wire form limited to the first `size` data bytes.
    pub fn serialize_with_size(&self, mode: SerialMode, size: usize) -> Cow<'_, [u8]> {
        let end = self.data_start + size.min(self.allocated_size());
        let wire = &self.buffer.as_slice()[..end];
        match mode {
            SerialMode::Copy => Cow::Owned(wire.to_vec()),
            SerialMode::Reference => Cow::Borrowed(wire),
        }
    }

    /// Wire form as reference-counted bytes; interface records are sliced, not copied.
    pub fn to_bytes(&self, size: usize) -> Bytes {
        let end = self.data_start + size.min(self.allocated_size());
        match &self.buffer {
            Buffer::Shared(b) => b.slice(..end),
            Buffer::Owned(v) => Bytes::copy_from_slice(&v[..end]),
        }
    }

    /// Data region (no prefix) as reference-counted bytes.
    pub fn data_bytes(&self) -> Bytes {
        match &self.buffer {
            Buffer::Shared(b) => b.slice(self.data_start..),
            Buffer::Owned(v) => Bytes::copy_from_slice(&v[self.data_start..]),
        }
    }

    /// Resolves a field path, reporting unknown names as an access error.
    pub fn field(&self, name: &str) -> Result<Field> {
        self.definition
            .resolve(name)
            .ok_or_else(|| TracklineError::invalid_field(self.record_type(), name))
    }

    /// Value of the id field, when the definition declares one.
    pub fn record_id(&self) -> Option<i64> {
        let id = self.definition.id_field()?;
        self.get_integer(id, 0).ok()
    }

    pub fn get_real(&self, name: &str, element: usize) -> Result<f64> {
        Ok(self.value_at(&self.field(name)?, element)?.as_f64())
    }

    pub fn get_integer(&self, name: &str, element: usize) -> Result<i64> {
        Ok(self.value_at(&self.field(name)?, element)?.as_i64())
    }

    pub fn get_text(&self, name: &str, element: usize) -> Result<String> {
        Ok(self.value_at(&self.field(name)?, element)?.to_string())
    }

    pub fn get_value(&self, name: &str, element: usize) -> Result<Value> {
        self.value_at(&self.field(name)?, element)
    }

    pub fn set_real(&mut self, name: &str, element: usize, value: f64) -> Result<()> {
        let field = self.field(name)?;
        self.set_real_at(&field, element, value)
    }

    pub fn set_integer(&mut self, name: &str, element: usize, value: i64) -> Result<()> {
        let field = self.field(name)?;
        self.set_integer_at(&field, element, value)
    }

    pub fn set_text(&mut self, name: &str, element: usize, value: &str) -> Result<()> {
        let field = self.field(name)?;
        self.set_text_at(&field, element, value)
    }

    /// Typed read of a primitive through a resolved field.
    pub fn get<T: FieldData>(&self, field: &Field, element: usize) -> Result<T> {
        let f = self.locate(field, element)?;
        if !T::matches(f.field_type) {
            return Err(TracklineError::invalid_field(
                self.record_type(),
                format!("{} is not {}", f.field_type, std::any::type_name::<T>()),
            ));
        }
        self.read(&f)
    }

    /// Typed write of a primitive through a resolved field.
    pub fn set<T: FieldData>(&mut self, field: &Field, element: usize, value: T) -> Result<()> {
        let f = self.locate(field, element)?;
        if !T::matches(f.field_type) {
            return Err(TracklineError::invalid_field(
                self.record_type(),
                format!("{} is not {}", f.field_type, std::any::type_name::<T>()),
            ));
        }
        self.write(&f, value)
    }

    /// Natively typed value of a resolved field element.
    pub fn value_at(&self, field: &Field, element: usize) -> Result<Value> {
        let f = self.locate(field, element)?;
        Ok(match f.field_type {
            FieldType::Int8 => Value::Int8(self.read(&f)?),
            FieldType::Int16 => Value::Int16(self.read(&f)?),
            FieldType::Int32 => Value::Int32(self.read(&f)?),
            FieldType::Int64 => Value::Int64(self.read(&f)?),
            FieldType::UInt8 => Value::UInt8(self.read(&f)?),
            FieldType::UInt16 => Value::UInt16(self.read(&f)?),
            FieldType::UInt32 => Value::UInt32(self.read(&f)?),
            FieldType::UInt64 => Value::UInt64(self.read(&f)?),
            FieldType::Float => Value::Float(self.read(&f)?),
            FieldType::Double => Value::Double(self.read(&f)?),
            FieldType::BitField => Value::BitField(
                unpack_bits(self.data(), f.offset, f.count)
                    .ok_or_else(|| self.short(f.byte_len() + f.offset / 8))?,
            ),
            FieldType::Time8 => {
                let seconds: u32 = self.read(&f)?;
                let subseconds: u32 = self.read(&Field { offset: f.offset + 4, ..f.clone() })?;
                Value::Time8(f64::from(seconds) + f64::from(subseconds) / SUBSECONDS_PER_SECOND)
            }
            FieldType::String => Value::Text(self.read_text(&f)?),
            FieldType::User => {
                return Err(TracklineError::invalid_field(
                    self.record_type(),
                    "nested record has no scalar value",
                ));
            }
        })
    }

    /// Writes a real value; integer targets truncate with `as` semantics.
    pub fn set_real_at(&mut self, field: &Field, element: usize, value: f64) -> Result<()> {
        let f = self.locate(field, element)?;
        match f.field_type {
            FieldType::Int8 => self.write(&f, value as i8),
            FieldType::Int16 => self.write(&f, value as i16),
            FieldType::Int32 => self.write(&f, value as i32),
            FieldType::Int64 => self.write(&f, value as i64),
            FieldType::UInt8 => self.write(&f, value as u8),
            FieldType::UInt16 => self.write(&f, value as u16),
            FieldType::UInt32 => self.write(&f, value as u32),
            FieldType::UInt64 => self.write(&f, value as u64),
            FieldType::Float => self.write(&f, value as f32),
            FieldType::Double => self.write(&f, value),
            FieldType::BitField => self.write_bits(&f, value as u64),
            FieldType::Time8 => {
                let seconds = value.trunc();
                let subseconds = ((value - seconds) * SUBSECONDS_PER_SECOND) as u32;
                self.write(&f, seconds as u32)?;
                self.write(&Field { offset: f.offset + 4, ..f.clone() }, subseconds)
            }
            FieldType::String => self.write_text(&f, &value.to_string()),
            FieldType::User => Err(TracklineError::invalid_field(
                self.record_type(),
                "cannot assign a scalar to a nested record",
            )),
        }
    }

    /// Writes an integer value; narrower targets keep the low-order bits.
    pub fn set_integer_at(&mut self, field: &Field, element: usize, value: i64) -> Result<()> {
        let f = self.locate(field, element)?;
        match f.field_type {
            FieldType::Int8 => self.write(&f, value as i8),
            FieldType::Int16 => self.write(&f, value as i16),
            FieldType::Int32 => self.write(&f, value as i32),
            FieldType::Int64 => self.write(&f, value),
            FieldType::UInt8 => self.write(&f, value as u8),
            FieldType::UInt16 => self.write(&f, value as u16),
            FieldType::UInt32 => self.write(&f, value as u32),
            FieldType::UInt64 => self.write(&f, value as u64),
            FieldType::Float => self.write(&f, value as f32),
            FieldType::Double => self.write(&f, value as f64),
            FieldType::BitField => self.write_bits(&f, value as u64),
            FieldType::Time8 => {
                self.write(&f, value as u32)?;
                self.write(&Field { offset: f.offset + 4, ..f.clone() }, 0u32)
            }
            FieldType::String => self.write_text(&f, &value.to_string()),
            FieldType::User => Err(TracklineError::invalid_field(
                self.record_type(),
                "cannot assign a scalar to a nested record",
            )),
        }
    }

    /// Writes text; numeric targets parse the text first.
    pub fn set_text_at(&mut self, field: &Field, element: usize, value: &str) -> Result<()> {
        match field.field_type {
            FieldType::String => {
                let f = self.locate(field, element)?;
                self.write_text(&f, value)
            }
            t if t.is_real() => {
                let parsed = value.trim().parse::<f64>().map_err(|e| {
                    TracklineError::invalid_data(self.record_type(), format!("'{value}': {e}"))
                })?;
                self.set_real_at(field, element, parsed)
            }
            _ => {
                let parsed = value.trim().parse::<i64>().map_err(|e| {
                    TracklineError::invalid_data(self.record_type(), format!("'{value}': {e}"))
                })?;
                self.set_integer_at(field, element, parsed)
            }
        }
    }

    /// Applies pointer indirection and element indexing, checking fixed bounds.
    fn locate(&self, field: &Field, element: usize) -> Result<Field> {
        if field.flags.contains(FieldFlags::POINTER) {
            return self.dereference(field, element);
        }
        match field.field_type {
            FieldType::BitField | FieldType::String => {
                if element > 0 {
                    return Err(self.out_of_range(element));
                }
                Ok(field.clone())
            }
            _ if !field.is_variable_length() && element >= field.count => {
                Err(self.out_of_range(element))
            }
            _ if element == 0 => Ok(field.clone()),
            _ => Ok(field.element(element)),
        }
    }

    fn dereference(&self, field: &Field, element: usize) -> Result<Field> {
        let slot = Field {
            field_type: FieldType::Int32,
            offset: field.offset + element * FieldType::Int32.size(),
            count: 1,
            flags: field.flags.without(FieldFlags::POINTER),
            subtype: None,
        };
        let target: i32 = self.read(&slot)?;
        if target <= 0 || target as usize > self.allocated_size() {
            return Err(TracklineError::invalid_field(
                self.record_type(),
                format!("pointer offset {target} outside record"),
            ));
        }
        let target = target as usize;
        Ok(Field {
            offset: if field.field_type == FieldType::BitField { target * 8 } else { target },
            count: if field.field_type == FieldType::String {
                self.allocated_size() - target
            } else {
                field.count.max(1)
            },
            flags: field.flags.without(FieldFlags::POINTER),
            ..field.clone()
        })
    }

    fn read<T: FieldData>(&self, f: &Field) -> Result<T> {
        let bytes = self
            .data()
            .get(f.offset..f.offset + T::SIZE)
            .ok_or_else(|| self.short(f.offset + T::SIZE))?;
        Ok(T::decode(bytes, f.is_big_endian()))
    }

    fn write<T: FieldData>(&mut self, f: &Field, value: T) -> Result<()> {
        let needed = f.offset + T::SIZE;
        let short = self.short(needed);
        let bytes = self.data_mut().get_mut(f.offset..needed).ok_or(short)?;
        value.encode(bytes, f.is_big_endian());
        Ok(())
    }

    fn write_bits(&mut self, f: &Field, value: u64) -> Result<()> {
        let short = self.short(f.offset / 8 + f.byte_len());
        if pack_bits(self.data_mut(), f.offset, f.count, value) { Ok(()) } else { Err(short) }
    }

    fn string_span(&self, f: &Field) -> Result<std::ops::Range<usize>> {
        let end = if f.is_variable_length() { self.allocated_size() } else { f.offset + f.count };
        if f.offset > end || end > self.allocated_size() {
            return Err(self.short(end));
        }
        Ok(f.offset..end)
    }

    fn read_text(&self, f: &Field) -> Result<String> {
        let raw = &self.data()[self.string_span(f)?];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
    }

    /// Copies `text`, truncating to leave room for the terminator.
    fn write_text(&mut self, f: &Field, text: &str) -> Result<()> {
        let span = self.string_span(f)?;
        let slot = &mut self.data_mut()[span];
        if slot.is_empty() {
            return Ok(());
        }
        let n = text.len().min(slot.len() - 1);
        slot[..n].copy_from_slice(&text.as_bytes()[..n]);
        slot[n..].fill(0);
        Ok(())
    }

    fn short(&self, needed: usize) -> TracklineError {
        TracklineError::buffer_too_small(needed, self.allocated_size())
    }

    fn out_of_range(&self, element: usize) -> TracklineError {
        TracklineError::invalid_field(self.record_type(), format!("element {element} out of range"))
    }
}

fn parse_prefix(
    registry: &RecordRegistry,
    bytes: &[u8],
) -> Result<(Arc<RecordDefinition>, usize)> {
    let nul = bytes
        .iter()
        .take(MAX_TYPE_NAME)
        .position(|&b| b == 0)
        .ok_or_else(|| TracklineError::invalid_data("record prefix", "missing type terminator"))?;
    let name = std::str::from_utf8(&bytes[..nul])
        .map_err(|e| TracklineError::invalid_data("record prefix", e.to_string()))?;
    let definition = registry.get(name)?;
    let payload = bytes.len() - nul - 1;
    if payload < definition.size() {
        return Err(TracklineError::buffer_too_small(definition.size(), payload));
    }
    Ok((definition, nul + 1))
}

/// Type name of a serialized record without resolving it.
pub fn peek_type(bytes: &[u8]) -> Option<&str> {
    let nul = bytes.iter().take(MAX_TYPE_NAME).position(|&b| b == 0)?;
    std::str::from_utf8(&bytes[..nul]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldFlags, SchemaBuilder};

    fn sample_schema() -> SchemaBuilder {
        SchemaBuilder::new("sample")
            .field("i8", FieldType::Int8, 1)
            .field("i16", FieldType::Int16, 1)
            .field("i32", FieldType::Int32, 2)
            .field("i64", FieldType::Int64, 1)
            .field("u8", FieldType::UInt8, 1)
            .field("u16", FieldType::UInt16, 1)
            .flags(FieldFlags::BIGENDIAN)
            .field("u32", FieldType::UInt32, 1)
            .field("u64", FieldType::UInt64, 1)
            .field("f", FieldType::Float, 1)
            .field("d", FieldType::Double, 3)
            .field("t", FieldType::Time8, 1)
            .field("s", FieldType::String, 8)
            .field("bits", FieldType::BitField, 12)
            .field("ptr", FieldType::Double, 1)
            .flags(FieldFlags::POINTER)
            .id_field("u32")
    }

    fn registry() -> RecordRegistry {
        let registry = RecordRegistry::new();
        registry.define_with(sample_schema()).unwrap();
        registry
    }

    #[test]
    fn fields_read_back_what_was_written() {
        let registry = registry();
        let mut rec = RecordObject::new(&registry, "sample").unwrap();
        rec.set_integer("i8", 0, -5).unwrap();
        rec.set_integer("i32", 1, 123_456).unwrap();
        rec.set_integer("u16", 0, 0xBEEF).unwrap();
        rec.set_integer("u32", 0, 77).unwrap();
        rec.set_real("d", 2, 3.25).unwrap();
        rec.set_real("t", 0, 10.5).unwrap();
        rec.set_text("s", 0, "ATL03").unwrap();
        rec.set_integer("bits", 0, 0xABC).unwrap();

        assert_eq!(rec.get_integer("i8", 0).unwrap(), -5);
        assert_eq!(rec.get_integer("i32[1]", 0).unwrap(), 123_456);
        assert_eq!(rec.get_integer("u16", 0).unwrap(), 0xBEEF);
        assert_eq!(rec.get_real("d", 2).unwrap(), 3.25);
        assert_eq!(rec.get_real("t", 0).unwrap(), 10.5);
        assert_eq!(rec.get_text("s", 0).unwrap(), "ATL03");
        assert_eq!(rec.get_integer("bits", 0).unwrap(), 0xABC);
        assert_eq!(rec.record_id(), Some(77));

        let u16_field = rec.field("u16").unwrap();
        let off = u16_field.offset;
        assert_eq!(&rec.data()[off..off + 2], &[0xBE, 0xEF]);
    }

    #[test]
    fn narrowing_writes_truncate() {
        let registry = registry();
        let mut rec = RecordObject::new(&registry, "sample").unwrap();
        rec.set_integer("i8", 0, 0x1FF).unwrap();
        assert_eq!(rec.get_integer("i8", 0).unwrap(), -1);
        rec.set_real("u8", 0, 3.99).unwrap();
        assert_eq!(rec.get_integer("u8", 0).unwrap(), 3);
        rec.set_text("s", 0, "much-too-long").unwrap();
        assert_eq!(rec.get_text("s", 0).unwrap(), "much-to");
    }

    #[test]
    fn invalid_access_is_an_error_not_a_panic() {
        let registry = registry();
        let mut rec = RecordObject::new(&registry, "sample").unwrap();
        assert!(matches!(rec.get_real("nope", 0), Err(TracklineError::InvalidFieldAccess { .. })));
        assert!(matches!(rec.get_real("d", 3), Err(TracklineError::InvalidFieldAccess { .. })));
        assert!(matches!(rec.get_real("ptr", 0), Err(TracklineError::InvalidFieldAccess { .. })));
        assert!(rec.set_text("i32", 0, "twelve").is_err());

        let d = rec.field("d").unwrap();
        assert!(rec.get::<f32>(&d, 0).is_err());
        assert_eq!(rec.get::<f64>(&d, 0).unwrap(), 0.0);
    }

    #[test]
    fn pointer_fields_follow_offsets() {
        let registry = registry();
        let declared = registry.get("sample").unwrap().size();
        let mut rec = RecordObject::with_size(&registry, "sample", declared + 8).unwrap();
        let slot = rec.field("ptr").unwrap();
        let raw = Field { flags: FieldFlags::NONE, field_type: FieldType::Int32, ..slot.clone() };
        rec.set::<i32>(&raw, 0, declared as i32).unwrap();
        rec.set_real("ptr", 0, 6.5).unwrap();

        assert_eq!(rec.get_real("ptr", 0).unwrap(), 6.5);
        let tail = &rec.data()[declared..declared + 8];
        assert_eq!(f64::from_le_bytes(tail.try_into().unwrap()), 6.5);
    }

    #[test]
    fn sizes_are_explicit() {
        let registry = registry();
        let declared = registry.get("sample").unwrap().size();
        let rec = RecordObject::with_size(&registry, "sample", declared + 100).unwrap();
        assert_eq!(rec.declared_size(), declared);
        assert_eq!(rec.allocated_size(), declared + 100);

        let wire = rec.serialize_with_size(SerialMode::Reference, declared);
        assert_eq!(wire.len(), "sample".len() + 1 + declared);
        assert!(matches!(wire, Cow::Borrowed(_)));

        assert!(matches!(
            RecordObject::with_size(&registry, "sample", declared - 1),
            Err(TracklineError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn deserialize_checks_prefix_and_length() {
        let registry = registry();
        let rec = RecordObject::new(&registry, "sample").unwrap();
        let wire = rec.serialize(SerialMode::Copy).into_owned();

        assert_eq!(peek_type(&wire), Some("sample"));
        assert!(matches!(
            RecordObject::deserialize(&registry, &wire[..wire.len() - 1]),
            Err(TracklineError::BufferTooSmall { .. })
        ));
        assert!(matches!(
            RecordObject::deserialize(&registry, b"unknown\0abc"),
            Err(TracklineError::SchemaNotFound { .. })
        ));
        assert!(matches!(
            RecordObject::deserialize(&registry, b"no terminator"),
            Err(TracklineError::InvalidData { .. })
        ));
    }

    #[test]
    fn interface_records_copy_on_write() {
        let registry = registry();
        let mut rec = RecordObject::new(&registry, "sample").unwrap();
        rec.set_integer("i64", 0, 99).unwrap();
        let shared = Bytes::from(rec.serialize(SerialMode::Copy).into_owned());

        let mut view = RecordObject::interface(&registry, shared.clone()).unwrap();
        assert_eq!(view.get_integer("i64", 0).unwrap(), 99);
        assert_eq!(view.to_bytes(usize::MAX).as_ptr(), shared.as_ptr());

        view.set_integer("i64", 0, 100).unwrap();
        assert_eq!(view.get_integer("i64", 0).unwrap(), 100);
        let original = RecordObject::interface(&registry, shared).unwrap();
        assert_eq!(original.get_integer("i64", 0).unwrap(), 99);
    }

    #[test]
    fn ccsds_records_have_no_prefix() {
        let registry = RecordRegistry::new();
        registry
            .define_ccsds_telemetry(
                SchemaBuilder::new("hk").field_at("volts", FieldType::UInt16, 12, 1),
                0x42,
                16,
            )
            .unwrap();
        let def = registry.get("hk").unwrap();
        let mut rec = RecordObject::from_definition(def, 16);
        rec.set_integer("volts", 0, 28).unwrap();

        let wire = rec.serialize(SerialMode::Copy).into_owned();
        assert_eq!(wire.len(), 16);
        let view = RecordObject::ccsds_interface(&registry, Bytes::from(wire)).unwrap();
        assert!(view.is_type("hk"));
        assert_eq!(view.get_integer("volts", 0).unwrap(), 28);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serialized_records_round_trip(
                a in any::<i8>(),
                b in any::<i16>(),
                c in any::<i32>(),
                d in any::<i64>(),
                e in any::<u16>(),
                g in any::<u64>(),
                h in -1.0e9f64..1.0e9,
                text in "[a-zA-Z0-9]{0,7}",
                bits in 0i64..4096,
            ) {
                let registry = registry();
                let mut rec = RecordObject::new(&registry, "sample").unwrap();
                rec.set_integer("i8", 0, i64::from(a)).unwrap();
                rec.set_integer("i16", 0, i64::from(b)).unwrap();
                rec.set_integer("i32", 1, i64::from(c)).unwrap();
                rec.set_integer("i64", 0, d).unwrap();
                rec.set_integer("u16", 0, i64::from(e)).unwrap();
                rec.set::<u64>(&rec.field("u64").unwrap(), 0, g).unwrap();
                rec.set_real("d", 1, h).unwrap();
                rec.set_text("s", 0, &text).unwrap();
                rec.set_integer("bits", 0, bits).unwrap();

                let wire = rec.serialize(SerialMode::Copy).into_owned();
                let back = RecordObject::deserialize(&registry, &wire).unwrap();

                for def in rec.definition().fields() {
                    if def.field.flags.contains(FieldFlags::POINTER) {
                        continue;
                    }
                    for element in 0..def.field.count.max(1) {
                        if matches!(def.field.field_type, FieldType::String | FieldType::BitField) && element > 0 {
                            break;
                        }
                        prop_assert_eq!(
                            rec.value_at(&def.field, element).unwrap(),
                            back.value_at(&def.field, element).unwrap()
                        );
                    }
                }
                prop_assert_eq!(back.get_integer("i64", 0).unwrap(), d);
                prop_assert_eq!(back.get_text("s", 0).unwrap(), text);
            }

            #[test]
            fn every_registered_schema_round_trips(seed in proptest::collection::vec(any::<u8>(), 64..512)) {
                const TRAILING: usize = 64;
                let registry = RecordRegistry::with_builtin_records().unwrap();
                registry.define_with(sample_schema()).unwrap();

                for name in registry.names() {
                    let def = registry.get(&name).unwrap();
                    if def.kind().is_ccsds() {
                        continue;
                    }
                    let declared = def.size();
                    let mut rec = RecordObject::from_definition(Arc::clone(&def), declared + TRAILING);
                    for (i, byte) in rec.data_mut().iter_mut().enumerate() {
                        *byte = seed[i % seed.len()];
                    }
                    for fd in def.fields() {
                        if fd.field.flags.contains(FieldFlags::POINTER) {
                            let slot = Field {
                                field_type: FieldType::Int32,
                                count: 1,
                                flags: FieldFlags::NONE,
                                ..fd.field.clone()
                            };
                            rec.set::<i32>(&slot, 0, declared as i32).unwrap();
                        }
                    }

                    let wire = rec.serialize(SerialMode::Copy).into_owned();
                    let back = RecordObject::deserialize(&registry, &wire).unwrap();
                    prop_assert!(back.is_type(&name));
                    prop_assert_eq!(back.allocated_size(), declared + TRAILING);
                    let back_wire = back.serialize(SerialMode::Copy);
                    prop_assert_eq!(back_wire.as_ref(), wire.as_slice());

                    for fd in def.fields() {
                        for element in 0..fd.field.count.clamp(1, 32) {
                            prop_assert_eq!(
                                format!("{:?}", rec.value_at(&fd.field, element)),
                                format!("{:?}", back.value_at(&fd.field, element)),
                                "{}.{}[{}]",
                                name,
                                fd.name,
                                element
                            );
                        }
                    }
                }
            }
        }
    }
}
