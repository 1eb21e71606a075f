//! Container records: several serialized records packed into one buffer.
//!
//! Layout of the data region:
//!
//! ```text
//! rec_cnt:u32  start_of_data:u32  entries[capacity]{rec_offset:u32, rec_size:u32}  payload...
//! ```
//!
//! Entry offsets are relative to the container's data start, and every packed
//! record keeps its own `type\0` prefix.

use std::borrow::Cow;

use super::{RecordObject, RecordRegistry, SchemaBuilder, SerialMode, FieldType};
use crate::{Result, TracklineError};

pub const CONTAINER_REC_TYPE: &str = "conrec";
pub const CONTAINER_ENTRY_REC_TYPE: &str = "conrec.entry";

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 8;

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    let entry = registry.define_with(
        SchemaBuilder::new(CONTAINER_ENTRY_REC_TYPE)
            .field("rec_offset", FieldType::UInt32, 1)
            .field("rec_size", FieldType::UInt32, 1),
    )?;
    registry.define_with(
        SchemaBuilder::new(CONTAINER_REC_TYPE)
            .field("rec_cnt", FieldType::UInt32, 1)
            .field("start_of_data", FieldType::UInt32, 1)
            .user("entries", &entry, 0),
    )?;
    Ok(())
}

/// Fixed-capacity pack of serialized records.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    record: RecordObject,
    capacity: usize,
    count: usize,
    next: usize,
}

impl ContainerRecord {
    /// Container for up to `capacity` records totalling `data_bytes` of wire data.
    pub fn new(registry: &RecordRegistry, capacity: usize, data_bytes: usize) -> Result<Self> {
        let start = HEADER_SIZE + capacity * ENTRY_SIZE;
        let mut record =
            RecordObject::with_size(registry, CONTAINER_REC_TYPE, start + data_bytes)?;
        record.set_integer("start_of_data", 0, start as i64)?;
        Ok(Self { record, capacity, count: 0, next: start })
    }

    /// Adopts a received container record.
    pub fn from_record(record: RecordObject) -> Result<Self> {
        if !record.is_type(CONTAINER_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "container",
                format!("record type '{}' is not a container", record.record_type()),
            ));
        }
        let start = record.get_integer("start_of_data", 0)? as usize;
        let count = record.get_integer("rec_cnt", 0)? as usize;
        let capacity = start.saturating_sub(HEADER_SIZE) / ENTRY_SIZE;
        if count > capacity || start > record.allocated_size() {
            return Err(TracklineError::invalid_data("container", "entry table out of range"));
        }
        let mut container = Self { record, capacity, count, next: start };
        container.next = container
            .entries()?
            .iter()
            .map(|(offset, size)| (offset + size) as usize)
            .max()
            .unwrap_or(start);
        Ok(container)
    }

    /// Packs `rec`; returns `false` when capacity or space is exhausted.
    pub fn append(&mut self, rec: &RecordObject) -> bool {
        if self.count >= self.capacity {
            return false;
        }
        let wire = rec.serialize(SerialMode::Reference);
        let end = self.next + wire.len();
        if end > self.record.allocated_size() {
            return false;
        }
        self.record.data_mut()[self.next..end].copy_from_slice(&wire);

        let slot = self.count;
        let written = self
            .record
            .set_integer(&format!("entries[{slot}].rec_offset"), 0, self.next as i64)
            .and_then(|_| {
                self.record.set_integer(&format!("entries[{slot}].rec_size"), 0, wire.len() as i64)
            })
            .and_then(|_| self.record.set_integer("rec_cnt", 0, (slot + 1) as i64));
        if written.is_err() {
            return false;
        }

        self.count += 1;
        self.next = end;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(rec_offset, rec_size)` of each packed record.
    pub fn entries(&self) -> Result<Vec<(u32, u32)>> {
        (0..self.count)
            .map(|i| {
                let offset = self.record.get_integer(&format!("entries[{i}].rec_offset"), 0)?;
                let size = self.record.get_integer(&format!("entries[{i}].rec_size"), 0)?;
                Ok((offset as u32, size as u32))
            })
            .collect()
    }

    /// Packed records as zero-copy interfaces over the container buffer.
    pub fn records(&self, registry: &RecordRegistry) -> Result<Vec<RecordObject>> {
        let data = self.record.data_bytes();
        self.entries()?
            .into_iter()
            .map(|(offset, size)| {
                let (start, end) = (offset as usize, offset as usize + size as usize);
                if end > data.len() {
                    return Err(TracklineError::buffer_too_small(end, data.len()));
                }
                RecordObject::interface(registry, data.slice(start..end))
            })
            .collect()
    }

    /// Wire form covering only the populated part of the buffer.
    pub fn serialize(&self, mode: SerialMode) -> Cow<'_, [u8]> {
        self.record.serialize_with_size(mode, self.next)
    }

    pub fn record(&self) -> &RecordObject {
        &self.record
    }
}
