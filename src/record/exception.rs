//! Structured failure notices ("exceptrec") posted in-band on output queues.

use crate::error::{Severity, TracklineError};
use crate::record::{FieldType, RecordObject, RecordRegistry, SchemaBuilder};
use crate::Result;

pub const EXCEPTION_REC_TYPE: &str = "exceptrec";
pub const MAX_EXCEPTION_TEXT: usize = 256;

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    registry.define_with(
        SchemaBuilder::new(EXCEPTION_REC_TYPE)
            .field("code", FieldType::Int32, 1)
            .field("level", FieldType::Int32, 1)
            .field("text", FieldType::String, MAX_EXCEPTION_TEXT),
    )?;
    Ok(())
}

/// Decoded exception record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRecord {
    pub code: i32,
    pub level: Severity,
    pub text: String,
}

impl ExceptionRecord {
    pub fn new(code: i32, level: Severity, text: impl Into<String>) -> Self {
        Self { code, level, text: text.into() }
    }

    pub fn from_error(err: &TracklineError) -> Self {
        Self::new(err.code(), err.severity(), err.to_string())
    }

    pub fn to_record(&self, registry: &RecordRegistry) -> Result<RecordObject> {
        let mut rec = RecordObject::new(registry, EXCEPTION_REC_TYPE)?;
        rec.set_integer("code", 0, i64::from(self.code))?;
        rec.set_integer("level", 0, self.level as i64)?;
        rec.set_text("text", 0, &self.text)?;
        Ok(rec)
    }

    pub fn from_record(rec: &RecordObject) -> Result<Self> {
        let level = match rec.get_integer("level", 0)? {
            0 => Severity::Debug,
            1 => Severity::Info,
            2 => Severity::Warning,
            3 => Severity::Error,
            _ => Severity::Critical,
        };
        Ok(Self {
            code: rec.get_integer("code", 0)? as i32,
            level,
            text: rec.get_text("text", 0)?,
        })
    }
}
