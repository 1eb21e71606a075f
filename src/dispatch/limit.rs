//! Range checks on a single field with violation records.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use super::DispatchHandler;
use crate::error::Severity;
use crate::msgq::{MsgQueues, Publisher, SYS_TIMEOUT};
use crate::record::{FieldType, RecordObject, RecordRegistry, SerialMode, SchemaBuilder};
use crate::{Result, TracklineError};

pub const LIMIT_REC_TYPE: &str = "limitrec";
const MAX_NAME: usize = 64;

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    registry.define_with(
        SchemaBuilder::new(LIMIT_REC_TYPE)
            .field("limit_min", FieldType::UInt8, 1)
            .field("limit_max", FieldType::UInt8, 1)
            .field("id", FieldType::Int64, 1)
            .field("d_min", FieldType::Double, 1)
            .field("d_max", FieldType::Double, 1)
            .field("d_val", FieldType::Double, 1)
            .field("field_name", FieldType::String, MAX_NAME)
            .field("record_name", FieldType::String, MAX_NAME),
    )?;
    Ok(())
}

/// Limit check definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub field: String,
    /// Only check records whose id field equals this value
    pub id_filter: Option<i64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub level: Severity,
    pub limit_queue: Option<String>,
    /// Receives a copy of each violating record
    pub deep_queue: Option<String>,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            field: String::new(),
            id_filter: None,
            min: None,
            max: None,
            level: Severity::Error,
            limit_queue: None,
            deep_queue: None,
        }
    }
}

pub struct LimitDispatch {
    config: LimitConfig,
    registry: Arc<RecordRegistry>,
    limit_pub: Option<Publisher>,
    deep_pub: Option<Publisher>,
    warned_missing: AtomicBool,
}

impl LimitDispatch {
    pub fn new(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        config: LimitConfig,
    ) -> Result<Self> {
        if config.field.is_empty() {
            return Err(TracklineError::config("limit check requires a field name"));
        }
        if let (Some(min), Some(max)) = (config.min, config.max) {
            if min > max {
                return Err(TracklineError::config(format!(
                    "limit on '{}' has min {min} above max {max}",
                    config.field
                )));
            }
        }
        Ok(Self {
            limit_pub: config.limit_queue.as_deref().map(|q| Publisher::new(queues, q)),
            deep_pub: config.deep_queue.as_deref().map(|q| Publisher::new(queues, q)),
            registry: Arc::clone(registry),
            config,
            warned_missing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    fn report(&self, record: &RecordObject, value: f64, below: bool) -> Result<()> {
        let cfg = &self.config;
        let (min, max) = (cfg.min.unwrap_or(f64::NEG_INFINITY), cfg.max.unwrap_or(f64::INFINITY));
        match cfg.level {
            Severity::Debug => debug!(field = %cfg.field, value, min, max, "limit violation"),
            Severity::Info => info!(field = %cfg.field, value, min, max, "limit violation"),
            Severity::Warning => warn!(field = %cfg.field, value, min, max, "limit violation"),
            Severity::Error => error!(field = %cfg.field, value, min, max, "limit violation"),
            Severity::Critical => {
                error!(critical = true, field = %cfg.field, value, min, max, "limit violation")
            }
        }

        if let Some(publisher) = &self.limit_pub {
            let mut violation = RecordObject::new(&self.registry, LIMIT_REC_TYPE)?;
            violation.set_integer("limit_min", 0, i64::from(below))?;
            violation.set_integer("limit_max", 0, i64::from(!below))?;
            violation.set_integer("id", 0, record.record_id().unwrap_or(0))?;
            violation.set_real("d_min", 0, cfg.min.unwrap_or(0.0))?;
            violation.set_real("d_max", 0, cfg.max.unwrap_or(0.0))?;
            violation.set_real("d_val", 0, value)?;
            violation.set_text("field_name", 0, &cfg.field)?;
            violation.set_text("record_name", 0, record.record_type())?;
            publisher
                .post_copy(&violation.serialize(SerialMode::Reference), SYS_TIMEOUT)
                .map_err(|e| e.into_error(publisher.name()))?;
        }

        if let Some(publisher) = &self.deep_pub {
            publisher
                .post_copy(&record.serialize(SerialMode::Copy), SYS_TIMEOUT)
                .map_err(|e| e.into_error(publisher.name()))?;
        }
        Ok(())
    }
}

impl DispatchHandler for LimitDispatch {
    fn name(&self) -> &str {
        "limit"
    }

    fn process_record(&self, record: &RecordObject, _key: u64) -> Result<()> {
        if let Some(id) = self.config.id_filter {
            if record.record_id() != Some(id) {
                return Ok(());
            }
        }

        let value = match record.get_real(&self.config.field, 0) {
            Ok(value) => value,
            Err(e) => {
                if !self.warned_missing.swap(true, Ordering::Relaxed) {
                    warn!(
                        field = %self.config.field,
                        record_type = record.record_type(),
                        error = %e,
                        "limit field unavailable"
                    );
                }
                return Ok(());
            }
        };

        match (self.config.min, self.config.max) {
            (Some(min), _) if value < min => self.report(record, value, true),
            (_, Some(max)) if value > max => self.report(record, value, false),
            _ => Ok(()),
        }
    }
}
