use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::DispatchHandler;
use crate::msgq::{MsgQueues, Publisher, SYS_TIMEOUT};
use crate::record::RecordObject;
use crate::Result;

#[derive(Debug, Clone)]
struct Capture {
    id_filter: Option<i64>,
    last: Option<String>,
}

/// Posts `"field:value"` strings for watched fields.
pub struct CaptureDispatch {
    publisher: Publisher,
    captures: RwLock<HashMap<String, Capture>>,
}

impl CaptureDispatch {
    pub fn new(queues: &Arc<MsgQueues>, output: &str) -> Self {
        Self { publisher: Publisher::new(queues, output), captures: RwLock::new(HashMap::new()) }
    }

    /// Watches `field`; with `id_filter` only records whose id field matches are captured.
    pub fn add_capture(&self, field: &str, id_filter: Option<i64>) {
        self.captures
            .write()
            .insert(field.to_string(), Capture { id_filter, last: None });
    }

    pub fn remove_capture(&self, field: &str) -> bool {
        self.captures.write().remove(field).is_some()
    }

    /// Most recent captured value of `field`.
    pub fn captured(&self, field: &str) -> Option<String> {
        self.captures.read().get(field).and_then(|c| c.last.clone())
    }
}

impl DispatchHandler for CaptureDispatch {
    fn name(&self) -> &str {
        "capture"
    }

    fn process_record(&self, record: &RecordObject, _key: u64) -> Result<()> {
        let mut captures = self.captures.write();
        for (field, capture) in captures.iter_mut() {
            if let Some(id) = capture.id_filter {
                if record.record_id() != Some(id) {
                    continue;
                }
            }
            let value = match record.get_value(field, 0) {
                Ok(value) => value.to_string(),
                Err(_) => continue,
            };
            let line = format!("{field}:{value}");
            if let Err(e) = self.publisher.post_copy(line.as_bytes(), SYS_TIMEOUT) {
                warn!(queue = self.publisher.name(), field = %field, error = ?e, "capture dropped");
            } else {
                debug!(field = %field, value = %value, "captured");
            }
            capture.last = Some(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::msgq::{Subscriber, SubscriberKind, Timeout};
    use crate::record::{ExceptionRecord, FieldType, RecordRegistry, SchemaBuilder};

    #[test]
    fn captures_field_values() {
        let queues = Arc::new(MsgQueues::new());
        let registry = RecordRegistry::with_builtin_records().unwrap();
        let mut out = Subscriber::new(&queues, "captureq", SubscriberKind::Confidence);

        let capture = CaptureDispatch::new(&queues, "captureq");
        capture.add_capture("code", None);
        let rec = ExceptionRecord::new(-3, Severity::Error, "missing").to_record(&registry).unwrap();
        capture.process_record(&rec, 0).unwrap();

        let msg = out.receive_ref(Timeout::Never).unwrap();
        assert_eq!(&*msg, b"code:-3");
        assert_eq!(capture.captured("code").as_deref(), Some("-3"));
        assert!(capture.remove_capture("code"));
        assert!(capture.captured("code").is_none());
    }

    #[test]
    fn id_filter_skips_other_records() {
        let queues = Arc::new(MsgQueues::new());
        let registry = RecordRegistry::new();
        registry
            .define_with(
                SchemaBuilder::new("hk")
                    .field("apid", FieldType::UInt16, 1)
                    .field("temp", FieldType::Double, 1)
                    .id_field("apid"),
            )
            .unwrap();
        let mut out = Subscriber::new(&queues, "captureq", SubscriberKind::Confidence);
        let capture = CaptureDispatch::new(&queues, "captureq");
        capture.add_capture("temp", Some(5));

        let mut rec = RecordObject::new(&registry, "hk").unwrap();
        rec.set_integer("apid", 0, 4).unwrap();
        rec.set_real("temp", 0, 20.5).unwrap();
        capture.process_record(&rec, 0).unwrap();
        assert!(out.is_empty());

        rec.set_integer("apid", 0, 5).unwrap();
        capture.process_record(&rec, 0).unwrap();
        assert_eq!(&*out.receive_ref(Timeout::Never).unwrap(), b"temp:20.5");
    }
}
