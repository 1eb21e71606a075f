//! Record dispatch: worker threads that turn queued buffers into records and
//! fan them out to attached handlers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackline::dispatch::{CaptureDispatch, KeyMode, RecordDispatcher, GenericFactory};
//! use trackline::msgq::MsgQueues;
//! use trackline::record::RecordRegistry;
//!
//! let queues = Arc::new(MsgQueues::new());
//! let registry = RecordRegistry::with_builtin_records().unwrap();
//! let dispatcher = RecordDispatcher::new(
//!     &queues, &registry, "statusq", KeyMode::ReceiptOrder, 2, Box::new(GenericFactory),
//! ).unwrap();
//!
//! let capture = Arc::new(CaptureDispatch::new(&queues, "captureq"));
//! capture.add_capture("code", None);
//! dispatcher.attach(capture, "exceptrec").unwrap();
//! dispatcher.start().unwrap();
//! ```

mod capture;
mod dispatcher;
mod factory;
pub(crate) mod limit;
mod publish;

pub use capture::CaptureDispatch;
pub use dispatcher::RecordDispatcher;
pub use factory::{CcsdsCommandFactory, CcsdsTelemetryFactory, GenericFactory, RecordFactory, RecordFormat};
pub use limit::{LimitConfig, LimitDispatch, LIMIT_REC_TYPE};
pub use publish::PublisherDispatch;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::record::RecordObject;
use crate::{Result, TracklineError};

/// Pluggable unit invoked by the dispatcher for each record of an attached type.
pub trait DispatchHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one record; `key` is the dispatcher's partition key.
    fn process_record(&self, record: &RecordObject, key: u64) -> Result<()>;

    /// Heartbeat when no record arrived within the receive timeout.
    fn process_timeout(&self) -> Result<()> {
        Ok(())
    }

    /// Called exactly once after every worker thread has exited.
    fn process_termination(&self) -> Result<()> {
        Ok(())
    }
}

/// Partition key source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyMode {
    /// Monotonic counter in receipt order
    ReceiptOrder,
    /// Integer value of the named field
    FieldValue(String),
    /// Named function from [`CalcFunctions`]
    Calculated(String),
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::ReceiptOrder => f.write_str("RECEIPT_KEY"),
            KeyMode::FieldValue(field) => write!(f, "FIELD_KEY:{field}"),
            KeyMode::Calculated(func) => write!(f, "CALCULATED_KEY:{func}"),
        }
    }
}

impl FromStr for KeyMode {
    type Err = TracklineError;

    /// Parses `RECEIPT_KEY`, `FIELD_KEY:<field>` or `CALCULATED_KEY:<function>`.
    fn from_str(s: &str) -> Result<Self> {
        let (mode, parm) = match s.split_once(':') {
            Some((mode, parm)) => (mode.trim(), Some(parm.trim())),
            None => (s.trim(), None),
        };
        match (mode, parm) {
            ("RECEIPT_KEY", _) => Ok(KeyMode::ReceiptOrder),
            ("FIELD_KEY", Some(field)) if !field.is_empty() => {
                Ok(KeyMode::FieldValue(field.to_string()))
            }
            ("CALCULATED_KEY", Some(func)) if !func.is_empty() => {
                Ok(KeyMode::Calculated(func.to_string()))
            }
            _ => Err(TracklineError::config(format!("invalid key mode '{s}'"))),
        }
    }
}

impl TryFrom<String> for KeyMode {
    type Error = TracklineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KeyMode> for String {
    fn from(mode: KeyMode) -> String {
        mode.to_string()
    }
}

/// What a worker does after a handler reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerPolicy {
    /// Log and keep processing
    #[default]
    Continue,
    /// Log and stop the dispatcher
    StopOnFailure,
}

/// Key calculation function.
pub type CalcFn = Arc<dyn Fn(&RecordObject) -> u64 + Send + Sync>;

/// Registry of named key calculation functions.
#[derive(Default)]
pub struct CalcFunctions {
    functions: RwLock<HashMap<String, CalcFn>>,
}

impl CalcFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func`; returns `false` if the name is taken.
    pub fn register(
        &self,
        name: impl Into<String>,
        func: impl Fn(&RecordObject) -> u64 + Send + Sync + 'static,
    ) -> bool {
        let mut functions = self.functions.write();
        let name = name.into();
        if functions.contains_key(&name) {
            return false;
        }
        functions.insert(name, Arc::new(func));
        true
    }

    pub fn get(&self, name: &str) -> Option<CalcFn> {
        self.functions.read().get(name).cloned()
    }
}

impl fmt::Debug for CalcFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.functions.read().keys().cloned().collect();
        f.debug_struct("CalcFunctions").field("functions", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_modes_parse_and_display() {
        assert_eq!("RECEIPT_KEY".parse::<KeyMode>().unwrap(), KeyMode::ReceiptOrder);
        assert_eq!(
            "FIELD_KEY:extent_id".parse::<KeyMode>().unwrap(),
            KeyMode::FieldValue("extent_id".into())
        );
        let calc = KeyMode::Calculated("by_track".into());
        assert_eq!(calc.to_string().parse::<KeyMode>().unwrap(), calc);
        assert!("FIELD_KEY".parse::<KeyMode>().is_err());
        assert!("RANDOM_KEY".parse::<KeyMode>().is_err());
    }

    #[test]
    fn calc_functions_register_once() {
        let calc = CalcFunctions::new();
        assert!(calc.register("zero", |_| 0));
        assert!(!calc.register("zero", |_| 1));
        assert!(calc.get("zero").is_some());
        assert!(calc.get("one").is_none());
    }
}
