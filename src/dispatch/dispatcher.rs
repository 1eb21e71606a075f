//! Worker pool pulling raw buffers from one queue and dispatching records.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CalcFunctions, DispatchHandler, HandlerPolicy, KeyMode, RecordFactory};
use crate::config::DispatcherConfig;
use crate::msgq::{MsgQueues, RecvError, SYS_TIMEOUT, Subscriber, SubscriberKind, Timeout};
use crate::record::{ContainerRecord, RecordObject, RecordRegistry, container::CONTAINER_REC_TYPE};
use crate::stats::{Counters, StatsSnapshot};
use crate::{Result, TracklineError};

const HEX_DUMP_BYTES: usize = 32;

/// Multi-threaded record dispatcher.
///
/// Workers compete for messages on a single input FIFO. A zero-length
/// terminator stops every worker; the last one to exit calls
/// [`DispatchHandler::process_termination`] once per attached handler.
pub struct RecordDispatcher {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    registry: Arc<RecordRegistry>,
    calc: Arc<CalcFunctions>,
    input: String,
    key_mode: KeyMode,
    factory: Box<dyn RecordFactory>,
    num_threads: usize,
    policy: HandlerPolicy,
    receive_timeout: Timeout,
    subscriber: Mutex<Subscriber>,
    routes: RwLock<HashMap<String, Vec<Arc<dyn DispatchHandler>>>>,
    handlers: RwLock<Vec<Arc<dyn DispatchHandler>>>,
    active: CancellationToken,
    started: Mutex<bool>,
    receipt_key: Mutex<u64>,
    completion: Mutex<usize>,
    complete: Condvar,
    counters: Counters,
}

impl RecordDispatcher {
    pub fn new(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        input: &str,
        key_mode: KeyMode,
        num_threads: usize,
        factory: Box<dyn RecordFactory>,
    ) -> Result<Self> {
        Self::build(
            queues,
            registry,
            &DispatcherConfig {
                input_queue: input.to_string(),
                num_threads,
                key_mode,
                ..DispatcherConfig::default()
            },
            factory,
            Arc::new(CalcFunctions::new()),
        )
    }

    /// Dispatcher described by a config block.
    pub fn from_config(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        config: &DispatcherConfig,
        calc: Arc<CalcFunctions>,
    ) -> Result<Self> {
        Self::build(queues, registry, config, config.record_format.factory(), calc)
    }

    fn build(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        config: &DispatcherConfig,
        factory: Box<dyn RecordFactory>,
        calc: Arc<CalcFunctions>,
    ) -> Result<Self> {
        if config.num_threads < 1 {
            return Err(TracklineError::config(format!(
                "dispatcher '{}' needs at least one thread",
                config.input_queue
            )));
        }
        if let KeyMode::Calculated(name) = &config.key_mode {
            if calc.get(name).is_none() {
                return Err(TracklineError::config(format!(
                    "unknown key calculation function '{name}'"
                )));
            }
        }

        // Workers must wake to observe a terminator taken by a peer.
        let receive_timeout = match Timeout::from_millis(config.receive_timeout_ms) {
            Timeout::Forever => SYS_TIMEOUT,
            timeout => timeout,
        };
        let subscriber = Subscriber::new(queues, &config.input_queue, SubscriberKind::Confidence);
        Ok(Self {
            inner: Arc::new(Inner {
                registry: Arc::clone(registry),
                calc,
                input: config.input_queue.clone(),
                key_mode: config.key_mode.clone(),
                factory,
                num_threads: config.num_threads,
                policy: config.policy,
                receive_timeout,
                subscriber: Mutex::new(subscriber),
                routes: RwLock::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
                active: CancellationToken::new(),
                started: Mutex::new(false),
                receipt_key: Mutex::new(0),
                completion: Mutex::new(0),
                complete: Condvar::new(),
                counters: Counters::with_names(&[
                    "records_dispatched",
                    "records_invalid",
                    "handler_failures",
                    "timeouts",
                ]),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Routes records of `record_type` to `handler`, after any handlers already attached.
    pub fn attach(&self, handler: Arc<dyn DispatchHandler>, record_type: &str) -> Result<()> {
        if *self.inner.started.lock() {
            return Err(TracklineError::config(format!(
                "cannot attach '{}' to running dispatcher '{}'",
                handler.name(),
                self.inner.input
            )));
        }
        let mut handlers = self.inner.handlers.write();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(Arc::clone(&handler));
        }
        self.inner.routes.write().entry(record_type.to_string()).or_default().push(handler);
        Ok(())
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> Result<()> {
        let mut started = self.inner.started.lock();
        if *started {
            return Err(TracklineError::config(format!(
                "dispatcher '{}' already started",
                self.inner.input
            )));
        }

        let mut threads = self.threads.lock();
        for i in 0..self.inner.num_threads {
            let inner = Arc::clone(&self.inner);
            let subscriber = self.inner.subscriber.lock().clone();
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{}-{i}", self.inner.input))
                .spawn(move || inner.worker(subscriber))?;
            threads.push(handle);
        }
        *started = true;
        info!(
            queue = %self.inner.input,
            threads = self.inner.num_threads,
            key_mode = %self.inner.key_mode,
            "dispatcher started"
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.inner.active.is_cancelled()
    }

    /// Waits until every worker has exited and termination hooks have run.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.completion.lock();
        while *done < self.inner.num_threads {
            if self.inner.complete.wait_until(&mut done, deadline).timed_out() {
                return *done >= self.inner.num_threads;
            }
        }
        true
    }

    /// Clears the active flag and joins the worker threads.
    pub fn stop(&self) {
        self.inner.active.cancel();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!(queue = %self.inner.input, "dispatcher worker panicked");
            }
        }
    }

    /// Discards every message waiting on the input queue.
    pub fn drain(&self) -> usize {
        self.inner.subscriber.lock().drain()
    }

    pub fn stats(&self, clear: bool) -> StatsSnapshot {
        self.inner.counters.snapshot(clear)
    }
}

impl Drop for RecordDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn worker(&self, mut subscriber: Subscriber) {
        debug!(queue = %self.input, "dispatch worker started");
        let mut in_error = false;

        while !self.active.is_cancelled() {
            match subscriber.receive_ref(self.receive_timeout) {
                Ok(msg) if msg.is_terminator() => {
                    info!(queue = %self.input, "terminator received");
                    self.active.cancel();
                }
                Ok(msg) => match self.factory.create(&self.registry, msg.bytes().clone()) {
                    Ok(record) => {
                        in_error = false;
                        if let Err(e) = self.dispatch(&record) {
                            self.counters.incr("handler_failures");
                            error!(queue = %self.input, record_type = record.record_type(), error = %e, "dispatch failed");
                            if self.policy == HandlerPolicy::StopOnFailure {
                                self.active.cancel();
                            }
                        }
                    }
                    Err(e) => {
                        self.counters.incr("records_invalid");
                        if !in_error {
                            error!(
                                queue = %self.input,
                                size = msg.len(),
                                head = %hex_dump(msg.bytes()),
                                error = %e,
                                "failed to create record"
                            );
                            in_error = true;
                        }
                    }
                },
                Err(RecvError::Timeout) => {
                    self.counters.incr("timeouts");
                    for handler in self.handlers.read().iter() {
                        if let Err(e) = handler.process_timeout() {
                            warn!(handler = handler.name(), error = %e, "timeout hook failed");
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.input, error = %e, "receive failed, stopping worker");
                    break;
                }
            }
        }

        let mut done = self.completion.lock();
        *done += 1;
        if *done == self.num_threads {
            for handler in self.handlers.read().iter() {
                if let Err(e) = handler.process_termination() {
                    error!(handler = handler.name(), error = %e, "termination hook failed");
                }
            }
            info!(queue = %self.input, "dispatcher complete");
            self.complete.notify_all();
        }
    }

    /// Unpacks containers, then runs the handlers attached to the record's type in order.
    fn dispatch(&self, record: &RecordObject) -> Result<()> {
        let mut result = Ok(());
        if record.is_type(CONTAINER_REC_TYPE) {
            let container = ContainerRecord::from_record(record.clone())?;
            for sub in container.records(&self.registry)? {
                if let Err(e) = self.dispatch(&sub) {
                    warn!(queue = %self.input, record_type = sub.record_type(), error = %e, "contained record failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                    if self.policy == HandlerPolicy::StopOnFailure {
                        return result;
                    }
                }
            }
        }

        let handlers = match self.routes.read().get(record.record_type()) {
            Some(handlers) => handlers.clone(),
            None => return result,
        };
        let key = self.key(record)?;
        self.counters.incr("records_dispatched");

        for handler in handlers {
            if let Err(e) = handler.process_record(record, key) {
                warn!(handler = handler.name(), key, error = %e, "handler failed");
                if result.is_ok() {
                    result = Err(e);
                }
                if self.policy == HandlerPolicy::StopOnFailure {
                    break;
                }
            }
        }
        result
    }

    fn key(&self, record: &RecordObject) -> Result<u64> {
        match &self.key_mode {
            KeyMode::ReceiptOrder => {
                let mut key = self.receipt_key.lock();
                let current = *key;
                *key += 1;
                Ok(current)
            }
            KeyMode::FieldValue(field) => Ok(record.get_integer(field, 0)? as u64),
            KeyMode::Calculated(name) => {
                let func = self.calc.get(name).ok_or_else(|| {
                    TracklineError::config(format!("unknown key calculation function '{name}'"))
                })?;
                Ok(func(record))
            }
        }
    }
}

/// Hex rendering of the leading bytes of an unparseable buffer.
pub(crate) fn hex_dump(bytes: &Bytes) -> String {
    bytes.iter().take(HEX_DUMP_BYTES).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}
