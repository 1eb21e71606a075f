//! In-process message queues carrying reference-counted byte buffers.
//!
//! Queues are named and live in a [`MsgQueues`] registry. Every [`Subscriber`]
//! owns a bounded FIFO and sees every message posted after it subscribed;
//! cloning a subscriber adds a competing consumer on the same FIFO.
//!
//! ## Flow control
//!
//! - **Confidence** subscribers apply back-pressure: a post waits (up to its
//!   timeout) until every confidence FIFO has room.
//! - **Opportunity** subscribers never block a publisher; a full FIFO simply
//!   misses the message.
//!
//! A zero-length message is the end-of-stream terminator.
//!
//! ```rust
//! use std::sync::Arc;
//! use trackline::msgq::{MsgQueues, Publisher, Subscriber, SubscriberKind, Timeout};
//!
//! let queues = Arc::new(MsgQueues::new());
//! let mut sub = Subscriber::new(&queues, "resultq", SubscriberKind::Confidence);
//! let publisher = Publisher::new(&queues, "resultq");
//!
//! publisher.post_copy(b"atl06rec\0...", Timeout::Never).unwrap();
//! publisher.post_copy(&[], Timeout::Never).unwrap();
//!
//! let msg = sub.receive_ref(Timeout::Never).unwrap();
//! assert_eq!(&msg[..8], b"atl06rec");
//! assert!(sub.receive_ref(Timeout::Never).unwrap().is_terminator());
//! ```

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::TracklineError;

/// Default FIFO depth of a subscriber.
pub const DEFAULT_DEPTH: usize = 10_000;

/// Largest message accepted by a post.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Standard bounded wait used by pipeline loops.
pub const SYS_TIMEOUT: Timeout = Timeout::After(Duration::from_secs(1));

/// How long a post or receive may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately
    Never,
    After(Duration),
    /// Block until the operation completes
    Forever,
}

impl Timeout {
    /// Millisecond convention: 0 is non-blocking, negative blocks forever.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Timeout::Never,
            ms if ms < 0 => Timeout::Forever,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::After(d) => Some(Instant::now() + *d),
            _ => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() { Timeout::Never } else { Timeout::After(d) }
    }
}

/// Why a post did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("timed out waiting for queue space")]
    Timeout,
    #[error("queue full")]
    Full,
    #[error("queue has no subscribers")]
    NoSubscribers,
    #[error("message of {0} bytes exceeds maximum size")]
    SizeError(usize),
}

/// Why a receive did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("message of {0} bytes does not fit the receive buffer")]
    SizeError(usize),
}

/// Bytes posted, or why the post failed.
pub type PostStatus = Result<usize, PostError>;

impl PostError {
    pub fn into_error(self, queue: &str) -> TracklineError {
        match self {
            PostError::Timeout => TracklineError::queue_timeout(queue),
            PostError::Full => TracklineError::queue_full(queue),
            other => TracklineError::post_failure(queue, other.to_string()),
        }
    }
}

/// Back-pressure behaviour of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SubscriberKind {
    #[default]
    Confidence,
    Opportunity,
}

/// A received message; the buffer reference is released on drop.
#[derive(Debug, Clone)]
pub struct MessageRef {
    bytes: Bytes,
}

impl MessageRef {
    /// Zero-length messages mark end of stream.
    pub fn is_terminator(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl Deref for MessageRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug)]
struct Fifo {
    kind: SubscriberKind,
    messages: VecDeque<Bytes>,
    handles: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    fifos: HashMap<u64, Fifo>,
    next_id: u64,
    publishers: usize,
}

#[derive(Debug)]
struct Queue {
    name: String,
    depth: usize,
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
}

/// Registry of named queues.
#[derive(Debug)]
pub struct MsgQueues {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    depths: Mutex<HashMap<String, usize>>,
    default_depth: usize,
}

impl Default for MsgQueues {
    fn default() -> Self {
        Self::with_default_depth(DEFAULT_DEPTH)
    }
}

impl MsgQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_depth(depth: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            depths: Mutex::new(HashMap::new()),
            default_depth: depth.max(1),
        }
    }

    /// Sets the FIFO depth used when `name` is next created.
    pub fn configure_depth(&self, name: &str, depth: usize) {
        self.depths.lock().insert(name.to_string(), depth.max(1));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.queues.lock().contains_key(name)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.queues.lock().get(name).map(|q| q.state.lock().fifos.len()).unwrap_or(0)
    }

    /// Names of live queues, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs `attach` on the named queue under the registry lock, creating it if needed.
    fn attach<T>(&self, name: &str, attach: impl FnOnce(&mut QueueState) -> T) -> (Arc<Queue>, T) {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let depth = self.depths.lock().get(name).copied().unwrap_or(self.default_depth);
                debug!(queue = name, depth, "queue created");
                Arc::new(Queue {
                    name: name.to_string(),
                    depth,
                    state: Mutex::new(QueueState::default()),
                    readable: Condvar::new(),
                    writable: Condvar::new(),
                })
            })
            .clone();
        let out = {
            let mut state = queue.state.lock();
            attach(&mut *state)
        };
        (queue, out)
    }

    /// Runs `detach` under the registry lock and drops the queue once unused.
    fn detach(&self, queue: &Arc<Queue>, detach: impl FnOnce(&mut QueueState)) {
        let mut queues = self.queues.lock();
        let unused = {
            let mut state = queue.state.lock();
            detach(&mut *state);
            state.publishers == 0 && state.fifos.is_empty()
        };
        queue.writable.notify_all();
        if unused && queues.get(&queue.name).is_some_and(|q| Arc::ptr_eq(q, queue)) {
            queues.remove(&queue.name);
            debug!(queue = %queue.name, "queue removed");
        }
    }
}

/// Posting handle on a named queue.
#[derive(Debug)]
pub struct Publisher {
    queues: Arc<MsgQueues>,
    queue: Arc<Queue>,
}

impl Publisher {
    pub fn new(queues: &Arc<MsgQueues>, name: &str) -> Self {
        let (queue, ()) = queues.attach(name, |state| state.publishers += 1);
        Self { queues: Arc::clone(queues), queue }
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.queue.state.lock().fifos.len()
    }

    /// Copies `data` into the queue.
    pub fn post_copy(&self, data: &[u8], timeout: Timeout) -> PostStatus {
        self.post_ref(Bytes::copy_from_slice(data), timeout)
    }

    /// Posts a shared buffer without copying.
    pub fn post_ref(&self, data: Bytes, timeout: Timeout) -> PostStatus {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(PostError::SizeError(data.len()));
        }
        let deadline = timeout.deadline();
        let depth = self.queue.depth;
        let mut state = self.queue.state.lock();
        loop {
            if state.fifos.is_empty() {
                return Err(PostError::NoSubscribers);
            }
            let blocked = state
                .fifos
                .values()
                .any(|f| f.kind == SubscriberKind::Confidence && f.messages.len() >= depth);
            if !blocked {
                for fifo in state.fifos.values_mut() {
                    if fifo.messages.len() < depth {
                        fifo.messages.push_back(data.clone());
                    }
                }
                drop(state);
                self.queue.readable.notify_all();
                return Ok(data.len());
            }
            match (timeout, deadline) {
                (Timeout::Never, _) => return Err(PostError::Full),
                (_, Some(deadline)) => {
                    if self.queue.writable.wait_until(&mut state, deadline).timed_out() {
                        return Err(PostError::Timeout);
                    }
                }
                _ => self.queue.writable.wait(&mut state),
            }
        }
    }

    /// Posts the zero-length terminator.
    pub fn post_terminator(&self, timeout: Timeout) -> PostStatus {
        self.post_ref(Bytes::new(), timeout)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.queues.detach(&self.queue, |state| state.publishers -= 1);
    }
}

/// Receiving handle owning (or sharing, when cloned) one FIFO.
#[derive(Debug)]
pub struct Subscriber {
    queues: Arc<MsgQueues>,
    queue: Arc<Queue>,
    id: u64,
}

impl Subscriber {
    pub fn new(queues: &Arc<MsgQueues>, name: &str, kind: SubscriberKind) -> Self {
        let (queue, id) = queues.attach(name, |state| {
            let id = state.next_id;
            state.next_id += 1;
            state.fifos.insert(id, Fifo { kind, messages: VecDeque::new(), handles: 1 });
            id
        });
        Self { queues: Arc::clone(queues), queue, id }
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    /// Messages waiting in this FIFO.
    pub fn len(&self) -> usize {
        self.queue.state.lock().fifos.get(&self.id).map(|f| f.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receives the next message without copying it.
    pub fn receive_ref(&mut self, timeout: Timeout) -> Result<MessageRef, RecvError> {
        let deadline = timeout.deadline();
        let mut state = self.queue.state.lock();
        loop {
            if let Some(bytes) = state.fifos.get_mut(&self.id).and_then(|f| f.messages.pop_front())
            {
                drop(state);
                self.queue.writable.notify_all();
                return Ok(MessageRef { bytes });
            }
            match (timeout, deadline) {
                (Timeout::Never, _) => return Err(RecvError::Timeout),
                (_, Some(deadline)) => {
                    if self.queue.readable.wait_until(&mut state, deadline).timed_out() {
                        let ready = state.fifos.get(&self.id).is_some_and(|f| !f.messages.is_empty());
                        if !ready {
                            return Err(RecvError::Timeout);
                        }
                    }
                }
                _ => self.queue.readable.wait(&mut state),
            }
        }
    }

    /// Receives the next message into `buf`, returning its length.
    ///
    /// A message larger than `buf` is consumed and reported as a size error.
    pub fn receive_copy(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<usize, RecvError> {
        let msg = self.receive_ref(timeout)?;
        let dst = buf.get_mut(..msg.len()).ok_or(RecvError::SizeError(msg.len()))?;
        dst.copy_from_slice(&msg);
        Ok(msg.len())
    }

    /// Discards every queued message, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let dropped = {
            let mut state = self.queue.state.lock();
            state
                .fifos
                .get_mut(&self.id)
                .map(|f| std::mem::take(&mut f.messages).len())
                .unwrap_or(0)
        };
        self.queue.writable.notify_all();
        dropped
    }
}

impl Clone for Subscriber {
    /// Competing consumer on the same FIFO.
    fn clone(&self) -> Self {
        if let Some(fifo) = self.queue.state.lock().fifos.get_mut(&self.id) {
            fifo.handles += 1;
        }
        Self { queues: Arc::clone(&self.queues), queue: Arc::clone(&self.queue), id: self.id }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let id = self.id;
        self.queues.detach(&self.queue, |state| {
            let gone = match state.fifos.get_mut(&id) {
                Some(fifo) => {
                    fifo.handles -= 1;
                    fifo.handles == 0
                }
                None => false,
            };
            if gone {
                state.fifos.remove(&id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn every_subscriber_sees_every_message() {
        let queues = Arc::new(MsgQueues::new());
        let mut a = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        let mut b = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        let publisher = Publisher::new(&queues, "q");

        for i in 0..3u8 {
            assert_eq!(publisher.post_copy(&[i; 4], Timeout::Never), Ok(4));
        }
        for sub in [&mut a, &mut b] {
            for i in 0..3u8 {
                assert_eq!(&*sub.receive_ref(Timeout::Never).unwrap(), &[i; 4]);
            }
            assert_eq!(sub.receive_ref(Timeout::Never).unwrap_err(), RecvError::Timeout);
        }
    }

    #[test]
    fn cloned_subscribers_compete() {
        let queues = Arc::new(MsgQueues::new());
        let mut a = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        let mut b = a.clone();
        let publisher = Publisher::new(&queues, "q");
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.post_copy(b"one", Timeout::Never).unwrap();
        publisher.post_copy(b"two", Timeout::Never).unwrap();
        assert_eq!(&*a.receive_ref(Timeout::Never).unwrap(), b"one");
        assert_eq!(&*b.receive_ref(Timeout::Never).unwrap(), b"two");
        assert!(a.receive_ref(Timeout::Never).is_err());
    }

    #[test]
    fn full_confidence_fifo_blocks_and_opportunity_skips() {
        let queues = Arc::new(MsgQueues::with_default_depth(2));
        let mut lazy = Subscriber::new(&queues, "q", SubscriberKind::Opportunity);
        let publisher = Publisher::new(&queues, "q");
        for _ in 0..5 {
            assert!(publisher.post_copy(b"x", Timeout::Never).is_ok());
        }
        assert_eq!(lazy.len(), 2);

        let mut strict = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        publisher.post_copy(b"y", Timeout::Never).unwrap();
        publisher.post_copy(b"y", Timeout::Never).unwrap();
        let full = publisher.post_copy(b"z", Timeout::Never).unwrap_err();
        assert_eq!(full, PostError::Full);
        let err = full.into_error(publisher.name());
        assert!(matches!(err, TracklineError::QueueFull { ref queue } if queue == "q"));
        assert!(err.is_retryable());
        assert_eq!(
            publisher.post_copy(b"z", Timeout::After(Duration::from_millis(20))),
            Err(PostError::Timeout)
        );

        assert_eq!(strict.drain(), 2);
        assert_eq!(lazy.drain(), 2);
        assert_eq!(publisher.post_copy(b"z", Timeout::Never), Ok(1));
    }

    #[test]
    fn blocked_post_resumes_when_consumer_reads() {
        let queues = Arc::new(MsgQueues::with_default_depth(1));
        let mut sub = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        let publisher = Publisher::new(&queues, "q");
        publisher.post_copy(b"first", Timeout::Never).unwrap();

        let handle = thread::spawn(move || publisher.post_copy(b"second", Timeout::Forever));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(&*sub.receive_ref(Timeout::Forever).unwrap(), b"first");
        assert_eq!(handle.join().unwrap(), Ok(6));
        assert_eq!(&*sub.receive_ref(SYS_TIMEOUT).unwrap(), b"second");
    }

    #[test]
    fn terminator_is_a_zero_length_message() {
        let queues = Arc::new(MsgQueues::new());
        let mut sub = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
        let publisher = Publisher::new(&queues, "q");
        assert_eq!(publisher.post_terminator(Timeout::Never), Ok(0));

        let msg = sub.receive_ref(Timeout::Never).unwrap();
        assert!(msg.is_terminator());
        let mut buf = [0u8; 4];
        publisher.post_copy(b"toolong", Timeout::Never).unwrap();
        assert_eq!(sub.receive_copy(&mut buf, Timeout::Never), Err(RecvError::SizeError(7)));
    }

    #[test]
    fn posting_without_subscribers_fails() {
        let queues = Arc::new(MsgQueues::new());
        let publisher = Publisher::new(&queues, "q");
        assert_eq!(publisher.post_copy(b"x", Timeout::Never), Err(PostError::NoSubscribers));
        assert_eq!(
            PostError::NoSubscribers.into_error("q").code(),
            crate::error::codes::ERROR
        );
    }

    #[test]
    fn unused_queues_are_removed() {
        let queues = Arc::new(MsgQueues::new());
        queues.configure_depth("q", 3);
        {
            let publisher = Publisher::new(&queues, "q");
            let _sub = Subscriber::new(&queues, "q", SubscriberKind::Confidence);
            assert!(queues.exists("q"));
            assert_eq!(queues.subscriber_count("q"), 1);
            drop(publisher);
            assert!(queues.exists("q"));
        }
        assert!(!queues.exists("q"));
        assert!(queues.names().is_empty());
    }

    #[test]
    fn millisecond_timeouts_follow_convention() {
        assert_eq!(Timeout::from_millis(0), Timeout::Never);
        assert_eq!(Timeout::from_millis(-1), Timeout::Forever);
        assert_eq!(Timeout::from_millis(250), Timeout::After(Duration::from_millis(250)));
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::Never);
    }
}
