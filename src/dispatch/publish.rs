use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::DispatchHandler;
use crate::msgq::{MsgQueues, PostError, Publisher, SYS_TIMEOUT};
use crate::record::{RecordObject, SerialMode};
use crate::Result;

/// Re-posts every record it receives onto an output queue.
pub struct PublisherDispatch {
    publisher: Publisher,
    forward_terminator: bool,
    active: CancellationToken,
}

impl PublisherDispatch {
    pub fn new(queues: &Arc<MsgQueues>, output: &str, forward_terminator: bool) -> Self {
        Self {
            publisher: Publisher::new(queues, output),
            forward_terminator,
            active: CancellationToken::new(),
        }
    }

    /// Aborts any post currently retrying.
    pub fn cancel(&self) {
        self.active.cancel();
    }

    fn post(&self, data: &[u8]) -> Result<()> {
        loop {
            match self.publisher.post_copy(data, SYS_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(PostError::Timeout) if !self.active.is_cancelled() => {
                    warn!(queue = self.publisher.name(), "output queue full, retrying");
                }
                Err(e) => {
                    error!(critical = true, queue = self.publisher.name(), error = ?e, "failed to publish record");
                    return Err(e.into_error(self.publisher.name()));
                }
            }
        }
    }
}

impl DispatchHandler for PublisherDispatch {
    fn name(&self) -> &str {
        "publish"
    }

    fn process_record(&self, record: &RecordObject, _key: u64) -> Result<()> {
        self.post(&record.serialize(SerialMode::Reference))
    }

    fn process_termination(&self) -> Result<()> {
        if self.forward_terminator {
            self.post(&[])?;
        }
        Ok(())
    }
}
