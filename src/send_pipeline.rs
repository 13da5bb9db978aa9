use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::trace;

use crate::message::AttemptInfo;
use crate::sequence::SequenceId;

/// The transport-send primitive injected by the owning channel.
///
/// The engine treats messages as opaque; the implementation stamps sequence
///  headers and puts attempts on the wire. Errors returned here are
///  unexpected transport failures and are never treated as protocol faults.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Put one (re)send attempt on the wire
    async fn send_attempt(&self, attempt: AttemptInfo, timeout: Duration) -> anyhow::Result<()>;

    /// Ask the peer for an immediate acknowledgement of the sequence state.
    ///  Used only by the dialect that closes with an explicit handshake.
    async fn request_acknowledgement(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// Correlates every transport call of a connection with its sequence
pub struct SendPipeline {
    sender: Arc<dyn MessageSender>,
    sequence_id: SequenceId,
}

impl SendPipeline {
    pub fn new(sender: Arc<dyn MessageSender>, sequence_id: SequenceId) -> SendPipeline {
        SendPipeline {
            sender,
            sequence_id,
        }
    }

    pub async fn send_attempt(
        &self,
        attempt: AttemptInfo,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        trace!(
            "sequence {}: sending message #{} (attempt {})",
            self.sequence_id,
            attempt.sequence_number,
            attempt.attempt
        );
        self.sender.send_attempt(attempt, timeout).await
    }

    pub async fn request_acknowledgement(&self, timeout: Duration) -> anyhow::Result<()> {
        trace!("sequence {}: requesting acknowledgement", self.sequence_id);
        self.sender.request_acknowledgement(timeout).await
    }
}
