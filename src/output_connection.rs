use std::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, ReliableMessagingVersion};
use crate::error::TransferError;
use crate::fault::WsrmFault;
use crate::guard::Guard;
use crate::message::Message;
use crate::range_set::{SequenceRange, SequenceRangeSet};
use crate::send_pipeline::{MessageSender, SendPipeline};
use crate::sequence::{SequenceId, SequenceNumber};
use crate::transmission_strategy::{AddLastOutcome, StrategyEvent, TransmissionStrategy};

/// Events a connection raises to its owner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionEventHandler: Send + Sync + 'static {
    /// A protocol-level fault terminated the connection. Raised exactly once;
    ///  every operation fails fast afterwards.
    async fn on_faulted(&self, fault: WsrmFault);

    /// An unexpected failure during send processing. Not a protocol fault -
    ///  the connection stays up and the owner decides.
    async fn on_exception(&self, error: anyhow::Error);
}

/// The send side of a reliable sequence.
///
/// Accepts application messages, delegates window bookkeeping to the
///  [`TransmissionStrategy`], drives the injected transport-send primitive,
///  runs the dialect-specific termination handshake on close, and converts
///  strategy-reported anomalies into typed faults raised through the
///  registered event handler.
///
/// All transport writes funnel through a single-entrant [`Guard`]: whoever
///  wins `enter` runs the dispatch pass and keeps sending until the strategy
///  has no due entry left, so concurrent triggers (admissions, ack arrivals,
///  timer firings) never produce overlapping writes and never lose work.
pub struct ReliableOutputConnection {
    config: Arc<ConnectionConfig>,
    sequence_id: SequenceId,
    strategy: TransmissionStrategy,
    guard: Guard,
    pipeline: SendPipeline,
    events: Arc<dyn ConnectionEventHandler>,
    faulted: AtomicBool,
    closed: AtomicBool,
}

impl ReliableOutputConnection {
    pub fn new(
        config: Arc<ConnectionConfig>,
        sequence_id: SequenceId,
        sender: Arc<dyn MessageSender>,
        events: Arc<dyn ConnectionEventHandler>,
    ) -> anyhow::Result<Arc<ReliableOutputConnection>> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ReliableOutputConnection {
            strategy: TransmissionStrategy::new(config.clone(), sequence_id, events_tx),
            guard: Guard::new(),
            pipeline: SendPipeline::new(sender, sequence_id),
            config,
            sequence_id,
            events,
            faulted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Self::spawn_event_loop(&connection, events_rx);
        Ok(connection)
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    fn spawn_event_loop(
        connection: &Arc<ReliableOutputConnection>,
        mut events: mpsc::UnboundedReceiver<StrategyEvent>,
    ) {
        let weak = Arc::downgrade(connection);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                match event {
                    StrategyEvent::RetryTimeoutElapsed(attempt) => {
                        trace!(
                            "sequence {}: retry due for message #{}",
                            connection.sequence_id,
                            attempt.sequence_number
                        );
                        connection.run_dispatch_pass().await;
                    }
                    StrategyEvent::RetriesExhausted {
                        sequence_number,
                        attempts,
                    } => {
                        let fault = WsrmFault::sequence_terminated_communication(
                            connection.sequence_id,
                            format!(
                                "message #{} was transmitted {} times without acknowledgement - \
                                 the maximum retry count was exceeded",
                                sequence_number, attempts
                            ),
                        );
                        connection.raise_fault(fault).await;
                    }
                    StrategyEvent::Exception(error) => {
                        connection.events.on_exception(error).await;
                    }
                }
            }
        });
    }

    /// Enqueue an application message and try to put it on the wire right
    ///  away.
    ///
    /// `Ok(false)` means the transmission window stayed full for the whole
    ///  timeout: a retryable admission failure, not a protocol fault.
    ///  If the guard is busy when the message is admitted, the currently
    ///  running dispatch pass picks the message up - nothing is lost.
    pub async fn add_message(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<bool, TransferError> {
        match self.strategy.add(message, timeout).await {
            Ok(_) => {
                self.run_dispatch_pass().await;
                Ok(true)
            }
            Err(TransferError::Timeout { .. }) => Ok(false),
            Err(TransferError::Protocol(fault)) => {
                self.raise_fault(fault.clone()).await;
                Err(TransferError::Protocol(fault))
            }
            Err(other) => Err(other),
        }
    }

    /// Complete the transfer-termination handshake, then wait for the window
    ///  to drain and for in-flight sends to finish - all under one deadline.
    ///
    /// On timeout the connection is left closed but not drained; the caller
    ///  must `abort`.
    pub async fn close(&self, timeout: Duration) -> Result<(), TransferError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        debug!("sequence {}: closing", self.sequence_id);

        match self.config.version {
            ReliableMessagingVersion::February2005 => {
                match self
                    .strategy
                    .add_last(Message::last_marker(), remaining(deadline))
                    .await
                {
                    Ok(AddLastOutcome::Attempt(_)) => self.run_dispatch_pass().await,
                    Ok(_) => {}
                    Err(TransferError::Timeout { .. }) => {
                        // a terminal admission timeout means the sequence can
                        //  never complete - escalate
                        let reason = if self.strategy.remote_quota().await == Some(0) {
                            "the terminating message could not be admitted: the remote \
                             endpoint's receive quota stayed exhausted"
                        } else {
                            "the terminating message could not be admitted: the transmission \
                             window never opened"
                        };
                        let fault = WsrmFault::sequence_terminated(self.sequence_id, reason);
                        self.raise_fault(fault.clone()).await;
                        return Err(TransferError::Protocol(fault));
                    }
                    Err(other) => return Err(other),
                }
                self.strategy.close(remaining(deadline)).await?;
            }
            ReliableMessagingVersion::Version11 => {
                match self
                    .strategy
                    .add_last(Message::last_marker(), remaining(deadline))
                    .await?
                {
                    AddLastOutcome::Drained => {
                        // nothing unacknowledged - the sequence finishes
                        //  without further wire traffic
                        self.strategy.close(remaining(deadline)).await?;
                    }
                    AddLastOutcome::Pending => {
                        // ack request and window drain race toward the shared
                        //  deadline
                        let request = async {
                            self.pipeline
                                .request_acknowledgement(min(
                                    self.config.send_timeout,
                                    remaining(deadline),
                                ))
                                .await
                                .map_err(TransferError::Internal)
                        };
                        let drain = self.strategy.close(remaining(deadline));
                        tokio::try_join!(request, drain)?;
                    }
                    AddLastOutcome::Attempt(_) => {}
                }
            }
        }

        self.guard.close(remaining(deadline)).await?;
        debug!(
            "sequence {}: close complete - every message acknowledged",
            self.sequence_id
        );
        Ok(())
    }

    /// Tear down immediately without waiting for anything in flight
    pub async fn abort(&self) {
        debug!("sequence {}: aborting", self.sequence_id);
        self.closed.store(true, Ordering::SeqCst);
        self.guard.abort();
        self.strategy.abort().await;
    }

    /// Apply acknowledgement ranges delivered by the receiving side
    pub async fn process_transferred(
        &self,
        ranges: &SequenceRangeSet,
        quota_remaining: Option<u32>,
    ) -> Result<(), TransferError> {
        self.apply_transferred(None, ranges, quota_remaining).await
    }

    /// Overload for protocols that report the most recently transferred
    ///  number alongside the ranges
    pub async fn process_transferred_for(
        &self,
        transferred: SequenceNumber,
        ranges: &SequenceRangeSet,
        quota_remaining: Option<u32>,
    ) -> Result<(), TransferError> {
        self.apply_transferred(Some(transferred), ranges, quota_remaining)
            .await
    }

    async fn apply_transferred(
        &self,
        transferred: Option<SequenceNumber>,
        ranges: &SequenceRangeSet,
        quota_remaining: Option<u32>,
    ) -> Result<(), TransferError> {
        let effective = match transferred {
            Some(seq) => ranges.add(SequenceRange::new(seq, seq)),
            None => ranges.clone(),
        };

        let outcome = self.strategy.process_acknowledgement(&effective).await;
        if outcome.invalid {
            let fault = WsrmFault::invalid_acknowledgement(self.sequence_id, effective);
            self.raise_fault(fault.clone()).await;
            return Err(TransferError::Protocol(fault));
        }
        // a non-monotonic ack was already warn'ed by the strategy; it is
        //  tracked but does not fault the connection

        if self.strategy.process_transferred(&effective, quota_remaining).await {
            self.run_dispatch_pass().await;
        }
        Ok(())
    }

    /// True once every message through the terminal number is acknowledged -
    ///  the owner may finalize the connection
    pub async fn check_for_termination(&self) -> bool {
        self.strategy.done_transmitting().await
    }

    /// The single-owner dispatch loop: at most one pass is active per
    ///  connection; the active pass keeps going until no due entry remains.
    async fn run_dispatch_pass(&self) {
        loop {
            if !self.guard.enter() {
                // another pass is running and will visit every due entry
                return;
            }

            let mut transport_failed = false;
            while let Some(attempt) = self.strategy.get_message_info_for_retry().await {
                let sequence_number = attempt.sequence_number;
                match self
                    .pipeline
                    .send_attempt(attempt, self.config.send_timeout)
                    .await
                {
                    Ok(()) => self.strategy.attempt_sent(sequence_number).await,
                    Err(error) => {
                        warn!(
                            "sequence {}: transport send for message #{} failed: {:#}",
                            self.sequence_id, sequence_number, error
                        );
                        // keep the entry armed - the transport may recover by
                        //  the time the retry timer fires
                        self.strategy.attempt_sent(sequence_number).await;
                        self.events.on_exception(error).await;
                        transport_failed = true;
                        break;
                    }
                }
            }
            self.guard.exit();

            if transport_failed || !self.strategy.has_due_entry().await {
                break;
            }
            // a retry became due between the last selection and the guard
            //  exit - it must not be stranded
            trace!("sequence {}: running another dispatch pass", self.sequence_id);
        }

        if self.check_for_termination().await {
            debug!(
                "sequence {}: transfer complete - every message acknowledged",
                self.sequence_id
            );
        }
    }

    async fn raise_fault(&self, fault: WsrmFault) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("sequence {}: {}", self.sequence_id, fault);
        self.strategy.fault(fault.clone()).await;
        self.guard.abort();
        self.events.on_faulted(fault).await;
    }
}

/// Remaining budget of a shared deadline
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
