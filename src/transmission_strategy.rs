use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, ReliableMessagingVersion};
use crate::error::TransferError;
use crate::fault::WsrmFault;
use crate::message::{AttemptInfo, Message};
use crate::range_set::SequenceRangeSet;
use crate::sequence::{SequenceId, SequenceNumber};

/// Notifications from the strategy's timer tasks to the owning connection
#[derive(Debug)]
pub enum StrategyEvent {
    /// A window entry's retry timer expired; the entry is due for
    ///  retransmission
    RetryTimeoutElapsed(AttemptInfo),

    /// A window entry went through its whole retry budget without being
    ///  acknowledged - the peer is considered unreachable
    RetriesExhausted {
        sequence_number: SequenceNumber,
        attempts: u32,
    },

    /// An unexpected internal failure. Must propagate to the owner without
    ///  being mistaken for a protocol fault.
    Exception(anyhow::Error),
}

/// Verdict on an incoming acknowledgement
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AckOutcome {
    /// The ack references sequence numbers that were never transmitted - a
    ///  protocol violation that faults the connection
    pub invalid: bool,

    /// The ack is non-monotonic versus earlier acks. Tracked for diagnostics,
    ///  not enforced.
    pub inconsistent: bool,
}

/// Result of admitting the sequence terminator
#[derive(Debug)]
pub enum AddLastOutcome {
    /// Sentinel dialect: the terminator was admitted into the window and must
    ///  be dispatched like any other message
    Attempt(AttemptInfo),

    /// Handshake dialect: the terminal number is recorded and nothing is left
    ///  to acknowledge - the sequence can finish without further wire traffic
    Drained,

    /// Handshake dialect: the terminal number is recorded but
    ///  acknowledgements are still outstanding
    Pending,
}

enum StrategyState {
    Open,
    /// No further admissions; draining continues until the window is empty
    Closed,
    Faulted(WsrmFault),
    Aborted,
}

struct WindowEntry {
    message: Message,
    /// transmissions handed to the transport so far
    attempt_count: u32,
    /// eligible for (re)send: freshly admitted, or its retry timer fired
    due: bool,
    retry_timer: Option<JoinHandle<()>>,
}

struct StrategyInner {
    window: BTreeMap<SequenceNumber, WindowEntry>,
    next_sequence_number: SequenceNumber,
    /// terminal sequence number, once known
    last: Option<SequenceNumber>,
    /// accumulated acknowledgement ranges over the connection's lifetime
    acked: SequenceRangeSet,
    /// receive quota most recently advertised by the peer
    remote_quota: Option<u32>,
    state: StrategyState,
}

impl StrategyInner {
    fn highest_assigned(&self) -> SequenceNumber {
        SequenceNumber::from_raw(self.next_sequence_number.to_raw() - 1)
    }

    fn has_capacity(&self, config: &ConnectionConfig) -> bool {
        let len = self.window.len();
        len < config.transfer_window_size as usize
            && self.remote_quota.map(|q| len < q as usize).unwrap_or(true)
    }

    fn done_transmitting(&self) -> bool {
        match self.last {
            Some(last) => self.window.is_empty() && final_ack_covers(&self.acked, last),
            None => false,
        }
    }

    fn abort_timers(&mut self) {
        for entry in self.window.values_mut() {
            if let Some(timer) = entry.retry_timer.take() {
                timer.abort();
            }
        }
    }
}

/// Ranges cover every number from 1 through the terminal number with no gaps.
/// A sequence terminated while still empty is trivially consistent.
fn final_ack_covers(acked: &SequenceRangeSet, last: SequenceNumber) -> bool {
    last == SequenceNumber::ZERO || acked.covers(SequenceNumber::ONE, last)
}

/// The sliding-window core of a reliable output connection.
///
/// Assigns monotonically increasing sequence numbers, holds every
///  unacknowledged message with its retry state, selects entries eligible for
///  (re)send, applies incoming acknowledgement ranges, and decides
///  dialect-specific termination. All mutable state lives behind one lock;
///  per-entry retry timers are spawned tasks that report back through the
///  owner's event channel.
pub struct TransmissionStrategy {
    config: Arc<ConnectionConfig>,
    sequence_id: SequenceId,
    inner: Arc<RwLock<StrategyInner>>,
    /// notified whenever window capacity may have changed (ack, close, abort,
    ///  fault) - admission and drain waiters re-check their condition on it
    capacity: Notify,
    events: mpsc::UnboundedSender<StrategyEvent>,
}

impl TransmissionStrategy {
    pub fn new(
        config: Arc<ConnectionConfig>,
        sequence_id: SequenceId,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> TransmissionStrategy {
        TransmissionStrategy {
            config,
            sequence_id,
            inner: Arc::new(RwLock::new(StrategyInner {
                window: BTreeMap::new(),
                next_sequence_number: SequenceNumber::ONE,
                last: None,
                acked: SequenceRangeSet::new(),
                remote_quota: None,
                state: StrategyState::Open,
            })),
            capacity: Notify::new(),
            events,
        }
    }

    /// Admit a message into the transmission window, assigning the next
    ///  sequence number. Suspends while the window is at capacity; expiry of
    ///  `timeout` surfaces as `TransferError::Timeout` for the caller to map.
    pub async fn add(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<AttemptInfo, TransferError> {
        self.add_internal(message, false, timeout).await
    }

    /// Admit the sequence terminator. Dialect-dependent: the sentinel dialect
    ///  admits `message` (marked as last) like a normal add; the handshake
    ///  dialect ignores `message` and records the terminal number instead.
    pub async fn add_last(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<AddLastOutcome, TransferError> {
        match self.config.version {
            ReliableMessagingVersion::February2005 => {
                let attempt = self.add_internal(message, true, timeout).await?;
                Ok(AddLastOutcome::Attempt(attempt))
            }
            ReliableMessagingVersion::Version11 => {
                {
                    let inner = self.inner.read().await;
                    match &inner.state {
                        StrategyState::Open => {}
                        StrategyState::Closed => return Err(TransferError::Closed),
                        StrategyState::Faulted(fault) => {
                            return Err(fault.clone().into_error());
                        }
                        StrategyState::Aborted => return Err(TransferError::Aborted),
                    }
                }
                if self.set_last().await {
                    Ok(AddLastOutcome::Drained)
                } else {
                    Ok(AddLastOutcome::Pending)
                }
            }
        }
    }

    async fn add_internal(
        &self,
        mut message: Message,
        last: bool,
        timeout: Duration,
    ) -> Result<AttemptInfo, TransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            // register with the notifier before checking the condition, so a
            //  notification between check and await cannot be missed
            let capacity_freed = self.capacity.notified();
            tokio::pin!(capacity_freed);
            capacity_freed.as_mut().enable();
            {
                let mut inner = self.inner.write().await;
                match &inner.state {
                    StrategyState::Open => {}
                    StrategyState::Closed => return Err(TransferError::Closed),
                    StrategyState::Faulted(fault) => return Err(fault.clone().into_error()),
                    StrategyState::Aborted => return Err(TransferError::Aborted),
                }
                if inner.last.is_some() {
                    // the terminator has been admitted - the sequence accepts
                    //  nothing further
                    return Err(TransferError::Closed);
                }

                if inner.has_capacity(&self.config) {
                    let sequence_number = inner.next_sequence_number;
                    if sequence_number > SequenceNumber::MAX {
                        return Err(WsrmFault::message_number_rollover(
                            self.sequence_id,
                            SequenceNumber::MAX,
                        )
                        .into_error());
                    }

                    message.assign_sequence_number(sequence_number);
                    if last {
                        message.mark_last();
                        inner.last = Some(sequence_number);
                    }
                    inner.next_sequence_number =
                        SequenceNumber::from_raw(sequence_number.to_raw() + 1);

                    let attempt = AttemptInfo {
                        message: message.clone(),
                        sequence_number,
                        attempt: 0,
                    };
                    inner.window.insert(
                        sequence_number,
                        WindowEntry {
                            message,
                            attempt_count: 0,
                            due: true,
                            retry_timer: None,
                        },
                    );
                    trace!(
                        "sequence {}: admitted message #{} (window {}/{})",
                        self.sequence_id,
                        sequence_number,
                        inner.window.len(),
                        self.config.transfer_window_size
                    );
                    return Ok(attempt);
                }
            }

            trace!(
                "sequence {}: transmission window full - waiting for capacity",
                self.sequence_id
            );
            if timeout_at(deadline, capacity_freed).await.is_err() {
                return Err(TransferError::Timeout {
                    operation: "window admission",
                });
            }
        }
    }

    /// Record the terminal sequence number without transmitting anything.
    /// True iff the window is already fully drained, i.e. the sequence can
    ///  finish immediately.
    pub async fn set_last(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.last.is_none() {
            let last = inner.highest_assigned();
            inner.last = Some(last);
            debug!(
                "sequence {}: terminal message number is #{}",
                self.sequence_id, last
            );
        }
        inner.done_transmitting()
    }

    /// Select the next window entry eligible for (re)send: the oldest due
    ///  entry. `None` is the dispatch loop's termination signal.
    pub async fn get_message_info_for_retry(&self) -> Option<AttemptInfo> {
        let mut inner = self.inner.write().await;
        if matches!(
            inner.state,
            StrategyState::Faulted(_) | StrategyState::Aborted
        ) {
            return None;
        }

        let sequence_number = inner
            .window
            .iter()
            .find(|(_, entry)| entry.due)
            .map(|(seq, _)| *seq)?;
        let entry = inner.window.get_mut(&sequence_number)?;
        entry.due = false;
        entry.attempt_count += 1;
        Some(AttemptInfo {
            message: entry.message.clone(),
            sequence_number,
            attempt: entry.attempt_count,
        })
    }

    /// A transmission of the entry completed - arm its retry timer. On expiry
    ///  the timer re-marks the entry due (or reports retry exhaustion) through
    ///  the event channel.
    pub async fn attempt_sent(&self, sequence_number: SequenceNumber) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.window.get_mut(&sequence_number) else {
            // acknowledged while the send was in flight - nothing to arm
            return;
        };

        if let Some(previous) = entry.retry_timer.take() {
            previous.abort();
        }

        let attempts_so_far = entry.attempt_count;
        let interval = self.config.retry_interval(attempts_so_far);
        let max_retry_count = self.config.max_retry_count;
        let sequence_id = self.sequence_id;
        let inner_arc = self.inner.clone();
        let events = self.events.clone();

        entry.retry_timer = Some(tokio::spawn(async move {
            time::sleep(interval).await;

            let mut inner = inner_arc.write().await;
            if matches!(
                inner.state,
                StrategyState::Faulted(_) | StrategyState::Aborted
            ) {
                return;
            }
            let Some(entry) = inner.window.get_mut(&sequence_number) else {
                return; // acknowledged in the meantime
            };
            if entry.attempt_count != attempts_so_far {
                return; // a newer transmission re-armed the timer
            }

            if entry.attempt_count > max_retry_count {
                debug!(
                    "sequence {}: message #{} unacknowledged after {} transmissions - giving up",
                    sequence_id, sequence_number, attempts_so_far
                );
                events
                    .send(StrategyEvent::RetriesExhausted {
                        sequence_number,
                        attempts: attempts_so_far,
                    })
                    .ok();
                return;
            }

            entry.due = true;
            let attempt = AttemptInfo {
                message: entry.message.clone(),
                sequence_number,
                attempt: entry.attempt_count,
            };
            debug!(
                "sequence {}: retry timer for message #{} elapsed after {:?}",
                sequence_id, sequence_number, interval
            );
            events.send(StrategyEvent::RetryTimeoutElapsed(attempt)).ok();
        }));
    }

    /// Validate an incoming acknowledgement against the tracked window.
    /// `invalid` is a protocol violation the caller must escalate;
    ///  `inconsistent` is tracked only.
    pub async fn process_acknowledgement(&self, ranges: &SequenceRangeSet) -> AckOutcome {
        let inner = self.inner.read().await;
        let invalid = match ranges.max() {
            Some(max) => max > inner.highest_assigned(),
            None => false,
        };
        let inconsistent = !ranges.is_consistent_with(&inner.acked);
        if inconsistent {
            warn!(
                "sequence {}: non-monotonic acknowledgement {} (previously acknowledged {})",
                self.sequence_id, ranges, inner.acked
            );
        }
        AckOutcome {
            invalid,
            inconsistent,
        }
    }

    /// Retire acknowledged entries, free window capacity and record the
    ///  peer's advertised quota. Idempotent. True iff unacknowledged work
    ///  remains, i.e. a retry pass is worthwhile.
    pub async fn process_transferred(
        &self,
        ranges: &SequenceRangeSet,
        quota_remaining: Option<u32>,
    ) -> bool {
        let remaining = {
            let mut inner = self.inner.write().await;
            if matches!(
                inner.state,
                StrategyState::Faulted(_) | StrategyState::Aborted
            ) {
                return false;
            }

            let acknowledged: Vec<SequenceNumber> = inner
                .window
                .keys()
                .filter(|seq| ranges.contains(**seq))
                .copied()
                .collect();
            for sequence_number in &acknowledged {
                if let Some(mut entry) = inner.window.remove(sequence_number) {
                    if let Some(timer) = entry.retry_timer.take() {
                        timer.abort();
                    }
                }
            }
            if !acknowledged.is_empty() {
                trace!(
                    "sequence {}: {} message(s) acknowledged, {} still in flight",
                    self.sequence_id,
                    acknowledged.len(),
                    inner.window.len()
                );
            }

            inner.acked = inner.acked.union(ranges);
            if quota_remaining.is_some() {
                inner.remote_quota = quota_remaining;
            }
            !inner.window.is_empty()
        };

        self.capacity.notify_waiters();
        remaining
    }

    /// True only if `ranges` covers every number from 1 through the terminal
    ///  number - the condition for the sequence to count as completely
    ///  delivered.
    pub async fn is_final_ack_consistent(&self, ranges: &SequenceRangeSet) -> bool {
        let inner = self.inner.read().await;
        match inner.last {
            Some(last) => final_ack_covers(ranges, last),
            None => false,
        }
    }

    /// The send side has fully delivered every message of the sequence
    pub async fn done_transmitting(&self) -> bool {
        self.inner.read().await.done_transmitting()
    }

    /// Refuse further admissions and wait for the window to drain to empty.
    /// On timeout the caller must abort the connection.
    pub async fn close(&self, timeout: Duration) -> Result<(), TransferError> {
        {
            let mut inner = self.inner.write().await;
            match &inner.state {
                StrategyState::Open => inner.state = StrategyState::Closed,
                StrategyState::Closed => {}
                StrategyState::Faulted(fault) => return Err(fault.clone().into_error()),
                StrategyState::Aborted => return Err(TransferError::Aborted),
            }
        }
        // wake admission waiters so they observe the closed state
        self.capacity.notify_waiters();

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.capacity.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let inner = self.inner.read().await;
                match &inner.state {
                    StrategyState::Faulted(fault) => return Err(fault.clone().into_error()),
                    StrategyState::Aborted => return Err(TransferError::Aborted),
                    _ => {}
                }
                if inner.window.is_empty() {
                    return Ok(());
                }
            }
            if timeout_at(deadline, drained).await.is_err() {
                return Err(TransferError::Timeout {
                    operation: "window drain",
                });
            }
        }
    }

    /// Drop all pending state immediately
    pub async fn abort(&self) {
        {
            let mut inner = self.inner.write().await;
            if matches!(inner.state, StrategyState::Aborted) {
                return;
            }
            inner.abort_timers();
            inner.window.clear();
            inner.state = StrategyState::Aborted;
        }
        self.capacity.notify_waiters();
    }

    /// Terminal transition after a protocol fault: blocked and future
    ///  operations observe the fault's error
    pub async fn fault(&self, fault: WsrmFault) {
        {
            let mut inner = self.inner.write().await;
            if matches!(
                inner.state,
                StrategyState::Faulted(_) | StrategyState::Aborted
            ) {
                return;
            }
            inner.abort_timers();
            inner.window.clear();
            inner.state = StrategyState::Faulted(fault);
        }
        self.capacity.notify_waiters();
    }

    /// True iff some window entry is currently eligible for (re)send. Used by
    ///  the dispatch pass to detect work that became due while it was
    ///  releasing its exclusivity - such work must not be stranded.
    pub async fn has_due_entry(&self) -> bool {
        self.inner.read().await.window.values().any(|entry| entry.due)
    }

    /// Number of sent-but-unacknowledged messages currently in the window
    pub async fn window_len(&self) -> usize {
        self.inner.read().await.window.len()
    }

    /// Receive quota most recently advertised by the peer
    pub async fn remote_quota(&self) -> Option<u32> {
        self.inner.read().await.remote_quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::*;
    use tokio::runtime::Builder;
    use tokio::task;

    fn test_config(version: ReliableMessagingVersion, window: u32) -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            transfer_window_size: window,
            ..ConnectionConfig::default_for(version)
        })
    }

    fn strategy(
        version: ReliableMessagingVersion,
        window: u32,
    ) -> (
        TransmissionStrategy,
        mpsc::UnboundedReceiver<StrategyEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let strategy = TransmissionStrategy::new(
            test_config(version, window),
            SequenceId::new_random(),
            events_tx,
        );
        (strategy, events_rx)
    }

    fn message(text: &str) -> Message {
        Message::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn ranges(pairs: &[(u64, u64)]) -> SequenceRangeSet {
        let mut result = SequenceRangeSet::new();
        for &(lower, upper) in pairs {
            result = result.add(crate::range_set::SequenceRange::new(
                SequenceNumber::from_raw(lower),
                SequenceNumber::from_raw(upper),
            ));
        }
        result
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// dispatch one message the way the connection's pass would
    async fn dispatch_one(strategy: &TransmissionStrategy) -> AttemptInfo {
        let attempt = strategy
            .get_message_info_for_retry()
            .await
            .expect("an entry should be due");
        strategy.attempt_sent(attempt.sequence_number).await;
        attempt
    }

    #[rstest]
    fn test_sequence_numbers_are_assigned_in_call_order() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            for expected in 1..=5u64 {
                let attempt = strategy
                    .add(message("m"), Duration::from_secs(1))
                    .await
                    .unwrap();
                assert_eq!(attempt.sequence_number.to_raw(), expected);
                assert_eq!(attempt.message.sequence_number(), Some(attempt.sequence_number));
            }
            assert_eq!(strategy.window_len().await, 5);
        });
    }

    #[rstest]
    fn test_window_full_add_blocks_until_acknowledgement() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 4);
            let strategy = Arc::new(strategy);

            for _ in 0..4 {
                strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            }
            assert_eq!(strategy.window_len().await, 4);

            let blocked = {
                let strategy = strategy.clone();
                tokio::spawn(async move {
                    strategy.add(message("fifth"), Duration::from_secs(60)).await
                })
            };
            for _ in 0..3 {
                task::yield_now().await;
            }
            assert!(!blocked.is_finished());

            // message 1 acknowledged - capacity frees up, the add completes
            strategy.process_transferred(&ranges(&[(1, 1)]), None).await;
            let attempt = blocked.await.unwrap().unwrap();
            assert_eq!(attempt.sequence_number.to_raw(), 5);
            assert_eq!(strategy.window_len().await, 4);
        });
    }

    #[rstest]
    fn test_window_full_add_times_out() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 1);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();

            let result = strategy.add(message("m"), Duration::from_millis(50)).await;
            assert!(matches!(
                result,
                Err(TransferError::Timeout { operation: "window admission" })
            ));
            assert_eq!(strategy.window_len().await, 1);
        });
    }

    #[rstest]
    fn test_remote_quota_bounds_admission() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            dispatch_one(&strategy).await;

            // the peer acknowledges nothing but advertises a single free slot
            strategy.process_transferred(&ranges(&[]), Some(1)).await;

            let result = strategy.add(message("m"), Duration::from_millis(10)).await;
            assert!(result.is_err(), "advertised quota of 1 must block a second admission");
        });
    }

    #[rstest]
    fn test_ack_then_no_remaining_work_and_termination() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 4);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            let attempt = dispatch_one(&strategy).await;
            assert_eq!(attempt.attempt, 1);

            let remaining = strategy.process_transferred(&ranges(&[(1, 1)]), None).await;
            assert!(!remaining);

            // everything acknowledged, but the terminal number is not known yet
            assert!(!strategy.done_transmitting().await);
            assert!(strategy.set_last().await);
            assert!(strategy.done_transmitting().await);
        });
    }

    #[rstest]
    fn test_gap_entry_is_selected_for_retry_with_incremented_count() {
        paused_rt().block_on(async {
            let (strategy, mut events) = strategy(ReliableMessagingVersion::Version11, 8);
            for _ in 0..3 {
                strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            }
            for _ in 0..3 {
                dispatch_one(&strategy).await;
            }
            assert!(strategy.get_message_info_for_retry().await.is_none());

            // 1 and 3 acknowledged, 2 still outstanding
            let remaining = strategy
                .process_transferred(&ranges(&[(1, 1), (3, 3)]), None)
                .await;
            assert!(remaining);

            // let message 2's retry timer fire
            time::sleep(Duration::from_secs(2)).await;
            match events.recv().await.unwrap() {
                StrategyEvent::RetryTimeoutElapsed(attempt) => {
                    assert_eq!(attempt.sequence_number.to_raw(), 2);
                }
                other => panic!("unexpected event {:?}", other),
            }

            let attempt = strategy.get_message_info_for_retry().await.unwrap();
            assert_eq!(attempt.sequence_number.to_raw(), 2);
            assert_eq!(attempt.attempt, 2);

            // the acknowledged entries' timers were cancelled - no events for them
            assert!(events.try_recv().is_err());
        });
    }

    #[rstest]
    fn test_ack_for_unsent_sequence_numbers_is_invalid() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            for _ in 0..5 {
                strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            }

            let outcome = strategy.process_acknowledgement(&ranges(&[(10, 10)])).await;
            assert!(outcome.invalid);

            let outcome = strategy.process_acknowledgement(&ranges(&[(1, 5)])).await;
            assert!(!outcome.invalid);
        });
    }

    #[rstest]
    fn test_shrinking_ack_is_inconsistent_but_not_invalid() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            for _ in 0..3 {
                strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            }
            strategy.process_transferred(&ranges(&[(1, 3)]), None).await;

            let outcome = strategy.process_acknowledgement(&ranges(&[(1, 1)])).await;
            assert!(outcome.inconsistent);
            assert!(!outcome.invalid);
        });
    }

    #[rstest]
    fn test_acknowledgement_application_is_idempotent() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            for _ in 0..3 {
                strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            }

            let first = strategy.process_transferred(&ranges(&[(1, 2)]), None).await;
            let window_after_first = strategy.window_len().await;
            let second = strategy.process_transferred(&ranges(&[(1, 2)]), None).await;

            assert_eq!(first, second);
            assert_eq!(strategy.window_len().await, window_after_first);
            assert_eq!(window_after_first, 1);

            let outcome = strategy.process_acknowledgement(&ranges(&[(1, 2)])).await;
            assert_eq!(outcome, AckOutcome { invalid: false, inconsistent: false });
        });
    }

    #[rstest]
    fn test_retry_budget_exhaustion_is_reported() {
        paused_rt().block_on(async {
            let (events_tx, mut events) = mpsc::unbounded_channel();
            let config = Arc::new(ConnectionConfig {
                transfer_window_size: 4,
                max_retry_count: 1,
                ..ConnectionConfig::default_for(ReliableMessagingVersion::Version11)
            });
            let strategy =
                TransmissionStrategy::new(config, SequenceId::new_random(), events_tx);

            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            dispatch_one(&strategy).await;

            time::sleep(Duration::from_secs(2)).await;
            assert!(matches!(
                events.recv().await.unwrap(),
                StrategyEvent::RetryTimeoutElapsed(_)
            ));

            // the single allowed retry
            let attempt = strategy.get_message_info_for_retry().await.unwrap();
            assert_eq!(attempt.attempt, 2);
            strategy.attempt_sent(attempt.sequence_number).await;

            time::sleep(Duration::from_secs(5)).await;
            match events.recv().await.unwrap() {
                StrategyEvent::RetriesExhausted { sequence_number, attempts } => {
                    assert_eq!(sequence_number.to_raw(), 1);
                    assert_eq!(attempts, 2);
                }
                other => panic!("unexpected event {:?}", other),
            }
        });
    }

    #[rstest]
    fn test_message_number_rollover_faults() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            strategy.inner.write().await.next_sequence_number =
                SequenceNumber::from_raw(SequenceNumber::MAX.to_raw() + 1);

            let result = strategy.add(message("m"), Duration::from_secs(1)).await;
            match result {
                Err(TransferError::Protocol(fault)) => {
                    assert_eq!(fault.subcode(), "MessageNumberRollover");
                }
                other => panic!("unexpected result {:?}", other.map(|a| a.sequence_number)),
            }
        });
    }

    #[rstest]
    fn test_no_admission_after_terminator() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::February2005, 8);
            let outcome = strategy
                .add_last(Message::last_marker(), Duration::from_secs(1))
                .await
                .unwrap();
            match outcome {
                AddLastOutcome::Attempt(attempt) => {
                    assert_eq!(attempt.sequence_number.to_raw(), 1);
                    assert!(attempt.message.is_last());
                }
                other => panic!("unexpected outcome {:?}", other),
            }

            let result = strategy.add(message("m"), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(TransferError::Closed)));
        });
    }

    #[rstest]
    fn test_add_last_handshake_dialect() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);

            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            let outcome = strategy
                .add_last(Message::last_marker(), Duration::from_secs(1))
                .await
                .unwrap();
            assert!(matches!(outcome, AddLastOutcome::Pending));

            strategy.process_transferred(&ranges(&[(1, 1)]), None).await;
            assert!(strategy.done_transmitting().await);
            assert!(
                strategy.is_final_ack_consistent(&ranges(&[(1, 1)])).await,
                "a gap-free ack through the terminal number is final-consistent"
            );
            assert!(!strategy.is_final_ack_consistent(&ranges(&[])).await);
        });
    }

    #[rstest]
    fn test_empty_sequence_set_last_finishes_immediately() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            assert!(strategy.set_last().await);
            assert!(strategy.done_transmitting().await);
        });
    }

    #[rstest]
    fn test_close_waits_for_drain() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            let strategy = Arc::new(strategy);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();
            dispatch_one(&strategy).await;

            let closing = {
                let strategy = strategy.clone();
                tokio::spawn(async move { strategy.close(Duration::from_secs(30)).await })
            };
            for _ in 0..3 {
                task::yield_now().await;
            }
            assert!(!closing.is_finished());

            // new admissions are refused while draining
            let result = strategy.add(message("m"), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(TransferError::Closed)));

            strategy.process_transferred(&ranges(&[(1, 1)]), None).await;
            closing.await.unwrap().unwrap();
        });
    }

    #[rstest]
    fn test_close_times_out_when_window_never_drains() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 8);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();

            let result = strategy.close(Duration::from_millis(20)).await;
            assert!(matches!(
                result,
                Err(TransferError::Timeout { operation: "window drain" })
            ));
        });
    }

    #[rstest]
    fn test_abort_wakes_blocked_admission() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 1);
            let strategy = Arc::new(strategy);
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();

            let blocked = {
                let strategy = strategy.clone();
                tokio::spawn(async move {
                    strategy.add(message("m"), Duration::from_secs(60)).await
                })
            };
            for _ in 0..3 {
                task::yield_now().await;
            }

            strategy.abort().await;
            assert!(matches!(blocked.await.unwrap(), Err(TransferError::Aborted)));
            assert_eq!(strategy.window_len().await, 0);
        });
    }

    #[rstest]
    fn test_fault_fails_blocked_and_later_operations() {
        paused_rt().block_on(async {
            let (strategy, _events) = strategy(ReliableMessagingVersion::Version11, 1);
            let strategy = Arc::new(strategy);
            let sequence_id = SequenceId::new_random();
            strategy.add(message("m"), Duration::from_secs(1)).await.unwrap();

            let blocked = {
                let strategy = strategy.clone();
                tokio::spawn(async move {
                    strategy.add(message("m"), Duration::from_secs(60)).await
                })
            };
            for _ in 0..3 {
                task::yield_now().await;
            }

            strategy
                .fault(WsrmFault::sequence_terminated(sequence_id, "test fault"))
                .await;

            match blocked.await.unwrap() {
                Err(TransferError::Protocol(fault)) => {
                    assert_eq!(fault.subcode(), "SequenceTerminated");
                }
                other => panic!("unexpected result {:?}", other.map(|a| a.sequence_number)),
            }

            // fail fast from now on
            let result = strategy.add(message("m"), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(TransferError::Protocol(_))));
            assert!(strategy.get_message_info_for_retry().await.is_none());
        });
    }
}
