use std::cmp::min;
use std::time::Duration;

use anyhow::bail;

/// The two wire dialects of the protocol.
///
/// They differ in how a sequence is terminated - a dedicated last-message
///  sentinel versus an explicit close handshake - and in how faults are
///  carried on the wire (a dedicated header versus a SOAP 1.2 subcode with
///  detail).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ReliableMessagingVersion {
    /// The 2005/02 dialect: the sequence ends with a last-message sentinel
    ///  that is itself part of the sequence.
    February2005,
    /// The 1.1 (200702) dialect: the sequence ends with an explicit close
    ///  handshake; no sentinel message is transmitted.
    Version11,
}

pub struct ConnectionConfig {
    pub version: ReliableMessagingVersion,

    /// Maximum number of sent-but-unacknowledged messages held in the
    ///  transmission window. Admission of further messages suspends until
    ///  acknowledgements free capacity.
    pub transfer_window_size: u32,

    /// Number of retransmissions allowed per message. One more expiry of a
    ///  message's retry timer faults the connection - the peer is considered
    ///  unreachable.
    pub max_retry_count: u32,

    /// Seed for the per-message retry timer, roughly the estimated round-trip
    ///  time. Doubled on each expiry of the same message's timer.
    pub initial_retry_interval: Duration,

    /// Cap for the doubled retry interval.
    pub max_retry_interval: Duration,

    /// Budget for a single transport send.
    pub send_timeout: Duration,
}

impl ConnectionConfig {
    pub fn default_for(version: ReliableMessagingVersion) -> ConnectionConfig {
        ConnectionConfig {
            version,
            transfer_window_size: 32,
            max_retry_count: 8,
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer_window_size == 0 {
            bail!("transfer window size must be at least 1");
        }
        if self.initial_retry_interval.is_zero() {
            bail!("initial retry interval must be positive");
        }
        if self.max_retry_interval < self.initial_retry_interval {
            bail!("maximum retry interval must not be smaller than the initial retry interval");
        }
        if self.send_timeout.is_zero() {
            bail!("send timeout must be positive");
        }
        Ok(())
    }

    /// Retry interval armed after the `attempt`-th transmission of a message:
    ///  the initial interval doubled per attempt, capped at the maximum.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        // cap the shift - beyond that the max interval wins anyway
        let doublings = min(attempt.saturating_sub(1), 16);
        let backed_off = self.initial_retry_interval.saturating_mul(1 << doublings);
        min(backed_off, self.max_retry_interval)
    }
}
