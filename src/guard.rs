use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::TransferError;

/// Bounded admission of concurrent work against a closable resource.
///
/// Callers `enter` before starting a transport send attempt and `exit` when it
///  completes. `close` drains: it refuses new entrants and waits for active
///  ones to finish; `abort` refuses new entrants without waiting.
///
/// With `max_entrants == 1` the guard doubles as the dispatch latch: a failed
///  `enter` means another dispatch pass is already running and will pick up
///  whatever work triggered this attempt, so the caller simply returns.
pub struct Guard {
    state: Mutex<GuardState>,
    drained: Notify,
}

struct GuardState {
    active: u32,
    max_entrants: u32,
    closing: bool,
    aborted: bool,
}

impl Guard {
    pub fn new() -> Guard {
        Guard::with_max_entrants(1)
    }

    pub fn with_max_entrants(max_entrants: u32) -> Guard {
        assert!(max_entrants > 0, "a guard must admit at least one entrant");
        Guard {
            state: Mutex::new(GuardState {
                active: 0,
                max_entrants,
                closing: false,
                aborted: false,
            }),
            drained: Notify::new(),
        }
    }

    /// Attempt admission. `false` denies it: the guard is closing, aborted,
    ///  or at its entrant bound.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock().expect("guard lock poisoned");
        if state.closing || state.aborted || state.active == state.max_entrants {
            return false;
        }
        state.active += 1;
        true
    }

    pub fn exit(&self) {
        let notify = {
            let mut state = self.state.lock().expect("guard lock poisoned");
            assert!(state.active > 0, "exit without matching enter");
            state.active -= 1;
            state.active == 0
        };
        if notify {
            self.drained.notify_waiters();
        }
    }

    /// Drain: refuse new entrants, wait for active ones to exit. The guard
    ///  stays closed even when the wait times out.
    pub async fn close(&self, timeout: Duration) -> Result<(), TransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            // register before checking the count - an exit between check and
            //  await must not be missed
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let mut state = self.state.lock().expect("guard lock poisoned");
                state.closing = true;
                if state.active == 0 {
                    return Ok(());
                }
                debug!("guard close waiting for {} active entrant(s)", state.active);
            }
            if timeout_at(deadline, drained).await.is_err() {
                return Err(TransferError::Timeout {
                    operation: "guard close",
                });
            }
        }
    }

    /// Refuse all future entrants immediately. Active entrants are expected
    ///  to fail independently and call `exit`.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("guard lock poisoned");
        state.aborted = true;
    }
}

impl Default for Guard {
    fn default() -> Self {
        Guard::new()
    }
}
