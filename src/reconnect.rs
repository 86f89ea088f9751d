//! Exponential backoff reconnection task.
//!
//! When a command fails with an I/O error the connection manager schedules
//! a background retry run against the last known target. The run is a
//! plain thread with a shared cancellation token; a fresh schedule or an
//! explicit [ReconnectionPolicy::cancel] aborts it within one poll tick.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    connection::AdapterTarget,
    state::{ConnectionState, StateBroadcaster},
    transport::{Transport, TransportResult},
};

/// Delay before the first retry attempt
pub const BACKOFF_BASE_MS: u64 = 1_000;
/// Upper bound on a single retry delay
pub const BACKOFF_CAP_MS: u64 = 30_000;
/// Tick between cancellation checks while a retry sleeps
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Delay before the given 1 based attempt: `min(base * 2^(n-1), cap)`
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

/// Retries the last known target in the background with exponential
/// backoff. At most one run is active; scheduling again cancels the
/// previous run first.
pub struct ReconnectionPolicy {
    state: StateBroadcaster,
    base_ms: u64,
    cap_ms: u64,
    /// Cancellation token of the active run (true = cancelled)
    token: Mutex<Arc<AtomicBool>>,
}

impl Debug for ReconnectionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "ReconnectionPolicy {{ base_ms: {}, cap_ms: {} }}",
            self.base_ms, self.cap_ms
        )
    }
}

impl ReconnectionPolicy {
    /// Creates a policy publishing to the given broadcaster with the
    /// default backoff curve
    pub fn new(state: StateBroadcaster) -> Self {
        Self::with_backoff(state, BACKOFF_BASE_MS, BACKOFF_CAP_MS)
    }

    /// Creates a policy with a custom backoff curve
    pub fn with_backoff(state: StateBroadcaster, base_ms: u64, cap_ms: u64) -> Self {
        Self {
            state,
            base_ms,
            cap_ms,
            token: Mutex::new(Arc::new(AtomicBool::new(true))),
        }
    }

    /// Starts a retry run against `target` on a background thread,
    /// cancelling any run already in flight.
    ///
    /// `connect` is invoked once per attempt; returning an error - or
    /// panicking - counts as a failed attempt. On success `install`
    /// receives the fresh transport, then `Connected` is published and
    /// the run stops. Exhausting every attempt publishes an `Error`
    /// state.
    pub fn schedule<C, I>(&self, target: AdapterTarget, max_attempts: u32, mut connect: C, install: I)
    where
        C: FnMut() -> TransportResult<Box<dyn Transport>> + Send + 'static,
        I: FnOnce(Box<dyn Transport>) + Send + 'static,
    {
        let token = self.replace_token();
        let state = self.state.clone();
        let (base_ms, cap_ms) = (self.base_ms, self.cap_ms);
        std::thread::spawn(move || {
            for attempt in 1..=max_attempts {
                state.publish(ConnectionState::Reconnecting {
                    attempt,
                    max_attempts,
                    name: target.name.clone(),
                });
                let delay = backoff_delay(attempt, base_ms, cap_ms);
                debug!(
                    "reconnect attempt {attempt}/{max_attempts} to {} in {delay:?}",
                    target.address
                );
                if !sleep_unless_cancelled(delay, &token) {
                    debug!("reconnection cancelled");
                    return;
                }
                match catch_unwind(AssertUnwindSafe(&mut connect)) {
                    Ok(Ok(transport)) => {
                        if token.load(Ordering::Relaxed) {
                            // Cancelled while the connect call was in
                            // flight; the late transport must not fire
                            // any callbacks
                            drop(transport);
                            return;
                        }
                        info!("reconnected to {} on attempt {attempt}", target.address);
                        install(transport);
                        state.publish(ConnectionState::Connected {
                            name: target.name.clone(),
                            address: target.address.clone(),
                        });
                        return;
                    }
                    Ok(Err(e)) => warn!("reconnect attempt {attempt} failed: {e}"),
                    Err(_) => warn!("connect function panicked, counting as a failed attempt"),
                }
                if token.load(Ordering::Relaxed) {
                    debug!("reconnection cancelled");
                    return;
                }
            }
            if !token.load(Ordering::Relaxed) {
                state.publish(ConnectionState::Error {
                    message: format!("could not reconnect after {max_attempts} attempts"),
                });
            }
        });
    }

    /// Aborts the active run: the pending sleep exits within one poll
    /// tick and an in-flight connect has its outcome discarded.
    /// Idempotent; a no-op when nothing is running.
    pub fn cancel(&self) {
        self.token.lock().unwrap().store(true, Ordering::Relaxed);
    }

    fn replace_token(&self) -> Arc<AtomicBool> {
        let mut guard = self.token.lock().unwrap();
        guard.store(true, Ordering::Relaxed);
        let fresh = Arc::new(AtomicBool::new(false));
        *guard = fresh.clone();
        fresh
    }
}

/// Sleeps for `total`, waking every tick to honor cancellation.
/// Returns false when the sleep was cancelled.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}
