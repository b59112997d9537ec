//! Counting semaphore used as a blocking gate by the bounded buffer.
//!
//! Permits are tracked under a `parking_lot::Mutex` and waiters park on a `Condvar`. Releasing a
//! permit wakes exactly one waiter; closing the gate wakes every waiter and makes all current and
//! future acquisitions fail with [`AcquireError::Closed`].

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why an acquisition did not yield a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The deadline elapsed before a permit became available.
    TimedOut,
    /// The gate was closed.
    Closed,
}

#[derive(Debug)]
struct GateState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore with optional timeout and close support.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<GateState>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available, the gate closes, or `timeout` elapses.
    ///
    /// `None` (or a timeout too large to represent) waits indefinitely. `Some(Duration::ZERO)`
    /// never blocks.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), AcquireError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(AcquireError::Closed);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        // One last look: a permit may have been released right at the deadline.
                        if state.closed {
                            return Err(AcquireError::Closed);
                        }
                        if state.permits > 0 {
                            state.permits -= 1;
                            return Ok(());
                        }
                        return Err(AcquireError::TimedOut);
                    }
                }
            }
        }
    }

    /// Take one permit without blocking.
    pub fn try_acquire(&self) -> Result<(), AcquireError> {
        self.acquire(Some(Duration::ZERO))
    }

    /// Return one permit and wake a single waiter.
    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            state.permits += 1;
        }
        self.available.notify_one();
    }

    /// Close the gate and wake every waiter.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        self.available.notify_all();
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }
}
