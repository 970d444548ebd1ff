//! Cooperative cancellation and one-shot latches.
//!
//! The daemon has exactly one cancellation authority (the shutdown token) and
//! two barriers (setup complete, fully ready). All three are built on the
//! same condvar-backed cell so waiters can block with a deadline.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Cell {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl Cell {
    fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn fire(&self) {
        let mut fired = match self.fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *fired = true;
        self.condvar.notify_all();
    }

    fn fired(&self) -> bool {
        match self.fired.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = match self.fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut remaining = timeout;
        loop {
            if *fired {
                return true;
            }
            if remaining.is_zero() {
                return false;
            }
            let start = std::time::Instant::now();
            let (next, status) = match self.condvar.wait_timeout(fired, remaining) {
                Ok(result) => result,
                Err(_) => return true,
            };
            fired = next;
            if status.timed_out() {
                return *fired;
            }
            remaining = remaining.saturating_sub(start.elapsed());
        }
    }
}

/// Cancellation token. Cloning yields another handle to the same token.
/// Cancelling an already-cancelled token is a no-op.
#[derive(Debug, Clone)]
pub struct Canceller {
    cell: Arc<Cell>,
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

impl Canceller {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell::new()),
        }
    }

    pub fn cancel(&self) {
        self.cell.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.fired()
    }

    /// Blocks until cancelled or the timeout elapses. Returns true when the
    /// token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_timeout(timeout)
    }
}

/// One-shot barrier: starts closed, opens exactly once.
#[derive(Debug, Clone)]
pub struct Latch {
    cell: Arc<Cell>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell::new()),
        }
    }

    pub fn open(&self) {
        self.cell.fire();
    }

    pub fn is_open(&self) -> bool {
        self.cell.fired()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let token = Canceller::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn latch_release_unblocks_waiter() {
        let latch = Latch::new();
        let waiter = latch.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        latch.open();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_timeout_expires_when_not_fired() {
        let latch = Latch::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
