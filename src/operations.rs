//! In-flight operation registry.
//!
//! Handlers register long-running work here; shutdown drains the registry
//! bounded by the configured shutdown timeout. Bodies of the operations
//! themselves live with their subsystems.

use crate::cancel::Canceller;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: u64,
    pub description: String,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    active: BTreeMap<u64, OperationInfo>,
}

#[derive(Default)]
pub struct Operations {
    state: Arc<Mutex<RegistryState>>,
}

/// Guard marking one operation in flight; dropping it completes the
/// operation.
pub struct OperationGuard {
    state: Arc<Mutex<RegistryState>>,
    id: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.state.lock().active.remove(&self.id);
    }
}

impl OperationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, description: impl Into<String>) -> OperationGuard {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(
            id,
            OperationInfo {
                id,
                description: description.into(),
            },
        );
        OperationGuard {
            state: self.state.clone(),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn list(&self) -> Vec<OperationInfo> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<OperationInfo> {
        self.state.lock().active.get(&id).cloned()
    }

    /// Waits until every operation finished, the timeout expired, or the
    /// given token was cancelled. Returns true on a clean drain.
    pub fn drain(&self, timeout: Duration, interrupt: &Canceller) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if interrupt.wait_timeout(Duration::from_millis(100)) {
                // A second interrupt forces the drain to give up early.
                return self.count() == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn guard_drop_completes_operation() {
        let ops = Operations::new();
        let guard = ops.begin("instance start");
        assert_eq!(ops.count(), 1);
        assert_eq!(ops.get(guard.id()).unwrap().description, "instance start");
        drop(guard);
        assert_eq!(ops.count(), 0);
    }

    #[test]
    fn drain_waits_for_completion() {
        let ops = Operations::new();
        let guard = ops.begin("slow");
        let state = ops.state.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(guard);
            let _ = state;
        });
        let interrupt = Canceller::new();
        assert!(ops.drain(Duration::from_secs(2), &interrupt));
    }

    #[test]
    fn drain_times_out_with_work_left() {
        let ops = Operations::new();
        let _guard = ops.begin("stuck");
        let interrupt = Canceller::new();
        assert!(!ops.drain(Duration::from_millis(50), &interrupt));
    }
}
