//! Cooperative background task groups.
//!
//! A group is a set of `(function, interval)` pairs. Starting the group
//! spawns one thread per task; each runs its function, then sleeps on the
//! combined stop/shutdown token until the next tick. Stopping grants a
//! bounded grace period and detaches anything still running after it.

use crate::cancel::Canceller;
use log::warn;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub type TaskFn = Arc<dyn Fn(&Canceller) + Send + Sync>;

struct TaskSpec {
    name: &'static str,
    interval: Duration,
    run: TaskFn,
}

struct Running {
    stop: Canceller,
    remaining: Arc<(Mutex<usize>, Condvar)>,
}

#[derive(Default)]
pub struct Group {
    specs: Vec<TaskSpec>,
    running: Option<Running>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &'static str,
        interval: Duration,
        run: impl Fn(&Canceller) + Send + Sync + 'static,
    ) {
        self.specs.push(TaskSpec {
            name,
            interval,
            run: Arc::new(run),
        });
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Launches every task. Each derives its lifetime from both the group's
    /// stop token and the daemon shutdown token.
    pub fn start(&mut self, shutdown: &Canceller) {
        if self.running.is_some() {
            return;
        }
        let stop = Canceller::new();
        let remaining = Arc::new((Mutex::new(self.specs.len()), Condvar::new()));
        for spec in &self.specs {
            let run = spec.run.clone();
            let name = spec.name;
            let interval = spec.interval;
            let stop = stop.clone();
            let shutdown = shutdown.clone();
            let remaining = remaining.clone();
            thread::spawn(move || {
                loop {
                    if stop.is_cancelled() || shutdown.is_cancelled() {
                        break;
                    }
                    run(&shutdown);
                    // Tick in small slices so either token interrupts the sleep.
                    let mut waited = Duration::ZERO;
                    let slice = Duration::from_millis(100).min(interval);
                    while waited < interval {
                        if stop.wait_timeout(slice) || shutdown.is_cancelled() {
                            break;
                        }
                        waited += slice;
                    }
                }
                let (count, condvar) = &*remaining;
                if let Ok(mut left) = count.lock() {
                    *left = left.saturating_sub(1);
                    condvar.notify_all();
                }
                log::debug!("event=task_exit name={name}");
            });
        }
        self.running = Some(Running { stop, remaining });
    }

    /// Signals stop and waits up to `grace` for every task thread to exit.
    /// Late threads are detached; they still observe the stop token.
    pub fn stop(&mut self, grace: Duration) -> Result<(), StoppedLate> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.stop.cancel();
        let (count, condvar) = &*running.remaining;
        let mut left = match count.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut budget = grace;
        while *left > 0 && !budget.is_zero() {
            let start = std::time::Instant::now();
            let (next, status) = match condvar.wait_timeout(left, budget) {
                Ok(result) => result,
                Err(_) => return Err(StoppedLate),
            };
            left = next;
            if status.timed_out() {
                break;
            }
            budget = budget.saturating_sub(start.elapsed());
        }
        if *left > 0 {
            warn!("event=task_group_stop_late pending={}", *left);
            return Err(StoppedLate);
        }
        Ok(())
    }
}

/// Some tasks were still running when the grace period expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedLate;

impl std::fmt::Display for StoppedLate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task group stop exceeded its grace period")
    }
}

impl std::error::Error for StoppedLate {}
