//! Memory-budgeted execution of merge work items.

use crate::error::{CoreError, CoreResult};
use crate::merger::work_item::MergeWorkItem;
use parking_lot::{Condvar, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

struct SchedulerState {
    next: usize,
    in_use: u64,
    error: Option<CoreError>,
}

/// Runs work items on a fixed number of scoped threads.
///
/// Items start in order. An item starts only when the estimates of the
/// running items plus its own fit the budget; an item larger than the whole
/// budget runs alone. The first failure stops further items from starting
/// and is returned once the running ones finish.
#[derive(Debug, Clone, Copy)]
pub struct WorkItemScheduler {
    threads: usize,
    memory_budget: u64,
}

impl WorkItemScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(threads: usize, memory_budget: u64) -> Self {
        Self {
            threads: threads.max(1),
            memory_budget,
        }
    }

    /// Runs every item.
    pub fn run(&self, items: &[Box<dyn MergeWorkItem>]) -> CoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let state = Mutex::new(SchedulerState {
            next: 0,
            in_use: 0,
            error: None,
        });
        let released = Condvar::new();
        let workers = self.threads.min(items.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(items, &state, &released));
            }
        });

        let state = state.into_inner();
        if let Some(e) = state.error {
            return Err(e);
        }
        debug!(
            items = items.len(),
            threads = workers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge work items finished"
        );
        Ok(())
    }

    fn worker(&self, items: &[Box<dyn MergeWorkItem>], state: &Mutex<SchedulerState>, released: &Condvar) {
        let mut guard = state.lock();
        loop {
            if guard.error.is_some() || guard.next >= items.len() {
                return;
            }
            let item = &items[guard.next];
            let estimate = item.estimate_memory();
            let fits = guard.in_use == 0 || guard.in_use.saturating_add(estimate) <= self.memory_budget;
            if !fits {
                released.wait(&mut guard);
                continue;
            }
            guard.next += 1;
            guard.in_use += estimate;
            drop(guard);

            let result = item.process();

            guard = state.lock();
            guard.in_use -= estimate;
            if let Err(e) = result {
                error!(item = item.identifier(), error = %e, "merge work item failed");
                guard.error.get_or_insert(e);
            }
            released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Item {
        id: String,
        estimate: u64,
        fail: bool,
        running: Arc<AtomicU64>,
        peak: Arc<AtomicU64>,
        runs: Arc<AtomicUsize>,
    }

    impl MergeWorkItem for Item {
        fn identifier(&self) -> &str {
            &self.id
        }
        fn estimate_memory(&self) -> u64 {
            self.estimate
        }
        fn process(&self) -> CoreResult<()> {
            let now = self.running.fetch_add(self.estimate, Ordering::SeqCst) + self.estimate;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.running.fetch_sub(self.estimate, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CoreError::inconsistent("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn items(estimates: &[u64], fail_at: Option<usize>) -> (Vec<Box<dyn MergeWorkItem>>, Arc<AtomicU64>, Arc<AtomicUsize>) {
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let items = estimates
            .iter()
            .enumerate()
            .map(|(i, e)| {
                Box::new(Item {
                    id: format!("plan_{i}_task_0"),
                    estimate: *e,
                    fail: fail_at == Some(i),
                    running: Arc::clone(&running),
                    peak: Arc::clone(&peak),
                    runs: Arc::clone(&runs),
                }) as Box<dyn MergeWorkItem>
            })
            .collect();
        (items, peak, runs)
    }

    #[test]
    fn respects_memory_budget() {
        let (items, peak, runs) = items(&[40, 40, 40, 40, 40, 40], None);
        WorkItemScheduler::new(4, 100).run(&items).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 100);
    }

    #[test]
    fn oversized_item_runs_alone() {
        let (items, peak, runs) = items(&[500, 10], None);
        WorkItemScheduler::new(2, 100).run(&items).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn failure_stops_scheduling() {
        let (items, _, runs) = items(&[10, 10, 10, 10], Some(0));
        let err = WorkItemScheduler::new(1, 100).run(&items).unwrap_err();
        assert!(matches!(err, CoreError::InconsistentState { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
