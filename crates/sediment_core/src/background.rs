//! Supervised background tasks.
//!
//! Every task is a named thread driven by a control channel. The owner sends
//! [`TaskMessage::Trigger`] to run the task immediately and
//! [`TaskMessage::Stop`] to shut it down; [`BackgroundTask::stop`] waits for
//! the thread to finish its current run.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Control messages consumed by a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMessage {
    /// Finish the current run and exit.
    Stop,
    /// Run now instead of waiting for the next interval.
    Trigger,
}

/// A handle to a running background task.
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    sender: Sender<TaskMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawns a task running `work` every `interval` and on every trigger.
    ///
    /// Errors returned by `work` are logged; the task keeps running.
    pub fn spawn_periodic<F>(name: impl Into<String>, interval: Duration, mut work: F) -> CoreResult<Self>
    where
        F: FnMut() -> CoreResult<()> + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = mpsc::channel();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("sediment-{name}"))
            .spawn(move || {
                debug!(task = %thread_name, "background task started");
                loop {
                    match receiver.recv_timeout(interval) {
                        Ok(TaskMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(TaskMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = work() {
                                warn!(task = %thread_name, error = %e, "background task run failed");
                            }
                        }
                    }
                }
                debug!(task = %thread_name, "background task stopped");
            })?;
        info!(task = %name, interval_ms = interval.as_millis() as u64, "spawned background task");
        Ok(Self {
            name,
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the task to run now.
    pub fn trigger(&self) {
        if self.sender.send(TaskMessage::Trigger).is_err() {
            debug!(task = %self.name, "trigger ignored, task has exited");
        }
    }

    /// Returns a sender that triggers the task.
    #[must_use]
    pub fn notifier(&self) -> Sender<TaskMessage> {
        self.sender.clone()
    }

    /// Stops the task and waits for it to exit.
    ///
    /// Calling `stop` more than once is a no-op.
    pub fn stop(&self) -> CoreResult<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        if self.sender.send(TaskMessage::Stop).is_err() {
            debug!(task = %self.name, "task exited before stop");
        }
        handle
            .join()
            .map_err(|_| CoreError::inconsistent(format!("background task {} panicked", self.name)))
    }

    /// Returns true until the task is stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(task = %self.name, error = %e, "background task did not stop cleanly");
        }
    }
}

/// A set of tasks stopped together.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Vec<BackgroundTask>,
}

impl TaskGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task.
    pub fn push(&mut self, task: BackgroundTask) {
        self.tasks.push(task);
    }

    /// Finds a task by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the group holds no task.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops every task, newest first. Returns the first error.
    pub fn stop_all(&mut self) -> CoreResult<()> {
        let mut first_error = None;
        while let Some(task) = self.tasks.pop() {
            if let Err(e) = task.stop() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn trigger_runs_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::spawn_periodic("test", Duration::from_secs(3600), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        task.trigger();
        let start = Instant::now();
        while runs.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        task.stop().unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(!task.is_running());
    }

    #[test]
    fn failing_runs_keep_task_alive() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::spawn_periodic("failing", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::closed("test"))
        })
        .unwrap();

        let start = Instant::now();
        while runs.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runs.load(Ordering::SeqCst) >= 3);
        task.stop().unwrap();
        task.stop().unwrap();
    }

    #[test]
    fn trigger_after_stop_is_ignored() {
        let task = BackgroundTask::spawn_periodic("stopped", Duration::from_secs(60), || Ok(())).unwrap();
        task.stop().unwrap();
        task.trigger();
        assert!(!task.is_running());
    }

    #[test]
    fn group_stops_all() {
        let mut group = TaskGroup::new();
        group.push(BackgroundTask::spawn_periodic("a", Duration::from_secs(60), || Ok(())).unwrap());
        group.push(BackgroundTask::spawn_periodic("b", Duration::from_secs(60), || Ok(())).unwrap());
        assert!(group.get("a").is_some());
        group.stop_all().unwrap();
        assert!(group.is_empty());
    }
}
