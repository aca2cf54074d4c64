//! Queue of frozen segments waiting to be written.

use crate::background::TaskMessage;
use crate::error::CoreResult;
use crate::segment::{BuildingSegment, BuiltSegment};
use crate::types::SegmentId;
use parking_lot::{Condvar, Mutex};
use sediment_storage::Directory;
use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, warn};

/// A frozen segment and the directory it is dumped into.
#[derive(Debug, Clone)]
pub struct DumpTask {
    /// The frozen segment.
    pub segment: Arc<BuildingSegment>,
    /// Target directory.
    pub dir: Arc<dyn Directory>,
}

impl DumpTask {
    fn run(&self) -> CoreResult<Arc<BuiltSegment>> {
        let info = self.segment.dump(self.dir.as_ref())?;
        Ok(Arc::new(BuiltSegment::from_building(&self.segment, info)))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queued: VecDeque<DumpTask>,
    in_flight: Vec<Arc<BuildingSegment>>,
    completed: Vec<Arc<BuiltSegment>>,
}

/// Dumps frozen segments, either on the caller's thread or on the async
/// dump task.
///
/// Tasks run in FIFO order. A failed task goes back to the head of the queue
/// and the error is returned to whoever ran it; the next flush retries it.
#[derive(Debug, Default)]
pub struct DumpQueue {
    state: Mutex<QueueState>,
    idle: Condvar,
    notifier: Mutex<Option<Sender<TaskMessage>>>,
}

impl DumpQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes `sender`'s task whenever a segment is queued.
    pub fn set_notifier(&self, sender: Sender<TaskMessage>) {
        *self.notifier.lock() = Some(sender);
    }

    /// Returns true if an async dump task is attached.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.notifier.lock().is_some()
    }

    /// Detaches the async dump task.
    pub fn clear_notifier(&self) {
        self.notifier.lock().take();
    }

    /// Queues a frozen segment.
    pub fn push(&self, segment: Arc<BuildingSegment>, dir: Arc<dyn Directory>) {
        let segment_id = segment.id();
        debug!(segment = %segment_id, "queued segment dump");
        self.state.lock().queued.push_back(DumpTask { segment, dir });
        if let Some(sender) = self.notifier.lock().as_ref() {
            if sender.send(TaskMessage::Trigger).is_err() {
                debug!(segment = %segment_id, "dump task gone, segment waits for a flush");
            }
        }
    }

    /// Runs queued tasks on the calling thread until the queue is empty.
    ///
    /// Returns the number of segments dumped.
    pub fn flush(&self) -> CoreResult<usize> {
        let mut dumped = 0;
        loop {
            let task = {
                let mut state = self.state.lock();
                let Some(task) = state.queued.pop_front() else {
                    break;
                };
                state.in_flight.push(Arc::clone(&task.segment));
                task
            };

            let result = task.run();
            let mut state = self.state.lock();
            let id = task.segment.id();
            state.in_flight.retain(|s| s.id() != id);
            match result {
                Ok(built) => {
                    state.completed.push(built);
                    dumped += 1;
                }
                Err(e) => {
                    warn!(segment = %id, error = %e, "segment dump failed");
                    state.queued.push_front(task);
                    self.idle.notify_all();
                    return Err(e);
                }
            }
            self.idle.notify_all();
        }
        Ok(dumped)
    }

    /// Flushes the queue and waits for dumps running on other threads.
    pub fn drain(&self) -> CoreResult<usize> {
        let dumped = self.flush()?;
        let mut state = self.state.lock();
        while !state.in_flight.is_empty() {
            self.idle.wait(&mut state);
        }
        Ok(dumped)
    }

    /// Takes the segments dumped since the last call, in id order.
    pub fn take_completed(&self) -> Vec<Arc<BuiltSegment>> {
        let mut completed = std::mem::take(&mut self.state.lock().completed);
        completed.sort_by_key(|s| s.id());
        completed
    }

    /// Returns true if dumped segments wait to be collected.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        !self.state.lock().completed.is_empty()
    }

    /// Ids of segments queued or being dumped.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<SegmentId> {
        let state = self.state.lock();
        state
            .queued
            .iter()
            .map(|t| t.segment.id())
            .chain(state.in_flight.iter().map(|s| s.id()))
            .collect()
    }

    /// Memory held by segments queued or being dumped.
    #[must_use]
    pub fn pending_memory(&self) -> u64 {
        let state = self.state.lock();
        state
            .queued
            .iter()
            .map(|t| t.segment.memory_use())
            .chain(state.in_flight.iter().map(|s| s.memory_use()))
            .sum()
    }

    /// Number of segments queued or being dumped.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + state.in_flight.len()
    }

    /// Returns true if nothing is queued or being dumped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use sediment_storage::InMemoryDirectory;

    fn frozen(id: u32, pks: &[&str]) -> Arc<BuildingSegment> {
        let seg = BuildingSegment::new(SegmentId::new(id), 0, 100);
        for pk in pks {
            seg.apply(&Document::add(*pk), 10).unwrap();
        }
        seg.freeze();
        Arc::new(seg)
    }

    #[test]
    fn flush_dumps_in_order() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let queue = DumpQueue::new();
        queue.push(frozen(2, &["b"]), Arc::clone(&dir));
        queue.push(frozen(1, &["a", "c"]), Arc::clone(&dir));
        assert_eq!(queue.pending_memory(), 30);

        assert_eq!(queue.flush().unwrap(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_memory(), 0);

        let completed = queue.take_completed();
        let ids: Vec<_> = completed.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![SegmentId::new(1), SegmentId::new(2)]);
        assert!(dir.exists("segment_1/segment_info"));
        assert!(!queue.has_completed());
    }

    #[test]
    fn push_after_dump_task_exit_still_queues() {
        let dir: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let queue = DumpQueue::new();
        let (sender, receiver) = std::sync::mpsc::channel();
        queue.set_notifier(sender);
        drop(receiver);

        queue.push(frozen(1, &["a"]), Arc::clone(&dir));
        assert!(!queue.is_empty());
        assert_eq!(queue.flush().unwrap(), 1);
        assert!(dir.exists("segment_1/segment_info"));
    }

    #[test]
    fn drain_on_empty_queue_returns_immediately() {
        let queue = DumpQueue::new();
        assert_eq!(queue.drain().unwrap(), 0);
    }
}
