//! Releasing readers, segments and real-time files nothing uses any more.

use crate::counter::{names, CounterMap};
use crate::error::CoreResult;
use crate::reader::ReaderContainer;
use crate::segment::SegmentArena;
use crate::types::SegmentId;
use parking_lot::Mutex;
use sediment_storage::Directory;
use std::collections::HashSet;
use tracing::{debug, warn};

/// What one cleaning pass released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanStats {
    /// Readers dropped from the container.
    pub evicted_readers: usize,
    /// Segments dropped from the arena.
    pub released_segments: Vec<SegmentId>,
    /// Real-time segment directories deleted.
    pub removed_rt_segments: Vec<SegmentId>,
}

impl CleanStats {
    /// Returns true if nothing was released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evicted_readers == 0 && self.released_segments.is_empty() && self.removed_rt_segments.is_empty()
    }
}

/// Cleans the shared resources of an online partition.
///
/// The caller holds the cleaner lock and the data lock, so the writer's
/// segment list and the dump queue cannot change underneath.
pub(crate) struct ResourceCleaner<'a> {
    pub(crate) container: &'a ReaderContainer,
    pub(crate) arena: &'a Mutex<SegmentArena>,
    pub(crate) rt_dir: &'a dyn Directory,
    pub(crate) counters: &'a CounterMap,
}

impl ResourceCleaner<'_> {
    /// Runs one pass.
    ///
    /// `writer_segments` are the segments of the live writer; `dumping`
    /// are real-time segments still queued or being written.
    pub(crate) fn clean(&self, writer_segments: &HashSet<SegmentId>, dumping: &[SegmentId]) -> CoreResult<CleanStats> {
        let evicted_readers = self.container.evict_unused();
        self.counters
            .acc(names::EVICTED_READER_COUNT)
            .increment(evicted_readers as i64);

        let mut live = self.container.used_segments();
        live.extend(writer_segments.iter().copied());
        let released_segments = self.arena.lock().collect(&live);

        let mut removed_rt_segments = Vec::new();
        for name in self.rt_dir.list("")? {
            let Some(id) = SegmentId::from_dir_name(&name) else {
                continue;
            };
            if !id.is_realtime() || live.contains(&id) || dumping.contains(&id) {
                continue;
            }
            match self.rt_dir.remove(&name) {
                Ok(()) => removed_rt_segments.push(id),
                Err(e) => warn!(segment = %id, error = %e, "failed to remove real-time segment"),
            }
        }

        let stats = CleanStats {
            evicted_readers,
            released_segments,
            removed_rt_segments,
        };
        if !stats.is_empty() {
            debug!(
                evicted_readers = stats.evicted_readers,
                released = stats.released_segments.len(),
                removed_rt = stats.removed_rt_segments.len(),
                "cleaned online partition"
            );
        }
        Ok(stats)
    }
}
