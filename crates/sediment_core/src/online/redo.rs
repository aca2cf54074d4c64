//! Replaying real-time operations onto a freshly loaded reader.
//!
//! A reopen builds its new overlay from the target version alone. Real-time
//! operations logged since then are redone on top, in log order, skipping the
//! ones the target version already covers. The [`RedoCursor`] remembers how
//! far the log was replayed so repeated catch-up passes never apply an
//! operation twice.

use crate::config::OnlineConfig;
use crate::counter::{names, CounterMap};
use crate::error::{CoreError, CoreResult};
use crate::locator::Locator;
use crate::partition_data::PartitionData;
use crate::reader::{PatchModifier, PatchOverlay};
use crate::types::SegmentId;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Position in the real-time operation log: a segment and an offset into
/// its log.
///
/// Everything before the position has been redone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RedoCursor {
    segment: SegmentId,
    offset: usize,
}

impl RedoCursor {
    /// The position before every operation.
    pub const START: Self = Self {
        segment: SegmentId(0),
        offset: 0,
    };

    /// Creates a cursor.
    #[must_use]
    pub const fn new(segment: SegmentId, offset: usize) -> Self {
        Self { segment, offset }
    }

    /// Segment the cursor points into.
    #[must_use]
    pub const fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Operations of that segment already redone.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// First operation index of `segment` not yet redone.
    fn start_in(&self, segment: SegmentId) -> Option<usize> {
        match segment.cmp(&self.segment) {
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Equal => Some(self.offset),
            std::cmp::Ordering::Greater => Some(0),
        }
    }
}

impl Default for RedoCursor {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for RedoCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}

/// Limits of the catch-up passes run before the final pass.
#[derive(Debug, Clone, Copy)]
pub struct RedoBudget {
    /// Catch-up stops once at most this many operations remain.
    pub catch_up_threshold: usize,
    /// Catch-up passes allowed.
    pub max_iterations: usize,
    /// Time allowed for all catch-up passes.
    pub max_time: Duration,
}

impl RedoBudget {
    /// Reads the budget from the online configuration.
    #[must_use]
    pub fn from_config(config: &OnlineConfig) -> Self {
        Self {
            catch_up_threshold: config.redo_catch_up_threshold,
            max_iterations: config.max_redo_iterations,
            max_time: config.max_redo_time(),
        }
    }
}

/// Redoes the writer segments' operations of successive data snapshots.
#[derive(Debug)]
pub struct OperationRedoer {
    cursor: RedoCursor,
    covered_by: Locator,
    redone: usize,
    skipped: usize,
}

impl OperationRedoer {
    /// Creates a redoer that skips operations `covered_by` already includes.
    #[must_use]
    pub fn new(covered_by: Locator) -> Self {
        Self {
            cursor: RedoCursor::START,
            covered_by,
            redone: 0,
            skipped: 0,
        }
    }

    /// Returns the cursor.
    #[must_use]
    pub fn cursor(&self) -> RedoCursor {
        self.cursor
    }

    /// Operations applied so far.
    #[must_use]
    pub fn redone(&self) -> usize {
        self.redone
    }

    /// Operations skipped because the version covers them.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Operations in `data`'s writer segments past the cursor.
    #[must_use]
    pub fn remaining(&self, data: &PartitionData) -> usize {
        data.writer_segments()
            .iter()
            .filter_map(|handle| {
                let start = self.cursor.start_in(handle.id())?;
                Some(handle.operation_count().saturating_sub(start))
            })
            .sum()
    }

    /// Redoes every operation of `data` past the cursor into `overlay`.
    ///
    /// Writer documents whose add is covered are hidden first, so uncovered
    /// updates and deletes of them reach the versioned copy.
    ///
    /// Returns the number of operations looked at.
    pub fn redo(&mut self, data: &PartitionData, overlay: &PatchOverlay, counters: &CounterMap) -> usize {
        let modifier = PatchModifier::new(data, overlay);
        modifier.hide_covered_writer_docs(data, self.covered_by);
        let mut seen = 0;
        for handle in data.writer_segments() {
            let Some(start) = self.cursor.start_in(handle.id()) else {
                continue;
            };
            let end = handle.operation_count();
            for op in handle.operations(start, end) {
                if self.covered_by.covers(&op.locator) {
                    self.skipped += 1;
                    counters.acc(names::REDO_SKIP_COUNT).increment(1);
                } else {
                    modifier.apply(&op);
                    self.redone += 1;
                    counters.acc(names::REDO_OPERATION_COUNT).increment(1);
                }
                seen += 1;
            }
            self.cursor = RedoCursor::new(handle.id(), end.max(start));
        }
        seen
    }

    /// Runs catch-up passes over fresh snapshots until few enough operations
    /// remain.
    ///
    /// # Errors
    ///
    /// [`CoreError::Timeout`] if the passes outlive the budget.
    pub fn catch_up<F>(&mut self, mut snapshot: F, overlay: &PatchOverlay, budget: RedoBudget, counters: &CounterMap) -> CoreResult<usize>
    where
        F: FnMut() -> PartitionData,
    {
        let started = Instant::now();
        let mut passes = 0;
        loop {
            let data = snapshot();
            let remaining = self.remaining(&data);
            if remaining <= budget.catch_up_threshold || passes >= budget.max_iterations {
                debug!(passes, remaining, cursor = %self.cursor, "redo catch-up finished");
                return Ok(passes);
            }
            let elapsed = started.elapsed();
            if elapsed >= budget.max_time {
                return Err(CoreError::Timeout {
                    operation: "redo catch-up",
                    elapsed,
                });
            }
            self.redo(&data, overlay, counters);
            passes += 1;
        }
    }
}
