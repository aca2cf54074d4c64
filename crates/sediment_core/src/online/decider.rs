//! Choosing how to move a live partition to a target version.

use crate::config::OnlineConfig;
use crate::version::Version;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// The kind of reopen to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenType {
    /// The loaded version is current and nothing needs reclaiming.
    NoNeed,
    /// Mount the new segments and redo real-time operations incrementally.
    Normal,
    /// Reload the target version from scratch and replay every real-time operation.
    Force,
    /// Point the reader at real-time segments that were dumped to disk.
    SwitchRtSegment,
    /// Dump the real-time building segment and rebuild the reader to free memory.
    ReclaimReader,
    /// A normal reopen cannot fit the memory budget.
    UnableNormal,
    /// A force reopen cannot fit the memory budget.
    UnableForce,
    /// The target is older than the loaded version or does not exist.
    Invalid,
}

impl fmt::Display for ReopenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoNeed => "no_need_reopen",
            Self::Normal => "normal_reopen",
            Self::Force => "force_reopen",
            Self::SwitchRtSegment => "switch_rt_segment_reopen",
            Self::ReclaimReader => "reclaim_reader_reopen",
            Self::UnableNormal => "unable_normal_reopen",
            Self::UnableForce => "unable_force_reopen",
            Self::Invalid => "invalid_reopen",
        };
        f.write_str(name)
    }
}

/// What the decider looks at.
#[derive(Debug, Clone, Copy)]
pub struct ReopenInput<'a> {
    /// Version the published reader is built on.
    pub loaded: &'a Version,
    /// Requested version, `None` when it does not exist on disk.
    pub target: Option<&'a Version>,
    /// The caller asked for a force reopen.
    pub force: bool,
    /// Memory held by in-memory real-time segments.
    pub rt_memory: u64,
    /// Real-time segments were dumped but the reader still uses their
    /// in-memory copies.
    pub rt_flushed: bool,
    /// Bytes the target version's segments occupy once loaded.
    pub target_bytes: u64,
}

/// Maps the partition's state to a [`ReopenType`].
#[derive(Debug, Clone)]
pub struct ReopenDecider {
    max_reopen_memory_use: u64,
    max_removed_segments: usize,
    reclaim_threshold: u64,
}

impl ReopenDecider {
    /// Creates a decider from the online configuration.
    #[must_use]
    pub fn new(config: &OnlineConfig) -> Self {
        let reclaim_threshold = (config.rt_memory_quota as f64 * config.reclaim_reader_memory_ratio) as u64;
        Self {
            max_reopen_memory_use: config.max_reopen_memory_use,
            max_removed_segments: config.max_normal_reopen_removed_segments,
            reclaim_threshold,
        }
    }

    /// Decides the reopen type.
    #[must_use]
    pub fn decide(&self, input: &ReopenInput<'_>) -> ReopenType {
        let decision = self.decide_inner(input);
        debug!(
            loaded = %input.loaded.id(),
            target = ?input.target.map(Version::id),
            force = input.force,
            %decision,
            "reopen decision"
        );
        decision
    }

    fn decide_inner(&self, input: &ReopenInput<'_>) -> ReopenType {
        let loaded = input.loaded;
        let Some(target) = input.target else {
            return ReopenType::Invalid;
        };
        if target.id() < loaded.id() {
            return ReopenType::Invalid;
        }
        if target.id() == loaded.id() && !input.force {
            if input.rt_flushed {
                return ReopenType::SwitchRtSegment;
            }
            if input.rt_memory > self.reclaim_threshold {
                return ReopenType::ReclaimReader;
            }
            return ReopenType::NoNeed;
        }

        let forced = input.force || self.needs_force(loaded, target);
        if input.target_bytes > self.max_reopen_memory_use {
            return if forced {
                ReopenType::UnableForce
            } else {
                ReopenType::UnableNormal
            };
        }
        if forced {
            ReopenType::Force
        } else {
            ReopenType::Normal
        }
    }

    fn needs_force(&self, loaded: &Version, target: &Version) -> bool {
        if target.schema_version() != loaded.schema_version() {
            return true;
        }
        let (old, new) = (loaded.locator(), target.locator());
        if !old.is_comparable(&new) {
            return true;
        }
        // Going backwards in the stream cannot be patched incrementally.
        if !old.is_unknown() && !new.is_unknown() && new.offset < old.offset {
            return true;
        }
        let kept: HashSet<_> = target.segments().iter().collect();
        let removed = loaded.segments().iter().filter(|id| !kept.contains(id)).count();
        removed > self.max_removed_segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::Locator;
    use crate::types::SegmentId;

    fn version(base: &Version, segments: &[u32], offset: i64) -> Version {
        let mut editor = base.edit();
        for id in segments {
            editor.add_segment(SegmentId::new(*id));
        }
        editor.set_locator(Locator::new(1, offset));
        editor.build()
    }

    fn decider() -> ReopenDecider {
        ReopenDecider::new(
            &OnlineConfig::default()
                .max_reopen_memory_use(1_000)
                .rt_memory_quota(100)
                .max_normal_reopen_removed_segments(1),
        )
    }

    fn input<'a>(loaded: &'a Version, target: Option<&'a Version>) -> ReopenInput<'a> {
        ReopenInput {
            loaded,
            target,
            force: false,
            rt_memory: 0,
            rt_flushed: false,
            target_bytes: 10,
        }
    }

    #[test]
    fn newer_version_reopens_normally() {
        let v1 = version(&Version::empty(), &[0], 10);
        let v2 = version(&v1, &[1], 20);
        assert_eq!(decider().decide(&input(&v1, Some(&v2))), ReopenType::Normal);
    }

    #[test]
    fn older_or_missing_target_is_invalid() {
        let v1 = version(&Version::empty(), &[0], 10);
        let v2 = version(&v1, &[1], 20);
        assert_eq!(decider().decide(&input(&v2, Some(&v1))), ReopenType::Invalid);
        assert_eq!(decider().decide(&input(&v2, None)), ReopenType::Invalid);
    }

    #[test]
    fn same_version_checks_rt_state() {
        let v1 = version(&Version::empty(), &[0], 10);
        let d = decider();
        assert_eq!(d.decide(&input(&v1, Some(&v1))), ReopenType::NoNeed);

        let mut flushed = input(&v1, Some(&v1));
        flushed.rt_flushed = true;
        flushed.rt_memory = 1_000;
        assert_eq!(d.decide(&flushed), ReopenType::SwitchRtSegment);

        let mut pressured = input(&v1, Some(&v1));
        pressured.rt_memory = 95;
        assert_eq!(d.decide(&pressured), ReopenType::ReclaimReader);
    }

    #[test]
    fn incompatible_targets_force() {
        let v1 = version(&Version::empty(), &[0, 1], 10);
        let d = decider();

        let mut editor = v1.edit();
        editor.set_schema_version(3);
        let schema_changed = editor.build();
        assert_eq!(d.decide(&input(&v1, Some(&schema_changed))), ReopenType::Force);

        let mut editor = v1.edit();
        editor.set_locator(Locator::new(2, 50));
        let other_source = editor.build();
        assert_eq!(d.decide(&input(&v1, Some(&other_source))), ReopenType::Force);

        let rolled_back = version(&v1, &[], 5);
        assert_eq!(d.decide(&input(&v1, Some(&rolled_back))), ReopenType::Force);

        let mut editor = v1.edit();
        editor.remove_segment(SegmentId::new(0)).remove_segment(SegmentId::new(1));
        let merged = editor.build();
        assert_eq!(d.decide(&input(&v1, Some(&merged))), ReopenType::Force);

        let mut forced = input(&v1, Some(&v1));
        forced.force = true;
        assert_eq!(d.decide(&forced), ReopenType::Force);
    }

    #[test]
    fn oversized_target_is_unable() {
        let v1 = version(&Version::empty(), &[0], 10);
        let v2 = version(&v1, &[1], 20);
        let mut big = input(&v1, Some(&v2));
        big.target_bytes = 5_000;
        assert_eq!(decider().decide(&big), ReopenType::UnableNormal);
        big.force = true;
        assert_eq!(decider().decide(&big), ReopenType::UnableForce);
    }
}
