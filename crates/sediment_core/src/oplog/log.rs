//! In-memory operation log of a building segment.

use crate::error::CoreResult;
use crate::locator::Locator;
use crate::oplog::record::{Operation, OperationKind};
use crate::types::{SegmentId, Timestamp};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Append-only operation log owned by one building segment.
///
/// Appends happen under the writer's lock; readers (redo, dump) take
/// snapshots of a prefix. The log never shrinks.
#[derive(Debug)]
pub struct OperationLog {
    origin: SegmentId,
    ops: RwLock<Vec<Operation>>,
    bytes: AtomicU64,
}

impl OperationLog {
    /// Creates an empty log for segment `origin`.
    #[must_use]
    pub fn new(origin: SegmentId) -> Self {
        Self {
            origin,
            ops: RwLock::new(Vec::new()),
            bytes: AtomicU64::new(0),
        }
    }

    /// Appends an operation and returns the logged record.
    pub fn append(&self, locator: Locator, timestamp: Timestamp, kind: OperationKind) -> Operation {
        let mut ops = self.ops.write();
        let op = Operation {
            origin: self.origin,
            seq: ops.len() as u64,
            locator,
            timestamp,
            kind,
        };
        self.bytes.fetch_add(op.estimated_size(), Ordering::Relaxed);
        ops.push(op.clone());
        op
    }

    /// Number of logged operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.read().len()
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }

    /// Approximate memory held by the log.
    #[must_use]
    pub fn memory_use(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Copies operations `[from, to)`, clamped to the current length.
    #[must_use]
    pub fn range(&self, from: usize, to: usize) -> Vec<Operation> {
        let ops = self.ops.read();
        let to = to.min(ops.len());
        if from >= to {
            return Vec::new();
        }
        ops[from..to].to_vec()
    }

    /// Copies every operation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Operation> {
        self.ops.read().clone()
    }

    /// Encodes every operation in log order.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        encode_operations(&self.ops.read())
    }
}

/// Encodes operations back to back.
pub fn encode_operations(ops: &[Operation]) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    for op in ops {
        buf.extend_from_slice(&op.encode()?);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::decode_operations;

    #[test]
    fn append_assigns_sequence_numbers() {
        let log = OperationLog::new(SegmentId::new(4));
        let a = log.append(Locator::new(0, 1), 1, OperationKind::Add { pk: "a".into() });
        let b = log.append(Locator::new(0, 2), 2, OperationKind::Delete { pk: "a".into() });

        assert_eq!((a.seq, b.seq), (0, 1));
        assert_eq!(a.origin, SegmentId::new(4));
        assert_eq!(log.len(), 2);
        assert!(log.memory_use() > 0);
    }

    #[test]
    fn range_is_clamped() {
        let log = OperationLog::new(SegmentId::new(0));
        for i in 0..3 {
            log.append(Locator::new(0, i), i, OperationKind::Add { pk: format!("k{i}") });
        }
        assert_eq!(log.range(1, 10).len(), 2);
        assert!(log.range(5, 10).is_empty());
    }

    #[test]
    fn encoded_log_decodes_in_order() {
        let log = OperationLog::new(SegmentId::new(2));
        log.append(Locator::new(0, 1), 1, OperationKind::Add { pk: "x".into() });
        log.append(Locator::new(0, 2), 2, OperationKind::Delete { pk: "y".into() });

        let decoded = decode_operations(&log.encode().unwrap()).unwrap();
        assert_eq!(decoded, log.snapshot());
    }
}
