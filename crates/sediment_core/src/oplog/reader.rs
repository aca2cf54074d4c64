//! Decoding of persisted operation logs.

use crate::error::{CoreError, CoreResult};
use crate::oplog::record::{
    Operation, OperationType, CRC_SIZE, HEADER_SIZE, OPLOG_MAGIC, OPLOG_VERSION,
};

/// Iterator over the records of an encoded operation log.
///
/// # Error Handling
///
/// - A truncated record at the tail (incomplete header or payload) ends the
///   log; it is the remnant of an interrupted append
/// - CRC mismatches, bad magic and unknown record types are errors
///
/// # Example
///
/// ```ignore
/// for result in OperationLogReader::new(&bytes) {
///     let (offset, op) = result?;
/// }
/// ```
pub struct OperationLogReader<'a> {
    data: &'a [u8],
    offset: usize,
    finished: bool,
    truncated_tail: bool,
}

impl<'a> OperationLogReader<'a> {
    /// Creates a reader over an encoded log.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            finished: false,
            truncated_tail: false,
        }
    }

    /// Returns true if iteration stopped at an incomplete trailing record.
    #[must_use]
    pub fn truncated_tail(&self) -> bool {
        self.truncated_tail
    }

    /// Returns the offset after the last decoded record.
    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(usize, Operation)>> {
        let start = self.offset;
        let remaining = &self.data[start..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len() < HEADER_SIZE {
            self.truncated_tail = true;
            return Ok(None);
        }

        let header = &remaining[..HEADER_SIZE];
        if header[0..4] != OPLOG_MAGIC {
            return Err(CoreError::corruption(
                "operation_log",
                format!("invalid magic at offset {start}"),
            ));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > OPLOG_VERSION {
            return Err(CoreError::corruption(
                "operation_log",
                format!("unsupported version {version} at offset {start}"),
            ));
        }
        let type_byte = header[6];
        let op_type = OperationType::from_byte(type_byte).ok_or_else(|| {
            CoreError::corruption(
                "operation_log",
                format!("unknown record type {type_byte} at offset {start}"),
            )
        })?;
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining.len() < total_len {
            self.truncated_tail = true;
            return Ok(None);
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            remaining[payload_end],
            remaining[payload_end + 1],
            remaining[payload_end + 2],
            remaining[payload_end + 3],
        ]);
        let computed_crc = crc32fast::hash(&remaining[..payload_end]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let op = Operation::decode_payload(op_type, &remaining[HEADER_SIZE..payload_end])?;
        self.offset += total_len;
        Ok(Some((start, op)))
    }
}

impl Iterator for OperationLogReader<'_> {
    type Item = CoreResult<(usize, Operation)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Decodes every operation in `data`.
///
/// # Errors
///
/// Fails on checksum mismatch or corruption. A truncated tail is tolerated.
pub fn decode_operations(data: &[u8]) -> CoreResult<Vec<Operation>> {
    OperationLogReader::new(data)
        .map(|item| item.map(|(_, op)| op))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::Locator;
    use crate::oplog::record::OperationKind;
    use crate::types::SegmentId;
    use proptest::prelude::*;

    fn op(seq: u64, pk: &str) -> Operation {
        Operation {
            origin: SegmentId::new(1),
            seq,
            locator: Locator::new(0, seq as i64),
            timestamp: seq as i64,
            kind: OperationKind::Add { pk: pk.to_string() },
        }
    }

    fn encode_all(ops: &[Operation]) -> Vec<u8> {
        ops.iter().flat_map(|op| op.encode().unwrap()).collect()
    }

    #[test]
    fn empty_log_has_no_records() {
        assert!(decode_operations(&[]).unwrap().is_empty());
    }

    #[test]
    fn reports_record_offsets() {
        let ops = vec![op(0, "a"), op(1, "b")];
        let data = encode_all(&ops);
        let first_len = ops[0].encode().unwrap().len();

        let offsets: Vec<usize> = OperationLogReader::new(&data)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(offsets, vec![0, first_len]);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let ops = vec![op(0, "a"), op(1, "b")];
        let data = encode_all(&ops);

        let mut reader = OperationLogReader::new(&data[..data.len() - 3]);
        let decoded: Vec<_> = reader.by_ref().collect::<CoreResult<_>>().unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(reader.truncated_tail());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut data = encode_all(&[op(0, "a")]);
        data[HEADER_SIZE + 2] ^= 0xFF;
        let err = decode_operations(&data).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut data = encode_all(&[op(0, "a")]);
        data[0] = b'X';
        assert!(decode_operations(&data).is_err());
    }

    proptest! {
        #[test]
        fn any_prefix_decodes_a_prefix(cut in 0usize..200) {
            let ops: Vec<_> = (0..5).map(|i| op(i, "key")).collect();
            let data = encode_all(&ops);
            let cut = cut.min(data.len());
            let decoded = decode_operations(&data[..cut]).unwrap();
            prop_assert!(decoded.len() <= ops.len());
            prop_assert_eq!(&decoded[..], &ops[..decoded.len()]);
        }
    }
}
