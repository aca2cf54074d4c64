//! Operation records and their binary encoding.

use crate::error::{CoreError, CoreResult};
use crate::locator::Locator;
use crate::types::{SegmentId, Timestamp};
use std::collections::BTreeMap;

/// Magic bytes identifying an operation record.
pub const OPLOG_MAGIC: [u8; 4] = *b"SOPL";

/// Current operation log format version.
pub const OPLOG_VERSION: u16 = 1;

/// Type of operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    /// Insert a document.
    Add = 1,
    /// Change fields of a document.
    Update = 2,
    /// Delete a document.
    Delete = 3,
}

impl OperationType {
    /// Converts a byte to an operation type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Add),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Converts the operation type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The effect of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// A document with this key was added; older copies are superseded.
    Add {
        /// Primary key.
        pk: String,
    },
    /// Fields of the newest copy of this key changed.
    Update {
        /// Primary key.
        pk: String,
        /// New field values.
        fields: BTreeMap<String, String>,
    },
    /// Every older copy of this key is deleted.
    Delete {
        /// Primary key.
        pk: String,
    },
}

/// One logged operation.
///
/// `origin` is the segment the operation was built into. An operation only
/// ever affects documents in segments with a smaller id than its origin;
/// its effect on the origin segment itself was applied in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Segment the operation was logged in.
    pub origin: SegmentId,
    /// Sequence number within the origin segment.
    pub seq: u64,
    /// Upstream position of the source document.
    pub locator: Locator,
    /// Event time of the source document.
    pub timestamp: Timestamp,
    /// The effect.
    pub kind: OperationKind,
}

impl Operation {
    /// Maximum size for a single string in a record.
    pub const MAX_STRING_SIZE: usize = u32::MAX as usize;

    /// Returns the operation type.
    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Add { .. } => OperationType::Add,
            OperationKind::Update { .. } => OperationType::Update,
            OperationKind::Delete { .. } => OperationType::Delete,
        }
    }

    /// Returns the primary key the operation targets.
    #[must_use]
    pub fn pk(&self) -> &str {
        match &self.kind {
            OperationKind::Add { pk } | OperationKind::Update { pk, .. } | OperationKind::Delete { pk } => pk,
        }
    }

    /// Approximate in-memory size.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let fields: usize = match &self.kind {
            OperationKind::Update { fields, .. } => {
                fields.iter().map(|(k, v)| k.len() + v.len()).sum()
            }
            _ => 0,
        };
        (48 + self.pk().len() + fields) as u64
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a string exceeds [`Self::MAX_STRING_SIZE`].
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.origin.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.locator.src.to_le_bytes());
        buf.extend_from_slice(&self.locator.offset.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        put_string(&mut buf, self.pk())?;
        if let OperationKind::Update { fields, .. } = &self.kind {
            let count = u32::try_from(fields.len())
                .map_err(|_| CoreError::bad_parameter("too many fields in update"))?;
            buf.extend_from_slice(&count.to_le_bytes());
            for (name, value) in fields {
                put_string(&mut buf, name)?;
                put_string(&mut buf, value)?;
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(op_type: OperationType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader { payload, cursor: 0 };
        let origin = SegmentId::new(reader.u32()?);
        let seq = reader.u64()?;
        let src = reader.u64()?;
        let offset = reader.u64()? as i64;
        let timestamp = reader.u64()? as Timestamp;
        let pk = reader.string()?;
        let kind = match op_type {
            OperationType::Add => OperationKind::Add { pk },
            OperationType::Delete => OperationKind::Delete { pk },
            OperationType::Update => {
                let count = reader.u32()?;
                let mut fields = BTreeMap::new();
                for _ in 0..count {
                    let name = reader.string()?;
                    let value = reader.string()?;
                    fields.insert(name, value);
                }
                OperationKind::Update { pk, fields }
            }
        };
        if reader.cursor != payload.len() {
            return Err(corruption(format!(
                "trailing bytes in {op_type:?} record: expected {} bytes, got {}",
                reader.cursor,
                payload.len()
            )));
        }
        Ok(Self {
            origin,
            seq,
            locator: Locator::new(src, offset),
            timestamp,
            kind,
        })
    }

    /// Serializes the record with its envelope.
    ///
    /// Envelope: `magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4)`.
    /// The checksum covers header and payload.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::bad_parameter("operation payload too large"))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&OPLOG_MAGIC);
        buf.extend_from_slice(&OPLOG_VERSION.to_le_bytes());
        buf.push(self.operation_type().as_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Header size: magic (4) + version (2) + type (1) + length (4).
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

fn corruption(message: impl Into<String>) -> CoreError {
    CoreError::corruption("operation_log", message)
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> CoreResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        CoreError::bad_parameter(format!(
            "string of {} bytes exceeds maximum of {} bytes",
            value.len(),
            Operation::MAX_STRING_SIZE
        ))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl PayloadReader<'_> {
    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        let end = self
            .cursor
            .checked_add(n)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| corruption("unexpected end of payload"))?;
        let bytes = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| corruption("invalid u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn string(&mut self) -> CoreResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corruption("invalid utf-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> Operation {
        let mut fields = BTreeMap::new();
        fields.insert("price".to_string(), "12".to_string());
        Operation {
            origin: SegmentId::new(3),
            seq: 9,
            locator: Locator::new(1, 44),
            timestamp: 1_000,
            kind: OperationKind::Update {
                pk: "item-7".to_string(),
                fields,
            },
        }
    }

    #[test]
    fn operation_type_bytes() {
        for t in [OperationType::Add, OperationType::Update, OperationType::Delete] {
            assert_eq!(OperationType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(OperationType::from_byte(0), None);
    }

    #[test]
    fn update_payload_decodes() {
        let op = update();
        let payload = op.encode_payload().unwrap();
        let decoded = Operation::decode_payload(OperationType::Update, &payload).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn unknown_locator_survives_encoding() {
        let op = Operation {
            origin: SegmentId::first_realtime(),
            seq: 0,
            locator: Locator::UNKNOWN,
            timestamp: -1,
            kind: OperationKind::Delete { pk: "k".into() },
        };
        let payload = op.encode_payload().unwrap();
        let decoded = Operation::decode_payload(OperationType::Delete, &payload).unwrap();
        assert!(decoded.locator.is_unknown());
        assert_eq!(decoded.timestamp, -1);
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = update().encode_payload().unwrap();
        payload.push(0);
        let err = Operation::decode_payload(OperationType::Update, &payload).unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let payload = update().encode_payload().unwrap();
        let err = Operation::decode_payload(OperationType::Update, &payload[..10]).unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn envelope_has_header_and_crc() {
        let encoded = update().encode().unwrap();
        assert_eq!(&encoded[..4], &OPLOG_MAGIC);
        let payload_len = update().encode_payload().unwrap().len();
        assert_eq!(encoded.len(), HEADER_SIZE + payload_len + CRC_SIZE);
    }
}
