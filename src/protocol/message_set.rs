use bytes::{Buf, Bytes};
pub use kafka_protocol::records::Record;
use kafka_protocol::records::RecordBatchDecoder;

use crate::error::ProtocolError;

/// offset (int64) + message size (int32)
const LOG_OVERHEAD: usize = 12;
/// offset, message size and crc come before the magic byte
const MAGIC_OFFSET: usize = 16;
const ATTRIBUTES_OFFSET: usize = MAGIC_OFFSET + 1;
const COMPRESSION_CODEC_MASK: i8 = 0x07;

/// Ordered records returned for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSet {
    records: Vec<Record>,
}

impl MessageSet {
    /// Decodes every complete message in `src`.
    ///
    /// The broker cuts the set at the partition's `max_bytes`, so the last message
    /// may be partial. It is dropped and will be returned by the next fetch. Only
    /// uncompressed messages of magic 0 and 1 are accepted.
    pub fn decode(mut src: Bytes) -> Result<Self, ProtocolError> {
        let mut records = Vec::new();
        while src.remaining() >= LOG_OVERHEAD {
            let size = (&src[LOG_OVERHEAD - 4..LOG_OVERHEAD]).get_i32();
            if size < 0 {
                return Err(ProtocolError::NegativeLength {
                    field: "message_size",
                    length: size,
                });
            }
            if src.remaining() - LOG_OVERHEAD < size as usize {
                break;
            }

            let mut entry = src.split_to(LOG_OVERHEAD + size as usize);
            if let Some(&magic) = entry.get(MAGIC_OFFSET) {
                let magic = magic as i8;
                if !(0..=1).contains(&magic) {
                    return Err(ProtocolError::UnsupportedMagic(magic));
                }
            }
            if let Some(&attributes) = entry.get(ATTRIBUTES_OFFSET) {
                let codec = attributes as i8 & COMPRESSION_CODEC_MASK;
                if codec != 0 {
                    return Err(ProtocolError::UnsupportedCompression(codec));
                }
            }

            let set = RecordBatchDecoder::decode(&mut entry).map_err(ProtocolError::decode)?;
            records.extend(set.records);
        }
        Ok(MessageSet { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|record| record.offset)
    }
}

impl IntoIterator for MessageSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
