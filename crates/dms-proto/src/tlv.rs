//! Tag-length-value codec.
//!
//! Item layout: `tag (1 byte) || length (1 or 2 bytes) || value`.
//! Lengths below 0x80 take one byte. Longer values use two bytes, big-endian,
//! with the top bit of the first byte set, which caps a single value at
//! 0x7FFF bytes. A packet never exceeds [`MAX_PACKET_SIZE`].
//!
//! Tags inside one packet must be strictly increasing; both the writer and
//! the reader enforce that.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest packet the session layer will carry.
pub const MAX_PACKET_SIZE: usize = 256;

const SHORT_LEN_LIMIT: usize = 0x80;
const LONG_LEN_FLAG: u8 = 0x80;
const MAX_VALUE_LEN: usize = 0x7FFF;

/// TLV encode/decode errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("packet too large: {0} bytes (max: {1})")]
    PacketTooLarge(usize, usize),

    #[error("value too long for tag {tag}: {len} bytes")]
    ValueTooLong { tag: u8, len: usize },

    #[error("truncated item for tag {tag}: need {needed} more bytes")]
    Truncated { tag: u8, needed: usize },

    #[error("tag {tag} out of order after tag {previous}")]
    OutOfOrder { previous: u8, tag: u8 },

    #[error("invalid length for tag {tag}: expected {expected}, got {actual}")]
    InvalidLength { tag: u8, expected: usize, actual: usize },

    #[error("tag {tag} is not valid UTF-8")]
    InvalidUtf8 { tag: u8 },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unexpected command id {0}")]
    UnexpectedCommand(u16),
}

/// Builds a TLV packet.
pub struct TlvWriter {
    buf: BytesMut,
    last_tag: Option<u8>,
    max_packet_size: usize,
}

impl TlvWriter {
    /// Create a writer bounded by [`MAX_PACKET_SIZE`].
    pub fn new() -> Self {
        Self::with_limit(MAX_PACKET_SIZE)
    }

    /// Create a writer with a custom packet bound.
    pub fn with_limit(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_packet_size.min(MAX_PACKET_SIZE)),
            last_tag: None,
            max_packet_size,
        }
    }

    /// Append a big-endian u16 value.
    pub fn put_u16(&mut self, tag: u8, value: u16) -> Result<&mut Self, TlvError> {
        self.put_raw(tag, &value.to_be_bytes())
    }

    /// Append a UTF-8 string value (no terminator on the wire).
    pub fn put_str(&mut self, tag: u8, value: &str) -> Result<&mut Self, TlvError> {
        self.put_raw(tag, value.as_bytes())
    }

    /// Append raw bytes.
    pub fn put_raw(&mut self, tag: u8, value: &[u8]) -> Result<&mut Self, TlvError> {
        if let Some(previous) = self.last_tag {
            if tag <= previous {
                return Err(TlvError::OutOfOrder { previous, tag });
            }
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(TlvError::ValueTooLong { tag, len: value.len() });
        }

        let header = if value.len() < SHORT_LEN_LIMIT { 2 } else { 3 };
        let total = self.buf.len() + header + value.len();
        if total > self.max_packet_size {
            return Err(TlvError::PacketTooLarge(total, self.max_packet_size));
        }

        self.buf.put_u8(tag);
        if value.len() < SHORT_LEN_LIMIT {
            self.buf.put_u8(value.len() as u8);
        } else {
            self.buf.put_u8(LONG_LEN_FLAG | (value.len() >> 8) as u8);
            self.buf.put_u8((value.len() & 0xFF) as u8);
        }
        self.buf.extend_from_slice(value);
        self.last_tag = Some(tag);
        Ok(self)
    }

    /// Current encoded size.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the packet.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for TlvWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterates over the items of a TLV packet.
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
    last_tag: Option<u8>,
}

impl<'a> TlvReader<'a> {
    /// Create a reader, rejecting packets above [`MAX_PACKET_SIZE`].
    pub fn new(data: &'a [u8]) -> Result<Self, TlvError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(TlvError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
        }
        Ok(Self {
            data,
            pos: 0,
            last_tag: None,
        })
    }

    /// Read the next item, or `None` at the end of the packet.
    pub fn next_item(&mut self) -> Result<Option<(u8, &'a [u8])>, TlvError> {
        let rest = &self.data[self.pos..];
        let Some((&tag, rest)) = rest.split_first() else {
            return Ok(None);
        };

        if let Some(previous) = self.last_tag {
            if tag <= previous {
                return Err(TlvError::OutOfOrder { previous, tag });
            }
        }

        let Some((&first, rest)) = rest.split_first() else {
            return Err(TlvError::Truncated { tag, needed: 1 });
        };
        let (len, rest, header) = if first & LONG_LEN_FLAG == 0 {
            (first as usize, rest, 2)
        } else {
            let Some((&second, rest)) = rest.split_first() else {
                return Err(TlvError::Truncated { tag, needed: 1 });
            };
            ((((first & !LONG_LEN_FLAG) as usize) << 8) | second as usize, rest, 3)
        };

        if rest.len() < len {
            return Err(TlvError::Truncated {
                tag,
                needed: len - rest.len(),
            });
        }

        self.pos += header + len;
        self.last_tag = Some(tag);
        Ok(Some((tag, &rest[..len])))
    }
}

/// Interpret a value as a big-endian u16.
pub fn read_u16(tag: u8, value: &[u8]) -> Result<u16, TlvError> {
    let bytes: [u8; 2] = value.try_into().map_err(|_| TlvError::InvalidLength {
        tag,
        expected: 2,
        actual: value.len(),
    })?;
    Ok(u16::from_be_bytes(bytes))
}

/// Interpret a value as a UTF-8 string.
pub fn read_str(tag: u8, value: &[u8]) -> Result<String, TlvError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| TlvError::InvalidUtf8 { tag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_and_long_lengths() {
        let long = "x".repeat(200);
        let mut writer = TlvWriter::new();
        writer.put_u16(1, 7).unwrap();
        writer.put_str(2, &long).unwrap();
        let packet = writer.finish();

        // tag + 1-byte length + 2 bytes, then tag + 2-byte length + 200 bytes
        assert_eq!(packet.len(), 4 + 3 + 200);
        assert_eq!(packet[5], 0x80);
        assert_eq!(packet[6], 200);

        let mut reader = TlvReader::new(&packet).unwrap();
        let (tag, value) = reader.next_item().unwrap().unwrap();
        assert_eq!((tag, read_u16(tag, value).unwrap()), (1, 7));
        let (tag, value) = reader.next_item().unwrap().unwrap();
        assert_eq!(tag, 2);
        assert_eq!(value.len(), 200);
        assert!(reader.next_item().unwrap().is_none());
    }

    #[test]
    fn test_writer_rejects_out_of_order_tags() {
        let mut writer = TlvWriter::new();
        writer.put_u16(3, 1).unwrap();
        let err = writer.put_u16(2, 1).map(|_| ()).unwrap_err();
        assert_eq!(err, TlvError::OutOfOrder { previous: 3, tag: 2 });
    }

    #[test]
    fn test_writer_enforces_packet_limit() {
        let mut writer = TlvWriter::new();
        let err = writer.put_str(1, &"a".repeat(MAX_PACKET_SIZE)).map(|_| ()).unwrap_err();
        assert!(matches!(err, TlvError::PacketTooLarge(_, MAX_PACKET_SIZE)));
        assert!(writer.is_empty());
    }

    #[test]
    fn test_reader_reports_truncation() {
        let packet = [1u8, 5, b'a', b'b'];
        let mut reader = TlvReader::new(&packet).unwrap();
        assert_eq!(
            reader.next_item().unwrap_err(),
            TlvError::Truncated { tag: 1, needed: 3 }
        );
    }

    #[test]
    fn test_reader_rejects_duplicate_tags() {
        let packet = [1u8, 0, 1, 0];
        let mut reader = TlvReader::new(&packet).unwrap();
        assert!(reader.next_item().unwrap().is_some());
        assert_eq!(
            reader.next_item().unwrap_err(),
            TlvError::OutOfOrder { previous: 1, tag: 1 }
        );
    }

    #[test]
    fn test_read_u16_wrong_width() {
        assert_eq!(
            read_u16(4, &[1, 2, 3]).unwrap_err(),
            TlvError::InvalidLength { tag: 4, expected: 2, actual: 3 }
        );
    }

    proptest! {
        #[test]
        fn prop_reader_never_panics(data in prop::collection::vec(any::<u8>(), 0..MAX_PACKET_SIZE)) {
            let mut reader = TlvReader::new(&data)?;
            for _ in 0..data.len() + 1 {
                match reader.next_item() {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
