//! Canonical binary encoding helpers
//!
//! Integers are unsigned LEB128 varints, booleans are a single 0/1 byte,
//! byte strings are a varint length followed by the bytes, and keys are a
//! varint bit length followed by `ceil(bits / 8)` bytes.
//!
//! The decoder only accepts the canonical form of each primitive, so every
//! value has exactly one encoding.

use bytes::Bytes;
use thiserror::Error;

use crate::crypto::hash::{Id, ID_LEN};
use crate::storage::trie::key::{bytes_needed, Key};

/// Longest valid uvarint encoding of a u64
const MAX_VARINT_LEN: usize = 10;

/// Decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete
    #[error("Codec error: unexpected end of input")]
    UnexpectedEof,

    /// Boolean byte other than 0 or 1
    #[error("Codec error: invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// Varint with redundant trailing zero groups
    #[error("Codec error: non-minimal varint")]
    NonMinimalVarint,

    /// Varint larger than 64 bits
    #[error("Codec error: varint overflows u64")]
    VarintOverflow,

    /// Length prefix does not fit in memory
    #[error("Codec error: length {0} too large")]
    LengthTooLarge(u64),

    /// Padding bits of a key's last byte are set
    #[error("Codec error: key padding bits are not zero")]
    NonZeroKeyPadding,

    /// Key buffer size disagrees with its bit length
    #[error("Codec error: key of {bits} bits stored in {bytes} bytes")]
    KeyLengthMismatch {
        /// Declared bit length
        bits: usize,
        /// Actual buffer size
        bytes: usize,
    },

    /// Child token does not fit in a byte
    #[error("Codec error: child token {0} out of range")]
    TokenOutOfRange(u64),

    /// More children than any branch factor allows
    #[error("Codec error: {0} children exceeds the maximum of 256")]
    TooManyChildren(u64),

    /// Child tokens not strictly increasing
    #[error("Codec error: children are not in ascending token order")]
    ChildrenOutOfOrder,

    /// Extra bytes after the encoded value
    #[error("Codec error: {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Result type for decoding
pub type CodecResult<T> = Result<T, CodecError>;

/// Append `value` as an unsigned varint
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Append a length-prefixed byte string
pub fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_uvarint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Append a presence flag, followed by the bytes when present
pub fn write_maybe_bytes(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            write_bool(buf, true);
            write_bytes(buf, bytes);
        }
        None => write_bool(buf, false),
    }
}

/// Append a key as its bit length followed by its packed bytes
pub fn write_key(buf: &mut Vec<u8>, key: &Key) {
    write_uvarint(buf, key.len() as u64);
    buf.extend_from_slice(key.as_bytes());
}

pub fn write_id(buf: &mut Vec<u8>, id: &Id) {
    buf.extend_from_slice(id.as_bytes());
}

/// Strict reader over an encoded buffer
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_uvarint(&mut self) -> CodecResult<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = *self.take(1)?.first().ok_or(CodecError::UnexpectedEof)?;
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                // A zero final group after the first byte could have been omitted.
                if byte == 0 && i > 0 {
                    return Err(CodecError::NonMinimalVarint);
                }
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// Read a varint used as a length, checking it against the bytes left
    fn read_len(&mut self) -> CodecResult<usize> {
        let len = self.read_uvarint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::LengthTooLarge(len))?;
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(len)
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn read_bytes(&mut self) -> CodecResult<Bytes> {
        let len = self.read_len()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_maybe_bytes(&mut self) -> CodecResult<Option<Bytes>> {
        if self.read_bool()? {
            self.read_bytes().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_key(&mut self) -> CodecResult<Key> {
        let bits = self.read_uvarint()?;
        let bits = usize::try_from(bits).map_err(|_| CodecError::LengthTooLarge(bits))?;
        let len = bytes_needed(bits);
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        Key::from_parts(bits, Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_id(&mut self) -> CodecResult<Id> {
        let bytes = self.take(ID_LEN)?;
        Id::from_slice(bytes).ok_or(CodecError::UnexpectedEof)
    }

    /// Fail if anything is left unread
    pub fn finish(self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}
