//! Bit-packed keys and tokens
//!
//! A [`Key`] is an immutable bit string with an explicit bit length. Bits are
//! numbered MSB-first: bit 0 is the most significant bit of byte 0. Any bits
//! past the length inside the last byte are always zero, so equality, ordering
//! and hashing can work on the raw buffer.
//!
//! The buffer is a reference-counted [`Bytes`], so cloning a key and taking
//! whole-byte prefixes/suffixes never copies.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::trie::codec::CodecError;

/// Branch factor outside the supported set
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid branch factor {0}: must be one of 2, 4, 16 or 256")]
pub struct InvalidBranchFactor(pub u32);

/// Number of children a trie node may have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BranchFactor {
    /// 2 children, 1 bit per token
    Two,
    /// 4 children, 2 bits per token
    Four,
    /// 16 children, 4 bits per token
    #[default]
    Sixteen,
    /// 256 children, 8 bits per token
    TwoFiftySix,
}

impl BranchFactor {
    /// All supported branch factors
    pub const ALL: [BranchFactor; 4] = [
        BranchFactor::Two,
        BranchFactor::Four,
        BranchFactor::Sixteen,
        BranchFactor::TwoFiftySix,
    ];

    /// Number of bits needed to index a child
    pub const fn bits_per_token(self) -> usize {
        match self {
            BranchFactor::Two => 1,
            BranchFactor::Four => 2,
            BranchFactor::Sixteen => 4,
            BranchFactor::TwoFiftySix => 8,
        }
    }

    /// Number of children a node may have
    pub const fn num_children(self) -> usize {
        1 << self.bits_per_token()
    }

    /// Build a token of this branch factor's size
    pub fn token(self, value: u8) -> Token {
        Token::new(value, self)
    }
}

impl TryFrom<u32> for BranchFactor {
    type Error = InvalidBranchFactor;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(BranchFactor::Two),
            4 => Ok(BranchFactor::Four),
            16 => Ok(BranchFactor::Sixteen),
            256 => Ok(BranchFactor::TwoFiftySix),
            other => Err(InvalidBranchFactor(other)),
        }
    }
}

impl From<BranchFactor> for u32 {
    fn from(bf: BranchFactor) -> Self {
        bf.num_children() as u32
    }
}

impl fmt::Display for BranchFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.num_children())
    }
}

/// A single B-ary digit of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    value: u8,
    length: usize,
}

impl Token {
    /// Create a token for the given branch factor.
    ///
    /// Panics if `value` does not fit in the branch factor's token size.
    pub fn new(value: u8, branch_factor: BranchFactor) -> Self {
        assert!(
            (value as usize) < branch_factor.num_children(),
            "token {} out of range for branch factor {}",
            value,
            branch_factor
        );
        Self { value, length: branch_factor.bits_per_token() }
    }

    /// Token value, right-aligned
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Token size in bits
    pub fn length(&self) -> usize {
        self.length
    }
}

/// Immutable bit-packed key (also used for key prefixes)
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    /// Number of bits in the key
    length: usize,
    /// Backing bytes, `bytes_needed(length)` long, padding bits zero
    value: Bytes,
}

impl Key {
    /// The empty key, which names the trie root
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a key from whole bytes, copying the input
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            length: bytes.len() * 8,
            value: Bytes::copy_from_slice(bytes),
        }
    }

    /// Rebuild a key from its length and raw buffer, rejecting buffers of the
    /// wrong size or with non-zero padding bits
    pub fn from_parts(length: usize, value: Bytes) -> Result<Self, CodecError> {
        if value.len() != bytes_needed(length) {
            return Err(CodecError::KeyLengthMismatch {
                bits: length,
                bytes: value.len(),
            });
        }
        let remainder = length % 8;
        if remainder != 0 {
            let padding_mask = 0xFFu8 >> remainder;
            if value[value.len() - 1] & padding_mask != 0 {
                return Err(CodecError::NonZeroKeyPadding);
            }
        }
        Ok(Self { length, value })
    }

    /// Length in bits
    pub fn len(&self) -> usize {
        self.length
    }

    /// True iff the key has no bits
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True iff the key does not fill a whole number of bytes
    pub fn has_partial_byte(&self) -> bool {
        self.length % 8 != 0
    }

    /// Raw buffer. Padding bits of the last byte are zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Shared handle to the raw buffer
    pub fn bytes(&self) -> Bytes {
        self.value.clone()
    }

    /// Extract `token_bits` bits starting at `bit_index`, right-aligned.
    ///
    /// Panics if the range reaches past the end of the key: callers only
    /// ever ask for tokens of keys they have already length-checked.
    pub fn token(&self, bit_index: usize, token_bits: usize) -> u8 {
        assert!(
            (1..=8).contains(&token_bits) && bit_index + token_bits <= self.length,
            "token at bit {} of size {} out of range for key of length {}",
            bit_index,
            token_bits,
            self.length
        );
        let byte_index = bit_index / 8;
        let offset = bit_index % 8;
        let mask = ((1u16 << token_bits) - 1) as u8;
        if offset + token_bits <= 8 {
            (self.value[byte_index] >> (8 - offset - token_bits)) & mask
        } else {
            let word = u16::from(self.value[byte_index]) << 8 | u16::from(self.value[byte_index + 1]);
            (word >> (16 - offset - token_bits)) as u8 & mask
        }
    }

    /// True iff `prefix` is a prefix of this key or equal to it
    pub fn has_prefix(&self, prefix: &Key) -> bool {
        if self.length < prefix.length {
            return false;
        }

        let remainder = prefix.length % 8;
        if remainder == 0 {
            return self.value.starts_with(&prefix.value);
        }

        // Compare the meaningful bits of the prefix's partial last byte.
        let last = prefix.value.len() - 1;
        let ignored_bits = 0xFFu8 >> remainder;
        if prefix.value[last] | ignored_bits != self.value[last] | ignored_bits {
            return false;
        }
        self.value.starts_with(&prefix.value[..last])
    }

    /// True iff `prefix` is a prefix of this key but not equal to it
    pub fn has_strict_prefix(&self, prefix: &Key) -> bool {
        self != prefix && self.has_prefix(prefix)
    }

    /// This key with `token` appended
    pub fn append(&self, token: Token) -> Key {
        let length = self.length + token.length;
        let mut buffer = vec![0u8; bytes_needed(length)];
        buffer[..self.value.len()].copy_from_slice(&self.value);
        write_bits(&mut buffer, self.length, token.value, token.length);
        Key { length, value: Bytes::from(buffer) }
    }

    /// This key with `token` appended, followed by all of `extension`
    pub fn append_extend(&self, token: Token, extension: &Key) -> Key {
        let append_length = self.length + token.length;
        let append_bytes = bytes_needed(append_length);
        let length = append_length + extension.length;
        let mut buffer = vec![0u8; bytes_needed(length)];
        buffer[..self.value.len()].copy_from_slice(&self.value);
        write_bits(&mut buffer, self.length, token.value, token.length);

        if extension.is_empty() {
            return Key { length, value: Bytes::from(buffer) };
        }

        let remainder = append_length % 8;
        if remainder == 0 {
            buffer[append_bytes..].copy_from_slice(&extension.value);
        } else {
            // Fill the partial byte with the leading bits of the extension,
            // then copy the rest shifted across byte boundaries.
            buffer[append_bytes - 1] |= extension.value[0] >> remainder;
            shift_copy(&mut buffer[append_bytes..], &extension.value, dual_bit_index(remainder));
        }
        Key { length, value: Bytes::from(buffer) }
    }

    /// Drop the first `bits` bits
    pub fn skip(&self, bits: usize) -> Key {
        if self.length <= bits {
            return Key::empty();
        }
        let length = self.length - bits;
        let remaining = self.value.slice(bits / 8..);

        if bits % 8 == 0 {
            return Key { length, value: remaining };
        }

        let mut buffer = vec![0u8; bytes_needed(length)];
        shift_copy(&mut buffer, &remaining, bits % 8);
        Key { length, value: Bytes::from(buffer) }
    }

    /// Keep only the first `bits` bits
    pub fn take(&self, bits: usize) -> Key {
        if self.length <= bits {
            return self.clone();
        }

        let remainder = bits % 8;
        if remainder == 0 {
            return Key { length: bits, value: self.value.slice(..bits / 8) };
        }

        let mut buffer = self.value[..bytes_needed(bits)].to_vec();
        let last = buffer.len() - 1;
        buffer[last] &= 0xFFu8 << dual_bit_index(remainder);
        Key { length: bits, value: Bytes::from(buffer) }
    }

    /// Length in bits of the longest common prefix of `self` and `other`,
    /// compared token by token from `from_bit` onwards. Both keys are assumed
    /// to agree on the bits before `from_bit`.
    pub fn common_prefix_len(&self, other: &Key, from_bit: usize, token_bits: usize) -> usize {
        let max = self.length.min(other.length);
        let mut bit = from_bit;
        while bit + token_bits <= max && self.token(bit, token_bits) == other.token(bit, token_bits) {
            bit += token_bits;
        }
        bit
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .as_ref()
            .cmp(other.value.as_ref())
            .then(self.length.cmp(&other.length))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(0x{}/{})", hex::encode(&self.value), self.length)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}/{}", hex::encode(&self.value), self.length)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::from_bytes(bytes)
    }
}

/// Wire form of a key: bit length plus raw buffer
#[derive(Serialize, Deserialize)]
struct KeyRepr {
    length: u64,
    value: Bytes,
}

impl Serialize for Key {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        KeyRepr { length: self.length as u64, value: self.value.clone() }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = KeyRepr::deserialize(deserializer)?;
        let length = usize::try_from(repr.length).map_err(serde::de::Error::custom)?;
        Key::from_parts(length, repr.value).map_err(serde::de::Error::custom)
    }
}

/// Number of bytes needed to store `bits` bits. Does not overflow for
/// lengths read from untrusted input.
pub(crate) const fn bytes_needed(bits: usize) -> usize {
    bits / 8 + (bits % 8 != 0) as usize
}

/// The same bit position counted from the other end of a byte,
/// e.g. bit 5 from the right is bit 3 from the left
const fn dual_bit_index(shift: usize) -> usize {
    (8 - shift) % 8
}

/// OR the low `bits` bits of `value` into `buffer` starting at `bit_offset`
fn write_bits(buffer: &mut [u8], bit_offset: usize, value: u8, bits: usize) {
    let byte_index = bit_offset / 8;
    let offset = bit_offset % 8;
    if offset + bits <= 8 {
        buffer[byte_index] |= value << (8 - offset - bits);
    } else {
        let word = u16::from(value) << (16 - offset - bits);
        buffer[byte_index] |= (word >> 8) as u8;
        buffer[byte_index + 1] |= word as u8;
    }
}

/// Treat `src` as a bit array and copy it into `dst` shifted left by `shift`
/// bits, `0 < shift < 8`. Requires `dst.len() >= src.len() - 1`; when equal,
/// the low bits of the last source byte are dropped.
fn shift_copy(dst: &mut [u8], src: &[u8], shift: usize) {
    let dual_shift = dual_bit_index(shift);
    let mut i = 0;
    while i + 1 < src.len() {
        dst[i] = src[i] << shift | src[i + 1] >> dual_shift;
        i += 1;
    }
    if i < dst.len() {
        dst[i] = src[i] << shift;
    }
}
