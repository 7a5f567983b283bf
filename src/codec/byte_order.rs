//! Byte order handling for multi-register values
//!
//! A value spanning one or more 16-bit registers can be laid out with the
//! register (word) order and the byte order within each register chosen
//! independently. The four combinations map onto the conventional
//! ABCD/BADC/CDAB/DCBA naming used in device point tables.

use serde::{Deserialize, Serialize};

/// Register/byte ordering for values spanning one or more registers
///
/// The canonical representation is the value's big-endian byte string.
/// `apply` rearranges canonical bytes into wire layout; because reversing
/// the register sequence and swapping bytes within a register are both
/// self-inverse and independent, the same function also restores canonical
/// order from wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// ABCD: registers high-to-low, bytes big-endian within each register
    #[default]
    BigEndian,
    /// BADC: registers high-to-low, bytes swapped within each register
    BigEndianSwap,
    /// DCBA: registers low-to-high, bytes swapped within each register
    LittleEndian,
    /// CDAB: registers low-to-high, bytes big-endian within each register
    LittleEndianSwap,
}

impl ByteOrder {
    /// Parse the conventional point-table notation ("ABCD", "DCBA", ...)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ABCD" | "BIG_ENDIAN" | "BE" => Some(ByteOrder::BigEndian),
            "BADC" | "BIG_ENDIAN_SWAP" => Some(ByteOrder::BigEndianSwap),
            "DCBA" | "LITTLE_ENDIAN" | "LE" => Some(ByteOrder::LittleEndian),
            "CDAB" | "LITTLE_ENDIAN_SWAP" => Some(ByteOrder::LittleEndianSwap),
            _ => None,
        }
    }

    /// Whether the register sequence is reversed
    fn words_reversed(&self) -> bool {
        matches!(self, ByteOrder::LittleEndian | ByteOrder::LittleEndianSwap)
    }

    /// Whether the two bytes within each register are swapped
    fn bytes_swapped(&self) -> bool {
        matches!(self, ByteOrder::BigEndianSwap | ByteOrder::LittleEndian)
    }

    /// Rearrange a canonical (big-endian) byte string into wire layout
    ///
    /// `bytes` must contain a whole number of registers (even length).
    /// Applying the same order twice restores the input, so the inverse
    /// transform during decode is this same function.
    pub fn apply(&self, bytes: &[u8]) -> Vec<u8> {
        debug_assert!(bytes.len() % 2 == 0, "window must be whole registers");

        let mut words: Vec<[u8; 2]> = bytes
            .chunks_exact(2)
            .map(|c| if self.bytes_swapped() { [c[1], c[0]] } else { [c[0], c[1]] })
            .collect();
        if self.words_reversed() {
            words.reverse();
        }
        words.into_iter().flatten().collect()
    }
}
