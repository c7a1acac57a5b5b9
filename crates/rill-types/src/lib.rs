#![forbid(unsafe_code)]
//! Core value types for the RillFS realtime allocator.
//!
//! All lengths and offsets in the allocator are expressed in *allocation
//! units*, never bytes. The unit-carrying newtypes here exist to keep unit
//! numbers, bitmap block indexes, and byte quantities from being mixed up
//! at call sites.
//!
//! [`RtGeometry`] is the derived shape of a realtime group: given the
//! metadata block size, the unit size, and the total unit count, every
//! other dimension (bitmap blocks, summary levels, summary blocks) is a
//! pure function of those three. Resize planning computes a candidate
//! `RtGeometry` for a proposed size and compares it against the live one;
//! the candidate is a throwaway value, never an aliased clone of live
//! state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest supported metadata block size in bytes.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest supported metadata block size in bytes.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Smallest supported allocation unit size in bytes (4 KiB).
pub const MIN_UNIT_SIZE: u32 = 4096;
/// Largest supported allocation unit size in bytes (1 GiB).
pub const MAX_UNIT_SIZE: u32 = 1 << 30;

/// Width of one summary counter on disk.
pub const SUMMARY_ENTRY_SIZE: u32 = 4;

/// Index of one allocation unit within the realtime group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitNumber(pub u64);

/// Index of one bitmap block within the realtime bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BitmapBlock(pub u64);

/// A contiguous run of allocation units handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtExtent {
    /// First unit of the run.
    pub start: UnitNumber,
    /// Length in units.
    pub len: u64,
}

impl UnitNumber {
    /// Add a unit count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a unit count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

impl fmt::Display for UnitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BitmapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Immutable shape of a realtime group.
///
/// Everything here is derived from `(block_size, unit_size_bytes,
/// total_units)` by [`RtGeometry::compute`]. The struct is a plain value:
/// resize planning builds a candidate geometry for the proposed size and
/// discards it if the step aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtGeometry {
    /// Metadata block size in bytes (bitmap and summary blocks).
    pub block_size: u32,
    /// Size of one allocation unit in bytes.
    pub unit_size_bytes: u32,
    /// Total allocation units under management.
    pub total_units: u64,
    /// Number of bitmap blocks (bit per unit, rounded up).
    pub bitmap_blocks: u64,
    /// Number of summary levels: `floor(log2(total_units)) + 1`.
    pub sum_levels: u8,
    /// Number of summary blocks holding `sum_levels * bitmap_blocks`
    /// fixed-width counters.
    pub sum_blocks: u64,
}

impl RtGeometry {
    /// Derive the full geometry for a group of `total_units` units.
    ///
    /// Pure: no live state is consulted. Errors are reported as
    /// [`ParseError::InvalidField`] so callers at the mount boundary can
    /// attach their own context.
    pub fn compute(
        block_size: u32,
        unit_size_bytes: u32,
        total_units: u64,
    ) -> Result<Self, ParseError> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        if !(MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&unit_size_bytes) {
            return Err(ParseError::InvalidField {
                field: "unit_size_bytes",
                reason: "must be in 4096..=1073741824",
            });
        }

        let units_per_block = u64::from(block_size) * 8;
        let bitmap_blocks = total_units.div_ceil(units_per_block);

        // Level L accounts free runs of length in [2^L, 2^(L+1)); the top
        // level must cover a run spanning the whole group.
        let sum_levels = match highbit64(total_units) {
            Some(log) => log + 1,
            None => 1,
        };

        let entries = u64::from(sum_levels)
            .checked_mul(bitmap_blocks)
            .ok_or(ParseError::IntegerConversion {
                field: "summary_entries",
            })?;
        let entries_per_block = u64::from(block_size / SUMMARY_ENTRY_SIZE);
        let sum_blocks = entries.div_ceil(entries_per_block);

        Ok(Self {
            block_size,
            unit_size_bytes,
            total_units,
            bitmap_blocks,
            sum_levels,
            sum_blocks,
        })
    }

    /// Allocation units covered by one bitmap block.
    #[must_use]
    pub fn units_per_block(&self) -> u64 {
        u64::from(self.block_size) * 8
    }

    /// Bitmap block containing `unit`.
    #[must_use]
    pub fn unit_to_block(&self, unit: UnitNumber) -> BitmapBlock {
        BitmapBlock(unit.0 / self.units_per_block())
    }

    /// First unit covered by bitmap block `block`.
    #[must_use]
    pub fn block_first_unit(&self, block: BitmapBlock) -> UnitNumber {
        UnitNumber(block.0 * self.units_per_block())
    }

    /// log2 of the bit capacity of one bitmap block.
    ///
    /// Used by the near search to bound how many bitmap blocks a free run
    /// of a given summary level can span.
    #[must_use]
    pub fn block_bit_log(&self) -> u8 {
        #[expect(clippy::cast_possible_truncation)]
        let log = self.units_per_block().ilog2() as u8;
        log
    }

    /// Locate the summary counter for `(level, block)`.
    ///
    /// Counters are packed `level`-major: entry offset is
    /// `level * bitmap_blocks + block`. Returns `(summary block, entry
    /// index within that block)`.
    #[must_use]
    pub fn sum_locate(&self, level: u8, block: BitmapBlock) -> (u64, usize) {
        let offset = u64::from(level) * self.bitmap_blocks + block.0;
        let entries_per_block = u64::from(self.block_size / SUMMARY_ENTRY_SIZE);
        #[expect(clippy::cast_possible_truncation)]
        let index = (offset % entries_per_block) as usize;
        (offset / entries_per_block, index)
    }
}

/// Position of the highest set bit, or `None` for zero.
///
/// `highbit64(len)` is the summary level that accounts a free run of
/// length `len`.
#[must_use]
pub fn highbit64(value: u64) -> Option<u8> {
    if value == 0 {
        return None;
    }
    #[expect(clippy::cast_possible_truncation)]
    let log = value.ilog2() as u8;
    Some(log)
}

/// Round `len` down to a multiple of `prod`.
///
/// A product of 1 (or 0, treated as unaligned) leaves `len` unchanged.
#[must_use]
pub fn align_len_down(len: u64, prod: u64) -> u64 {
    if prod > 1 { len - len % prod } else { len }
}

// ── Parse errors and little-endian field codecs ─────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highbit_basics() {
        assert_eq!(highbit64(0), None);
        assert_eq!(highbit64(1), Some(0));
        assert_eq!(highbit64(2), Some(1));
        assert_eq!(highbit64(3), Some(1));
        assert_eq!(highbit64(4), Some(2));
        assert_eq!(highbit64(u64::MAX), Some(63));
    }

    #[test]
    fn align_len_down_products() {
        assert_eq!(align_len_down(17, 4), 16);
        assert_eq!(align_len_down(16, 4), 16);
        assert_eq!(align_len_down(3, 4), 0);
        // Product 1 and 0 leave the length alone.
        assert_eq!(align_len_down(17, 1), 17);
        assert_eq!(align_len_down(17, 0), 17);
        // Non-power-of-two products are valid.
        assert_eq!(align_len_down(17, 3), 15);
    }

    #[test]
    fn geometry_small_group() {
        // 512-byte blocks = 4096 units per bitmap block.
        let geom = RtGeometry::compute(512, 4096, 64).unwrap();
        assert_eq!(geom.units_per_block(), 4096);
        assert_eq!(geom.bitmap_blocks, 1);
        // 64 units: levels 0..=6 (runs up to length 64).
        assert_eq!(geom.sum_levels, 7);
        // 7 entries fit in one 512-byte block (128 entries).
        assert_eq!(geom.sum_blocks, 1);
    }

    #[test]
    fn geometry_zero_units() {
        let geom = RtGeometry::compute(512, 4096, 0).unwrap();
        assert_eq!(geom.bitmap_blocks, 0);
        assert_eq!(geom.sum_levels, 1);
        assert_eq!(geom.sum_blocks, 0);
    }

    #[test]
    fn geometry_multi_block() {
        // 4096 * 8 = 32768 units per bitmap block.
        let geom = RtGeometry::compute(4096, 4096, 100_000).unwrap();
        assert_eq!(geom.bitmap_blocks, 4);
        assert_eq!(geom.sum_levels, 17);
        // 17 * 4 = 68 entries, 1024 entries per block.
        assert_eq!(geom.sum_blocks, 1);

        assert_eq!(geom.unit_to_block(UnitNumber(0)), BitmapBlock(0));
        assert_eq!(geom.unit_to_block(UnitNumber(32767)), BitmapBlock(0));
        assert_eq!(geom.unit_to_block(UnitNumber(32768)), BitmapBlock(1));
        assert_eq!(geom.block_first_unit(BitmapBlock(2)), UnitNumber(65536));
        assert_eq!(geom.block_bit_log(), 15);
    }

    #[test]
    fn geometry_rejects_bad_sizes() {
        assert!(RtGeometry::compute(500, 4096, 64).is_err());
        assert!(RtGeometry::compute(0, 4096, 64).is_err());
        assert!(RtGeometry::compute(131_072, 4096, 64).is_err());
        assert!(RtGeometry::compute(512, 512, 64).is_err());
        assert!(RtGeometry::compute(512, MAX_UNIT_SIZE, 64).is_ok());
    }

    #[test]
    fn sum_locate_layout() {
        let geom = RtGeometry::compute(512, 4096, 1_000_000).unwrap();
        // 1M units / 4096 per block = 245 bitmap blocks (ceil).
        assert_eq!(geom.bitmap_blocks, 245);
        // Entry offset = level * bitmap_blocks + block; 128 entries/block.
        assert_eq!(geom.sum_locate(0, BitmapBlock(0)), (0, 0));
        assert_eq!(geom.sum_locate(0, BitmapBlock(127)), (0, 127));
        assert_eq!(geom.sum_locate(0, BitmapBlock(128)), (1, 0));
        assert_eq!(geom.sum_locate(1, BitmapBlock(0)), (1, 117));
    }

    #[test]
    fn codec_round_trip() {
        let mut buf = vec![0u8; 16];
        write_le_u16(&mut buf, 0, 0x1234);
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF);
        write_le_u64(&mut buf, 6, 0x0102_0304_0506_0708);
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 6).unwrap(), 0x0102_0304_0506_0708);

        assert!(read_le_u32(&buf, 13).is_err());
        assert_eq!(
            read_le_u64(&buf, 14),
            Err(ParseError::InsufficientData {
                needed: 8,
                offset: 14,
                actual: 2
            })
        );
    }
}
