//! On-disk superblock for one realtime group.
//!
//! A single metadata block holding the group geometry and the running
//! counters. Fields are fixed-offset little-endian; the codec is
//! hand-rolled so the layout is explicit and versionable.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0  | 4 | magic (`RIL1`) |
//! | 4  | 2 | version |
//! | 6  | 2 | feature flags |
//! | 8  | 4 | block size (bytes) |
//! | 12 | 4 | unit size (bytes) |
//! | 16 | 8 | total units |
//! | 24 | 8 | bitmap blocks |
//! | 32 | 2 | summary levels |
//! | 40 | 8 | summary blocks |
//! | 48 | 8 | log blocks (resize capacity gate) |
//! | 56 | 8 | free units |
//! | 64 | 8 | placement sequence counter |
//! | 72 | 1 | sequence counter initialized flag |

use rill_types::{
    ParseError, read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};

/// Superblock magic: `RIL1` as little-endian bytes.
pub const RILL_SUPER_MAGIC: u32 = 0x314C_4952;

/// Current on-disk format version.
pub const RILL_SUPER_VERSION: u16 = 1;

/// Extent-sharing feature bit; allocation-incompatible with resize.
pub const FEAT_REFLINK: u16 = 1 << 0;
/// Quota accounting feature bit; allocation-incompatible with resize.
pub const FEAT_QUOTA: u16 = 1 << 1;

/// Parsed superblock contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtSuperblock {
    pub version: u16,
    pub flags: u16,
    pub block_size: u32,
    pub unit_size_bytes: u32,
    pub total_units: u64,
    pub bitmap_blocks: u64,
    pub sum_levels: u8,
    pub sum_blocks: u64,
    pub log_blocks: u64,
    pub free_units: u64,
    pub alloc_seq: u64,
    pub seq_init: bool,
}

impl RtSuperblock {
    /// Decode from a raw superblock block.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != RILL_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(RILL_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u16(data, 4)?;
        if version != RILL_SUPER_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unknown superblock version",
            });
        }

        let sum_levels = read_le_u16(data, 32)?;
        let sum_levels =
            u8::try_from(sum_levels).map_err(|_| ParseError::IntegerConversion {
                field: "sum_levels",
            })?;

        Ok(Self {
            version,
            flags: read_le_u16(data, 6)?,
            block_size: read_le_u32(data, 8)?,
            unit_size_bytes: read_le_u32(data, 12)?,
            total_units: read_le_u64(data, 16)?,
            bitmap_blocks: read_le_u64(data, 24)?,
            sum_levels,
            sum_blocks: read_le_u64(data, 40)?,
            log_blocks: read_le_u64(data, 48)?,
            free_units: read_le_u64(data, 56)?,
            alloc_seq: read_le_u64(data, 64)?,
            seq_init: data.get(72).copied().unwrap_or(0) != 0,
        })
    }

    /// Encode into a zeroed block-sized buffer.
    #[must_use]
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        write_le_u32(&mut buf, 0, RILL_SUPER_MAGIC);
        write_le_u16(&mut buf, 4, self.version);
        write_le_u16(&mut buf, 6, self.flags);
        write_le_u32(&mut buf, 8, self.block_size);
        write_le_u32(&mut buf, 12, self.unit_size_bytes);
        write_le_u64(&mut buf, 16, self.total_units);
        write_le_u64(&mut buf, 24, self.bitmap_blocks);
        write_le_u16(&mut buf, 32, u16::from(self.sum_levels));
        write_le_u64(&mut buf, 40, self.sum_blocks);
        write_le_u64(&mut buf, 48, self.log_blocks);
        write_le_u64(&mut buf, 56, self.free_units);
        write_le_u64(&mut buf, 64, self.alloc_seq);
        buf[72] = u8::from(self.seq_init);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RtSuperblock {
        RtSuperblock {
            version: RILL_SUPER_VERSION,
            flags: 0,
            block_size: 512,
            unit_size_bytes: 4096,
            total_units: 100_000,
            bitmap_blocks: 25,
            sum_levels: 17,
            sum_blocks: 4,
            log_blocks: 2048,
            free_units: 99_000,
            alloc_seq: 7,
            seq_init: true,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = sample();
        let buf = sb.encode(512);
        assert_eq!(buf.len(), 512);
        assert_eq!(RtSuperblock::decode(&buf).unwrap(), sb);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample().encode(512);
        buf[0] ^= 0xFF;
        assert!(matches!(
            RtSuperblock::decode(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = sample().encode(512);
        write_le_u16(&mut buf, 4, 9);
        assert!(matches!(
            RtSuperblock::decode(&buf),
            Err(ParseError::InvalidField {
                field: "version",
                ..
            })
        ));
    }

    #[test]
    fn rejects_truncated_block() {
        let buf = sample().encode(512);
        assert!(RtSuperblock::decode(&buf[..40]).is_err());
    }
}
