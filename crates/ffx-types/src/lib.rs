#![forbid(unsafe_code)]
//! Shared types for FrankenFX.
//!
//! Unit-carrying newtypes (blocks, inodes, groups, byte offsets), the fixed
//! on-disk constants of the classic ext2 layout, the parse-layer error type,
//! and bounds-checked little-endian readers used by every decoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Base unit for the log2-encoded block and fragment sizes.
pub const EXT2_MIN_BLOCK_SIZE: u32 = 1024;

/// Accepted derived block-size range (inclusive).
pub const BLOCK_SIZE_MIN: u32 = 512;
pub const BLOCK_SIZE_MAX: u32 = 65_536;

/// On-disk group descriptor record size (rev 0 layout).
pub const GROUP_DESC_SIZE: usize = 32;

/// Fixed inode record size assumed by this extractor.
pub const INODE_RECORD_SIZE: usize = 128;

/// Number of block pointers stored in an inode record.
pub const N_BLOCK_POINTERS: usize = 15;
/// Number of direct block pointers.
pub const N_DIRECT_BLOCKS: usize = 12;
/// Index of the single-indirect pointer inside the block pointer array.
pub const SINGLE_INDIRECT_INDEX: usize = 12;

/// Byte offset of the block pointer array inside an inode record.
pub const INODE_BLOCK_ARRAY_OFFSET: usize = 40;

/// Directory entry header: inode (4) + rec_len (2) + name_len (1) + pad (1).
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset into the image (pread semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !is_valid_block_size(value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size in bytes as `usize` (always fits: at most 64 KiB).
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> ByteOffset {
        ByteOffset(u64::from(block.0) * u64::from(self.0))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
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
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
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
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[must_use]
pub fn is_valid_block_size(value: u32) -> bool {
    value.is_power_of_two() && (BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&value)
}

/// Derive the block size from `s_log_block_size` (`1024 << log`).
///
/// Returns `None` when the shift leaves the `u32` range.
#[must_use]
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

/// Derive the fragment size from the signed `s_log_frag_size`.
///
/// Non-negative values shift 1024 left, negative values shift it right by
/// the magnitude. Returns `None` when the shift leaves the `u32` range.
#[must_use]
pub fn frag_size_from_log(log_frag_size: i32) -> Option<u32> {
    if log_frag_size >= 0 {
        block_size_from_log(log_frag_size.unsigned_abs())
    } else {
        EXT2_MIN_BLOCK_SIZE.checked_shr(log_frag_size.unsigned_abs())
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block numbers render in lowercase hex in every extraction stream.
impl fmt::LowerHex for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    /// `true` for the reserved "no inode" value used by deleted directory slots.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl BlockNumber {
    /// `true` for an unused block pointer slot.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

/// Top nibble of a mode word (`mode >> 12`).
#[must_use]
pub fn mode_type_nibble(mode: u16) -> u8 {
    // A u16 shifted right by 12 always fits in a nibble.
    #[allow(clippy::cast_possible_truncation)]
    let nibble = (mode >> 12) as u8;
    nibble
}

// ── Group geometry ──────────────────────────────────────────────────────────

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(ino.0.saturating_sub(1) / inodes_per_group)
}

/// Compute the index of an inode within its block group.
#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ino.0.saturating_sub(1) % inodes_per_group
}

/// Legal block range `[start, end]` (inclusive) owned by a group.
///
/// The range is `[g * blocks_per_group, (g + 1) * blocks_per_group - 1]`,
/// computed in `u64` so the last group of a large image cannot wrap.
#[must_use]
pub fn group_block_range(group: GroupNumber, blocks_per_group: u32) -> (u64, u64) {
    let per = u64::from(blocks_per_group);
    let start = u64::from(group.0) * per;
    let end = (u64::from(group.0) + 1) * per;
    (start, end.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_u8(&bytes, 7).expect("u8"), 0x90);
        assert_eq!(read_le_i32(&[0xFF, 0xFF, 0xFF, 0xFF], 0).expect("i32"), -1);
    }

    #[test]
    fn test_read_helpers_bounds() {
        let bytes = [0_u8; 6];
        assert_eq!(
            read_le_u32(&bytes, 4),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2,
            })
        );
        assert!(matches!(
            ensure_slice(&bytes, usize::MAX, 2),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn test_block_size_from_log() {
        assert_eq!(block_size_from_log(0), Some(1024));
        assert_eq!(block_size_from_log(1), Some(2048));
        assert_eq!(block_size_from_log(2), Some(4096));
        assert_eq!(block_size_from_log(21), Some(1 << 31));
        assert_eq!(block_size_from_log(22), None);
        assert_eq!(block_size_from_log(u32::MAX), None);
    }

    #[test]
    fn test_frag_size_from_log() {
        assert_eq!(frag_size_from_log(0), Some(1024));
        assert_eq!(frag_size_from_log(2), Some(4096));
        assert_eq!(frag_size_from_log(-1), Some(512));
        assert_eq!(frag_size_from_log(-10), Some(1));
        assert_eq!(frag_size_from_log(-11), Some(0));
        assert_eq!(frag_size_from_log(-40), None);
        assert_eq!(frag_size_from_log(i32::MIN), None);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().get(), 4096);

        // Invalid: not power of two
        assert!(BlockSize::new(3000).is_err());
        // Invalid: too small
        assert!(BlockSize::new(256).is_err());
        // Invalid: too large
        assert!(BlockSize::new(131_072).is_err());
        // Invalid: zero
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_to_byte() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.block_to_byte(BlockNumber(0)), ByteOffset(0));
        assert_eq!(bs.block_to_byte(BlockNumber(5)), ByteOffset(5120));
        let big = BlockSize::new(65536).unwrap();
        assert_eq!(
            big.block_to_byte(BlockNumber(u32::MAX)),
            ByteOffset(u64::from(u32::MAX) * 65536)
        );
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2048), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2049), 2048), GroupNumber(1));

        assert_eq!(inode_index_in_group(InodeNumber(1), 2048), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2), 2048), 1);
        assert_eq!(inode_index_in_group(InodeNumber(2049), 2048), 0);
    }

    #[test]
    fn test_group_block_range() {
        assert_eq!(group_block_range(GroupNumber(0), 8192), (0, 8191));
        assert_eq!(group_block_range(GroupNumber(1), 8192), (8192, 16383));
        assert_eq!(
            group_block_range(GroupNumber(u32::MAX), u32::MAX),
            (
                u64::from(u32::MAX) * u64::from(u32::MAX),
                (u64::from(u32::MAX) + 1) * u64::from(u32::MAX) - 1
            )
        );
    }

    #[test]
    fn test_hex_display() {
        assert_eq!(format!("{:x}", BlockNumber(0x1f4)), "1f4");
        assert_eq!(BlockNumber(500).to_string(), "500");
        assert_eq!(InodeNumber(11).to_string(), "11");
    }

    proptest! {
        #[test]
        fn mode_nibble_is_top_four_bits(mode in any::<u16>()) {
            let nibble = mode_type_nibble(mode);
            prop_assert!(nibble <= 0xF);
            prop_assert_eq!(u16::from(nibble) << 12, mode & S_IFMT);
        }

        #[test]
        fn inode_group_math_round_trips(ino in 1_u32..=u32::MAX, ipg in 1_u32..65_536) {
            let group = inode_to_group(InodeNumber(ino), ipg);
            let index = inode_index_in_group(InodeNumber(ino), ipg);
            prop_assert!(index < ipg);
            prop_assert_eq!(
                u64::from(group.0) * u64::from(ipg) + u64::from(index) + 1,
                u64::from(ino)
            );
        }
    }
}
