#![forbid(unsafe_code)]

use ffx_types::{
    BlockNumber, DIR_ENTRY_HEADER_LEN, EXT2_SUPER_MAGIC, INODE_BLOCK_ARRAY_OFFSET,
    INODE_RECORD_SIZE, InodeNumber, N_BLOCK_POINTERS, N_DIRECT_BLOCKS, ParseError,
    SINGLE_INDIRECT_INDEX, SUPERBLOCK_SIZE, block_size_from_log, ensure_slice,
    frag_size_from_log, mode_type_nibble, read_le_i32, read_le_u16,
    read_le_u32, read_u8,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Raw superblock fields plus the sizes derived from their log2 encodings.
///
/// Parsing never rejects a superblock; [`Ext2Superblock::validate`] runs every
/// check and reports all violations at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: i32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,

    /// `1024 << log_block_size`, or 0 when the shift is unrepresentable.
    pub block_size: u32,
    /// `1024 << n` / `1024 >> |n|`, or 0 when the shift is unrepresentable.
    pub frag_size: u32,
}

/// One failed superblock invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuperblockViolation {
    InvalidMagic { actual: u16 },
    UnreasonableBlockSize { block_size: u32 },
    InvalidBlockSize { block_size: u32 },
    ZeroBlocksPerGroup,
    BlocksNotGroupAligned { blocks_count: u32, blocks_per_group: u32 },
    BlockCountExceedsImage { blocks_count: u32, image_len: u64 },
    FirstBlockExceedsImage { first_data_block: u32, image_len: u64 },
    ZeroInodesPerGroup,
    InodesNotGroupAligned { inodes_count: u32, inodes_per_group: u32 },
}

impl fmt::Display for SuperblockViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic { actual } => {
                write!(f, "Superblock - invalid magic: {actual:04x}")
            }
            Self::UnreasonableBlockSize { block_size } => {
                write!(f, "Superblock - unreasonable block size: {block_size}")
            }
            Self::InvalidBlockSize { block_size } => {
                write!(f, "Superblock - invalid block size: {block_size}")
            }
            Self::ZeroBlocksPerGroup => f.write_str("Superblock - 0 blocks/group"),
            Self::BlocksNotGroupAligned {
                blocks_count,
                blocks_per_group,
            } => write!(
                f,
                "Superblock - {blocks_count} blocks, {blocks_per_group} blocks/group"
            ),
            Self::BlockCountExceedsImage {
                blocks_count,
                image_len,
            } => write!(
                f,
                "Superblock - invalid block count {blocks_count} > image size {image_len}"
            ),
            Self::FirstBlockExceedsImage {
                first_data_block,
                image_len,
            } => write!(
                f,
                "Superblock - invalid first block {first_data_block} > image size {image_len}"
            ),
            Self::ZeroInodesPerGroup => f.write_str("Superblock - 0 inodes/group"),
            Self::InodesNotGroupAligned {
                inodes_count,
                inodes_per_group,
            } => write!(
                f,
                "Superblock - {inodes_count} inodes, {inodes_per_group} inodes/group"
            ),
        }
    }
}

impl Ext2Superblock {
    /// Parse the fixed fields from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let log_frag_size = read_le_i32(region, 0x1C)?;

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            log_frag_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            magic: read_le_u16(region, 0x38)?,
            block_size: block_size_from_log(log_block_size).unwrap_or(0),
            frag_size: frag_size_from_log(log_frag_size).unwrap_or(0),
        })
    }

    /// Run every superblock check against an image of `image_len` bytes.
    ///
    /// All checks run; the returned list holds every violation in check
    /// order (magic, block size, group alignment, image bounds, inode
    /// alignment). An empty list means the superblock is usable.
    #[must_use]
    pub fn violations(&self, image_len: u64) -> Vec<SuperblockViolation> {
        let mut out = Vec::new();

        if self.magic != EXT2_SUPER_MAGIC {
            out.push(SuperblockViolation::InvalidMagic { actual: self.magic });
        }

        // ── block size ──────────────────────────────────────────────────
        let block_size = self.block_size;
        if !(ffx_types::BLOCK_SIZE_MIN..=ffx_types::BLOCK_SIZE_MAX).contains(&block_size) {
            out.push(SuperblockViolation::UnreasonableBlockSize { block_size });
        }
        if !block_size.is_power_of_two() {
            out.push(SuperblockViolation::InvalidBlockSize { block_size });
        }

        // ── blocks vs. groups ───────────────────────────────────────────
        if self.blocks_per_group == 0 {
            out.push(SuperblockViolation::ZeroBlocksPerGroup);
        } else if self.blocks_count % self.blocks_per_group != 0 {
            out.push(SuperblockViolation::BlocksNotGroupAligned {
                blocks_count: self.blocks_count,
                blocks_per_group: self.blocks_per_group,
            });
        }

        // ── counts vs. image length ─────────────────────────────────────
        if u64::from(self.blocks_count) > image_len {
            out.push(SuperblockViolation::BlockCountExceedsImage {
                blocks_count: self.blocks_count,
                image_len,
            });
        }
        if u64::from(self.first_data_block) > image_len {
            out.push(SuperblockViolation::FirstBlockExceedsImage {
                first_data_block: self.first_data_block,
                image_len,
            });
        }

        // ── inodes vs. groups ───────────────────────────────────────────
        if self.inodes_per_group == 0 {
            out.push(SuperblockViolation::ZeroInodesPerGroup);
        } else if self.inodes_count % self.inodes_per_group != 0 {
            out.push(SuperblockViolation::InodesNotGroupAligned {
                inodes_count: self.inodes_count,
                inodes_per_group: self.inodes_per_group,
            });
        }

        out
    }

    /// Number of block groups: `ceil(blocks_count / blocks_per_group)`.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    /// Byte offset of the group descriptor table.
    ///
    /// The table occupies the block after `first_data_block`: block 2
    /// (byte 2048) for 1 KiB images, block 1 for larger blocks. A 1 KiB image
    /// that claims `first_data_block = 0` therefore places the table at byte
    /// 1024, on top of the superblock; the descriptors decoded there are then
    /// range-checked like any others and usually come out as sentinels.
    #[must_use]
    pub fn group_desc_table_offset(&self) -> u64 {
        (u64::from(self.first_data_block) + 1) * u64::from(self.block_size)
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

/// Raw 32-byte group descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < ffx_types::GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: ffx_types::GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// Inode type tag derived from the top nibble of `i_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    File,
    Symlink,
    Directory,
    Unknown,
}

impl InodeKind {
    /// Classify a mode word. Symlink is tested before directory.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode_type_nibble(mode) {
            0x8 => Self::File,
            0xA => Self::Symlink,
            0x4 => Self::Directory,
            _ => Self::Unknown,
        }
    }

    /// Single-character tag used by the inode stream.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::File => 'f',
            Self::Symlink => 's',
            Self::Directory => 'd',
            Self::Unknown => '?',
        }
    }
}

impl fmt::Display for InodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// The fixed 128-byte inode record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Raw `i_blocks`: 512-byte sectors.
    pub blocks: u32,
    pub block: [u32; N_BLOCK_POINTERS],
}

impl Ext2Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mut block = [0_u32; N_BLOCK_POINTERS];
        for (idx, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, INODE_BLOCK_ARRAY_OFFSET + idx * 4)?;
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            block,
        })
    }

    #[must_use]
    pub fn kind(&self) -> InodeKind {
        InodeKind::from_mode(self.mode)
    }

    /// Sector count halved.
    ///
    /// Only equals the block count for 1 KiB blocks; other block sizes get
    /// the same halving.
    #[must_use]
    pub fn halved_block_count(&self) -> u32 {
        self.blocks / 2
    }

    #[must_use]
    pub fn block_pointers(&self) -> [BlockNumber; N_BLOCK_POINTERS] {
        self.block.map(BlockNumber)
    }

    #[must_use]
    pub fn direct_blocks(&self) -> [BlockNumber; N_DIRECT_BLOCKS] {
        let mut out = [BlockNumber(0); N_DIRECT_BLOCKS];
        for (dst, src) in out.iter_mut().zip(self.block.iter()) {
            *dst = BlockNumber(*src);
        }
        out
    }

    #[must_use]
    pub fn single_indirect(&self) -> BlockNumber {
        BlockNumber(self.block[SINGLE_INDIRECT_INDEX])
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// One slot of a linear directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSlot<'a> {
    /// `inode == 0`: unused or deleted slot.
    Deleted { offset: usize, rec_len: u16 },
    Live {
        offset: usize,
        inode: InodeNumber,
        rec_len: u16,
        name_len: u8,
        name: &'a [u8],
    },
}

impl DirSlot<'_> {
    #[must_use]
    pub fn rec_len(&self) -> u16 {
        match self {
            Self::Deleted { rec_len, .. } | Self::Live { rec_len, .. } => *rec_len,
        }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        match self {
            Self::Deleted { offset, .. } | Self::Live { offset, .. } => *offset,
        }
    }
}

/// Iterator over every slot (live and deleted) of one directory block.
///
/// Yields `Err` once and stops when the block is malformed: a zero
/// `rec_len`, a header that crosses the block end, or a name that crosses
/// the block end. The cursor stops when it reaches or passes the block end.
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }

    /// Current cursor position within the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn fail(&mut self, err: ParseError) -> Option<Result<DirSlot<'a>, ParseError>> {
        self.done = true;
        Some(Err(err))
    }
}

/// Bytes of a slot needed to read `inode` and `rec_len`.
const DIR_ENTRY_PREFIX_LEN: usize = 6;

fn header_crosses_end() -> ParseError {
    ParseError::InvalidField {
        field: "de_header",
        reason: "directory entry header crosses block end",
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<DirSlot<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.block.len() {
            return None;
        }

        let offset = self.offset;
        // inode and rec_len are enough to step over a deleted slot
        if ensure_slice(self.block, offset, DIR_ENTRY_PREFIX_LEN).is_err() {
            return self.fail(header_crosses_end());
        }
        let (inode, rec_len) = match (
            read_le_u32(self.block, offset),
            read_le_u16(self.block, offset + 4),
        ) {
            (Ok(inode), Ok(rec_len)) => (inode, rec_len),
            (Err(e), _) | (_, Err(e)) => return self.fail(e),
        };

        if rec_len == 0 {
            return self.fail(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "zero entry length",
            });
        }

        if inode == 0 {
            self.offset = offset + usize::from(rec_len);
            return Some(Ok(DirSlot::Deleted { offset, rec_len }));
        }

        if ensure_slice(self.block, offset, DIR_ENTRY_HEADER_LEN).is_err() {
            return self.fail(header_crosses_end());
        }
        self.offset = offset + usize::from(rec_len);

        let name_len = match read_u8(self.block, offset + 6) {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        let Ok(name) = ensure_slice(
            self.block,
            offset + DIR_ENTRY_HEADER_LEN,
            usize::from(name_len),
        ) else {
            return self.fail(ParseError::InvalidField {
                field: "de_name_len",
                reason: "name crosses block end",
            });
        };

        Some(Ok(DirSlot::Live {
            offset,
            inode: InodeNumber(inode),
            rec_len,
            name_len,
            name,
        }))
    }
}

/// Create an iterator over the slots of a directory block.
#[must_use]
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter::new(block)
}

// ── Indirect blocks ─────────────────────────────────────────────────────────

/// Non-null block numbers stored in an indirect block, in slot order.
///
/// Reads `block.len() / 4` little-endian slots; a trailing partial slot is
/// ignored.
#[must_use]
pub fn indirect_pointers(block: &[u8]) -> Vec<BlockNumber> {
    block
        .chunks_exact(4)
        .map(|slot| BlockNumber(u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]])))
        .filter(|ptr| !ptr.is_null())
        .collect()
}
