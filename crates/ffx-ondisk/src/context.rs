#![forbid(unsafe_code)]
//! Validated filesystem context shared by every extraction stage.
//!
//! [`FsContext`] is built once from a validated superblock and the decoded
//! group descriptor table, then passed by shared reference. Nothing in it
//! changes after construction.

use crate::diagnostics::{GroupPointerKind, Warning};
use crate::ext2::{Ext2GroupDesc, Ext2Superblock, SuperblockViolation};
use ffx_types::{
    BlockNumber, BlockSize, ByteOffset, GROUP_DESC_SIZE, GroupNumber, INODE_RECORD_SIZE,
    InodeNumber, ParseError, ensure_slice, group_block_range, inode_index_in_group,
    inode_to_group,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Superblock that passed every validation check, plus derived geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Geometry {
    pub superblock: Ext2Superblock,
    pub block_size: BlockSize,
    pub groups_count: u32,
}

impl Ext2Geometry {
    /// Validate `sb` against an image of `image_len` bytes.
    ///
    /// Returns every violation when any check fails.
    pub fn from_superblock(
        sb: Ext2Superblock,
        image_len: u64,
    ) -> Result<Self, Vec<SuperblockViolation>> {
        let violations = sb.violations(image_len);
        if !violations.is_empty() {
            return Err(violations);
        }
        let block_size = BlockSize::new(sb.block_size).map_err(|_| {
            vec![SuperblockViolation::InvalidBlockSize {
                block_size: sb.block_size,
            }]
        })?;
        let groups_count = sb.groups_count();
        Ok(Self {
            superblock: sb,
            block_size,
            groups_count,
        })
    }

    #[must_use]
    pub fn inodes_count(&self) -> u32 {
        self.superblock.inodes_count
    }

    #[must_use]
    pub fn blocks_per_group(&self) -> u32 {
        self.superblock.blocks_per_group
    }

    #[must_use]
    pub fn inodes_per_group(&self) -> u32 {
        self.superblock.inodes_per_group
    }

    #[must_use]
    pub fn group_desc_table_offset(&self) -> ByteOffset {
        ByteOffset(self.superblock.group_desc_table_offset())
    }

    /// Byte length of the whole descriptor table.
    #[must_use]
    pub fn group_desc_table_len(&self) -> usize {
        self.groups_count as usize * GROUP_DESC_SIZE
    }

    /// `true` when `ino` is in `[1, inodes_count]`.
    #[must_use]
    pub fn inode_in_range(&self, ino: InodeNumber) -> bool {
        (1..=self.inodes_count()).contains(&ino.0)
    }
}

/// A group descriptor block pointer with its range-check verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPointer {
    pub raw: BlockNumber,
    pub valid: bool,
}

impl GroupPointer {
    /// The pointer, or `None` when it was replaced by the sentinel.
    #[must_use]
    pub fn get(self) -> Option<BlockNumber> {
        self.valid.then_some(self.raw)
    }
}

/// One decoded and range-checked group descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group: GroupNumber,
    pub block_bitmap: GroupPointer,
    pub inode_bitmap: GroupPointer,
    pub inode_table: GroupPointer,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    /// Range-check every pointer of `raw` against the group's block range.
    ///
    /// Warnings are returned in check order: inode bitmap, block bitmap,
    /// inode table.
    #[must_use]
    pub fn validate(
        group: GroupNumber,
        raw: &Ext2GroupDesc,
        blocks_per_group: u32,
    ) -> (Self, Vec<Warning>) {
        let (range_start, range_end) = group_block_range(group, blocks_per_group);
        let mut warnings = Vec::new();

        let mut check = |pointer: GroupPointerKind, value: u32| {
            let valid = (range_start..=range_end).contains(&u64::from(value));
            if !valid {
                warnings.push(Warning::GroupPointerOutOfRange {
                    group,
                    pointer,
                    range_start,
                    range_end,
                    value: BlockNumber(value),
                });
            }
            GroupPointer {
                raw: BlockNumber(value),
                valid,
            }
        };

        let inode_bitmap = check(GroupPointerKind::InodeBitmap, raw.inode_bitmap);
        let block_bitmap = check(GroupPointerKind::BlockBitmap, raw.block_bitmap);
        let inode_table = check(GroupPointerKind::InodeTable, raw.inode_table);

        let desc = Self {
            group,
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count: raw.free_blocks_count,
            free_inodes_count: raw.free_inodes_count,
            used_dirs_count: raw.used_dirs_count,
        };
        (desc, warnings)
    }

    #[must_use]
    pub fn pointer(&self, kind: GroupPointerKind) -> GroupPointer {
        match kind {
            GroupPointerKind::InodeBitmap => self.inode_bitmap,
            GroupPointerKind::BlockBitmap => self.block_bitmap,
            GroupPointerKind::InodeTable => self.inode_table,
        }
    }
}

/// All group descriptors, indexed by group number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTable {
    groups: Vec<GroupDescriptor>,
}

impl GroupTable {
    /// Decode `geometry.groups_count` descriptors from the raw table bytes.
    pub fn decode(
        geometry: &Ext2Geometry,
        table: &[u8],
    ) -> Result<(Self, Vec<Warning>), ParseError> {
        let expected = (geometry.groups_count as usize).min(table.len() / GROUP_DESC_SIZE);
        let mut groups = Vec::with_capacity(expected);
        let mut warnings = Vec::new();

        for idx in 0..geometry.groups_count {
            let offset = idx as usize * GROUP_DESC_SIZE;
            let raw = Ext2GroupDesc::parse_from_bytes(ensure_slice(
                table,
                offset,
                GROUP_DESC_SIZE,
            )?)?;
            let (desc, mut group_warnings) =
                GroupDescriptor::validate(GroupNumber(idx), &raw, geometry.blocks_per_group());
            trace!(
                group = idx,
                block_bitmap = desc.block_bitmap.raw.0,
                inode_bitmap = desc.inode_bitmap.raw.0,
                inode_table = desc.inode_table.raw.0,
                "group descriptor"
            );
            groups.push(desc);
            warnings.append(&mut group_warnings);
        }

        Ok((Self { groups }, warnings))
    }

    #[must_use]
    pub fn get(&self, group: GroupNumber) -> Option<&GroupDescriptor> {
        self.groups.get(group.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupDescriptor> {
        self.groups.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Immutable view of the validated filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsContext {
    pub geometry: Ext2Geometry,
    pub groups: GroupTable,
}

impl FsContext {
    #[must_use]
    pub fn new(geometry: Ext2Geometry, groups: GroupTable) -> Self {
        Self { geometry, groups }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.geometry.block_size
    }

    /// Group that owns inode `ino`.
    #[must_use]
    pub fn inode_group(&self, ino: InodeNumber) -> GroupNumber {
        inode_to_group(ino, self.geometry.inodes_per_group())
    }

    /// Absolute byte offset of inode `ino`'s record.
    ///
    /// `None` when the owning group has no descriptor or its inode table
    /// pointer is the sentinel.
    #[must_use]
    pub fn inode_record_offset(&self, ino: InodeNumber) -> Option<ByteOffset> {
        let ipg = self.geometry.inodes_per_group();
        let table = self.groups.get(inode_to_group(ino, ipg))?.inode_table.get()?;
        let index = u64::from(inode_index_in_group(ino, ipg));
        self.block_size()
            .block_to_byte(table)
            .checked_add(index * INODE_RECORD_SIZE as u64)
    }
}
