#![forbid(unsafe_code)]
//! Single-indirect block pointer listing.
//!
//! For each allocated inode, resolves the single-indirect block number and
//! lists the non-null block pointers it holds.

use ffx_block::{ByteDevice, read_block, read_u32_at};
use ffx_inode::InodeScan;
use ffx_ondisk::{Diagnostics, FsContext, Warning, indirect_pointers};
use ffx_types::{
    BlockNumber, ByteOffset, INODE_BLOCK_ARRAY_OFFSET, InodeNumber, SINGLE_INDIRECT_INDEX,
};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

/// Where the single-indirect block number of an inode comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndirectSource {
    /// The `u32` at image byte `inode_number + 12 * 4 + 40`.
    ///
    /// This reads the raw inode number as a byte offset rather than going
    /// through the inode table, and dereferences the value even when it is
    /// zero. Kept as the default for output compatibility with existing
    /// extraction corpora.
    #[default]
    RawInodeOffset,
    /// The 13th block pointer of the decoded inode record. Zero means the
    /// inode has no indirect block.
    InodeRecord,
}

/// One non-null pointer stored in an indirect block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPointer {
    pub inode: InodeNumber,
    pub indirect_block: BlockNumber,
    /// Position among the non-null pointers of this block.
    pub sequence: u32,
    pub pointee: BlockNumber,
}

/// Byte offset read by [`IndirectSource::RawInodeOffset`].
#[must_use]
pub fn raw_inode_offset(ino: InodeNumber) -> ByteOffset {
    ByteOffset(u64::from(ino.0) + (SINGLE_INDIRECT_INDEX * 4 + INODE_BLOCK_ARRAY_OFFSET) as u64)
}

/// Resolve the indirect block for `ino`, or `None` when there is nothing to
/// read (or the raw word could not be read, which is warned).
pub fn locate_indirect_block(
    dev: &dyn ByteDevice,
    source: IndirectSource,
    ino: InodeNumber,
    inodes: &InodeScan,
    diags: &mut Diagnostics,
) -> Option<BlockNumber> {
    match source {
        IndirectSource::RawInodeOffset => {
            let offset = raw_inode_offset(ino);
            match read_u32_at(dev, offset) {
                Ok(value) => Some(BlockNumber(value)),
                Err(err) => {
                    diags.warn(Warning::IndirectPointerUnreadable {
                        inode: ino,
                        offset: offset.0,
                        detail: err.to_string(),
                    });
                    None
                }
            }
        }
        IndirectSource::InodeRecord => inodes
            .record(ino)
            .map(ffx_inode::InodeRecord::single_indirect)
            .filter(|block| !block.is_null()),
    }
}

/// List the non-null pointers of indirect block `block` owned by `ino`.
pub fn list_indirect_block(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    ino: InodeNumber,
    block: BlockNumber,
    diags: &mut Diagnostics,
) -> Vec<IndirectPointer> {
    let bytes = match read_block(dev, block, ctx.block_size()) {
        Ok(bytes) => bytes,
        Err(err) => {
            diags.warn(Warning::IndirectBlockUnreadable {
                inode: ino,
                block,
                detail: err.to_string(),
            });
            return Vec::new();
        }
    };

    indirect_pointers(&bytes)
        .into_iter()
        .zip(0_u32..)
        .map(|(pointee, sequence)| IndirectPointer {
            inode: ino,
            indirect_block: block,
            sequence,
            pointee,
        })
        .collect()
}

/// List indirect pointers for every inode in `allocated`, in order.
pub fn walk_indirect(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    allocated: impl IntoIterator<Item = InodeNumber>,
    inodes: &InodeScan,
    source: IndirectSource,
    diags: &mut Diagnostics,
) -> Vec<IndirectPointer> {
    let mut out = Vec::new();
    let mut blocks_read = 0_usize;

    for ino in allocated {
        let Some(block) = locate_indirect_block(dev, source, ino, inodes, diags) else {
            continue;
        };
        trace!(inode = ino.0, block = block.0, "listing indirect block");
        blocks_read += 1;
        out.extend(list_indirect_block(dev, ctx, ino, block, diags));
    }

    info!(
        ?source,
        blocks = blocks_read,
        pointers = out.len(),
        "indirect walk complete"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffx_block::MemByteDevice;
    use ffx_inode::InodeRecord;
    use ffx_ondisk::{Ext2Geometry, Ext2Superblock, GroupTable, InodeKind};
    use ffx_types::{EXT2_SUPER_MAGIC, N_BLOCK_POINTERS};
    use proptest::prelude::*;

    fn context() -> FsContext {
        let sb = Ext2Superblock {
            inodes_count: 32,
            blocks_count: 64,
            first_data_block: 1,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: 64,
            frags_per_group: 64,
            inodes_per_group: 32,
            magic: EXT2_SUPER_MAGIC,
            block_size: 1024,
            frag_size: 1024,
        };
        let geometry = Ext2Geometry::from_superblock(sb, 64 * 1024).expect("geometry");
        let mut gd = [0_u8; 32];
        gd[0..4].copy_from_slice(&3_u32.to_le_bytes());
        gd[4..8].copy_from_slice(&4_u32.to_le_bytes());
        gd[8..12].copy_from_slice(&5_u32.to_le_bytes());
        let (groups, _) = GroupTable::decode(&geometry, &gd).expect("groups");
        FsContext::new(geometry, groups)
    }

    fn record(ino: u32, indirect: u32) -> InodeRecord {
        let mut blocks = [BlockNumber(0); N_BLOCK_POINTERS];
        blocks[SINGLE_INDIRECT_INDEX] = BlockNumber(indirect);
        InodeRecord {
            inode: InodeNumber(ino),
            kind: InodeKind::File,
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            links_count: 1,
            ctime: 0,
            mtime: 0,
            atime: 0,
            size: 0,
            block_count: 0,
            blocks,
        }
    }

    fn put_pointers(image: &mut [u8], block: usize, slots: &[(usize, u32)]) {
        for &(slot, value) in slots {
            let off = block * 1024 + slot * 4;
            image[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    #[test]
    fn raw_offset_is_inode_number_plus_88() {
        assert_eq!(raw_inode_offset(InodeNumber(12)), ByteOffset(100));
        assert_eq!(raw_inode_offset(InodeNumber(0)), ByteOffset(88));
    }

    #[test]
    fn record_source_lists_non_null_slots() {
        let mut image = vec![0_u8; 64 * 1024];
        put_pointers(&mut image, 40, &[(0, 41), (1, 0), (2, 42), (255, 0x3F)]);
        let dev = MemByteDevice::new(image);
        let ctx = context();
        let inodes = InodeScan {
            records: vec![record(11, 40), record(12, 0)],
            directories: Vec::new(),
        };
        let mut diags = Diagnostics::new();

        let out = walk_indirect(
            &dev,
            &ctx,
            [InodeNumber(11), InodeNumber(12)],
            &inodes,
            IndirectSource::InodeRecord,
            &mut diags,
        );
        assert!(diags.is_empty());
        let listed: Vec<_> = out
            .iter()
            .map(|p| (p.indirect_block.0, p.sequence, p.pointee.0))
            .collect();
        assert_eq!(listed, vec![(40, 0, 41), (40, 1, 42), (40, 2, 0x3F)]);
        assert!(out.iter().all(|p| p.inode == InodeNumber(11)));
    }

    #[test]
    fn raw_source_dereferences_zero() {
        let mut image = vec![0_u8; 64 * 1024];
        // block 0 is read when the raw word is zero
        put_pointers(&mut image, 0, &[(200, 7)]);
        let dev = MemByteDevice::new(image);
        let ctx = context();
        let mut diags = Diagnostics::new();

        let out = walk_indirect(
            &dev,
            &ctx,
            [InodeNumber(2)],
            &InodeScan::default(),
            IndirectSource::RawInodeOffset,
            &mut diags,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].indirect_block, BlockNumber(0));
        assert_eq!(out[0].pointee, BlockNumber(7));
    }

    #[test]
    fn raw_source_reads_word_at_inode_offset() {
        let mut image = vec![0_u8; 64 * 1024];
        // inode 3 -> word at byte 91
        image[91..95].copy_from_slice(&30_u32.to_le_bytes());
        put_pointers(&mut image, 30, &[(5, 31)]);
        let dev = MemByteDevice::new(image);
        let ctx = context();
        let mut diags = Diagnostics::new();

        let block = locate_indirect_block(
            &dev,
            IndirectSource::RawInodeOffset,
            InodeNumber(3),
            &InodeScan::default(),
            &mut diags,
        );
        assert_eq!(block, Some(BlockNumber(30)));
        let listed = list_indirect_block(&dev, &ctx, InodeNumber(3), BlockNumber(30), &mut diags);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sequence, 0);
    }

    #[test]
    fn unreadable_indirect_block_is_warned() {
        let dev = MemByteDevice::new(vec![0_u8; 64 * 1024]);
        let ctx = context();
        let inodes = InodeScan {
            records: vec![record(11, 9000)],
            directories: Vec::new(),
        };
        let mut diags = Diagnostics::new();

        let out = walk_indirect(
            &dev,
            &ctx,
            [InodeNumber(11)],
            &inodes,
            IndirectSource::InodeRecord,
            &mut diags,
        );
        assert!(out.is_empty());
        assert!(matches!(
            diags.as_slice(),
            [Warning::IndirectBlockUnreadable { block: BlockNumber(9000), .. }]
        ));
    }

    #[test]
    fn missing_record_yields_nothing() {
        let dev = MemByteDevice::new(vec![0_u8; 64 * 1024]);
        let mut diags = Diagnostics::new();
        let block = locate_indirect_block(
            &dev,
            IndirectSource::InodeRecord,
            InodeNumber(5),
            &InodeScan::default(),
            &mut diags,
        );
        assert_eq!(block, None);
        assert!(diags.is_empty());
    }

    proptest! {
        #[test]
        fn sequences_count_non_null_slots(slots in proptest::collection::vec(0_u32..4, 256)) {
            let mut image = vec![0_u8; 64 * 1024];
            for (i, v) in slots.iter().enumerate() {
                let off = 40 * 1024 + i * 4;
                image[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            let dev = MemByteDevice::new(image);
            let ctx = context();
            let mut diags = Diagnostics::new();
            let listed = list_indirect_block(&dev, &ctx, InodeNumber(11), BlockNumber(40), &mut diags);
            let expected: Vec<u32> = slots.iter().copied().filter(|v| *v != 0).collect();
            prop_assert_eq!(listed.iter().map(|p| p.pointee.0).collect::<Vec<_>>(), expected);
            prop_assert!(listed.iter().zip(0_u32..).all(|(p, i)| p.sequence == i));
        }
    }
}
