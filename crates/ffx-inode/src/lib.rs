#![forbid(unsafe_code)]
//! Inode record decoding.
//!
//! Locates each allocated inode's 128-byte record through its group's inode
//! table, decodes the fields into an [`InodeRecord`], and queues every
//! directory for the directory walker.

use ffx_block::{ByteDevice, read_range};
use ffx_error::{FfxError, Result};
use ffx_ondisk::{Diagnostics, Ext2Inode, FsContext, InodeKind, Warning};
use ffx_types::{
    BlockNumber, ByteOffset, INODE_RECORD_SIZE, InodeNumber, N_BLOCK_POINTERS, N_DIRECT_BLOCKS,
};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

/// Decoded metadata of one allocated inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub inode: InodeNumber,
    pub kind: InodeKind,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub links_count: u16,
    /// On-disk `ctime`, reported as the creation time.
    pub ctime: u32,
    pub mtime: u32,
    pub atime: u32,
    pub size: u32,
    /// Sector count halved.
    pub block_count: u32,
    pub blocks: [BlockNumber; N_BLOCK_POINTERS],
}

impl InodeRecord {
    #[must_use]
    pub fn from_raw(inode: InodeNumber, raw: &Ext2Inode) -> Self {
        Self {
            inode,
            kind: raw.kind(),
            mode: raw.mode,
            uid: raw.uid,
            gid: raw.gid,
            links_count: raw.links_count,
            ctime: raw.ctime,
            mtime: raw.mtime,
            atime: raw.atime,
            size: raw.size,
            block_count: raw.halved_block_count(),
            blocks: raw.block_pointers(),
        }
    }

    #[must_use]
    pub fn direct_blocks(&self) -> [BlockNumber; N_DIRECT_BLOCKS] {
        let mut out = [BlockNumber(0); N_DIRECT_BLOCKS];
        out.copy_from_slice(&self.blocks[..N_DIRECT_BLOCKS]);
        out
    }

    #[must_use]
    pub fn single_indirect(&self) -> BlockNumber {
        self.blocks[ffx_types::SINGLE_INDIRECT_INDEX]
    }
}

/// A directory queued for entry walking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryWork {
    pub inode: InodeNumber,
    pub record_offset: ByteOffset,
    pub direct_blocks: [BlockNumber; N_DIRECT_BLOCKS],
}

/// Output of decoding every allocated inode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeScan {
    pub records: Vec<InodeRecord>,
    pub directories: Vec<DirectoryWork>,
}

impl InodeScan {
    /// Record for `ino`, if it was decoded. Records are in ascending order.
    #[must_use]
    pub fn record(&self, ino: InodeNumber) -> Option<&InodeRecord> {
        self.records
            .binary_search_by_key(&ino, |r| r.inode)
            .ok()
            .map(|idx| &self.records[idx])
    }
}

/// Read and parse the raw inode record at `offset`.
pub fn read_inode_at(dev: &dyn ByteDevice, offset: ByteOffset) -> Result<Ext2Inode> {
    let bytes = read_range(dev, offset, INODE_RECORD_SIZE)?;
    Ext2Inode::parse_from_bytes(&bytes).map_err(|e| FfxError::Parse(e.to_string()))
}

/// Decode one inode. Returns `None` (after recording a warning) when the
/// record cannot be located or read.
pub fn decode_inode(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    ino: InodeNumber,
    diags: &mut Diagnostics,
) -> Option<(ByteOffset, InodeRecord)> {
    let Some(offset) = ctx.inode_record_offset(ino) else {
        diags.warn(Warning::InodeTableUnavailable {
            inode: ino,
            group: ctx.inode_group(ino),
        });
        return None;
    };

    match read_inode_at(dev, offset) {
        Ok(raw) => Some((offset, InodeRecord::from_raw(ino, &raw))),
        Err(err) => {
            diags.warn(Warning::InodeUnreadable {
                inode: ino,
                detail: err.to_string(),
            });
            None
        }
    }
}

/// Decode every inode in `allocated`, in order, queueing directories.
pub fn decode_inodes(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    allocated: impl IntoIterator<Item = InodeNumber>,
    diags: &mut Diagnostics,
) -> InodeScan {
    let mut scan = InodeScan::default();

    for ino in allocated {
        let Some((offset, record)) = decode_inode(dev, ctx, ino, diags) else {
            continue;
        };
        trace!(
            inode = ino.0,
            kind = %record.kind,
            mode = record.mode,
            offset = offset.0,
            "decoded inode"
        );
        if record.kind == InodeKind::Directory {
            scan.directories.push(DirectoryWork {
                inode: ino,
                record_offset: offset,
                direct_blocks: record.direct_blocks(),
            });
        }
        scan.records.push(record);
    }

    info!(
        inodes = scan.records.len(),
        directories = scan.directories.len(),
        "inode decode complete"
    );
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffx_block::MemByteDevice;
    use ffx_ondisk::{Ext2Geometry, Ext2Superblock, GroupTable};
    use ffx_types::EXT2_SUPER_MAGIC;
    use proptest::prelude::*;

    const INODE_TABLE: u32 = 5;

    fn context(inode_table: u32) -> FsContext {
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
        gd[8..12].copy_from_slice(&inode_table.to_le_bytes());
        let (groups, _) = GroupTable::decode(&geometry, &gd).expect("groups");
        FsContext::new(geometry, groups)
    }

    fn put_inode(image: &mut [u8], ino: u32, mode: u16, blocks: &[u32]) {
        let off = INODE_TABLE as usize * 1024 + (ino as usize - 1) * INODE_RECORD_SIZE;
        let rec = &mut image[off..off + INODE_RECORD_SIZE];
        rec[0x00..0x02].copy_from_slice(&mode.to_le_bytes());
        rec[0x02..0x04].copy_from_slice(&500_u16.to_le_bytes());
        rec[0x04..0x08].copy_from_slice(&4096_u32.to_le_bytes());
        rec[0x18..0x1A].copy_from_slice(&20_u16.to_le_bytes());
        rec[0x1A..0x1C].copy_from_slice(&1_u16.to_le_bytes());
        rec[0x1C..0x20].copy_from_slice(&8_u32.to_le_bytes());
        for (i, b) in blocks.iter().enumerate() {
            rec[40 + i * 4..44 + i * 4].copy_from_slice(&b.to_le_bytes());
        }
    }

    #[test]
    fn decodes_records_and_queues_directories() {
        let mut image = vec![0_u8; 64 * 1024];
        put_inode(&mut image, 2, 0o040_755, &[20]);
        put_inode(&mut image, 11, 0o100_644, &[30, 31, 32, 33]);
        put_inode(&mut image, 12, 0o120_777, &[]);
        let dev = MemByteDevice::new(image);
        let ctx = context(INODE_TABLE);
        let mut diags = Diagnostics::new();

        let scan = decode_inodes(
            &dev,
            &ctx,
            [InodeNumber(2), InodeNumber(11), InodeNumber(12)],
            &mut diags,
        );
        assert!(diags.is_empty());
        assert_eq!(scan.records.len(), 3);

        let kinds: Vec<_> = scan.records.iter().map(|r| r.kind.tag()).collect();
        assert_eq!(kinds, vec!['d', 'f', 's']);

        let file = scan.record(InodeNumber(11)).expect("file");
        assert_eq!(file.uid, 500);
        assert_eq!(file.gid, 20);
        assert_eq!(file.size, 4096);
        assert_eq!(file.block_count, 4);
        assert_eq!(file.blocks[3], BlockNumber(33));

        assert_eq!(scan.directories.len(), 1);
        let dir = &scan.directories[0];
        assert_eq!(dir.inode, InodeNumber(2));
        assert_eq!(dir.record_offset, ByteOffset(5 * 1024 + 128));
        assert_eq!(dir.direct_blocks[0], BlockNumber(20));
    }

    #[test]
    fn sentinel_inode_table_skips_with_warning() {
        let dev = MemByteDevice::new(vec![0_u8; 64 * 1024]);
        // 100 lies outside group 0's range 0..=63
        let ctx = context(100);
        let mut diags = Diagnostics::new();

        let scan = decode_inodes(&dev, &ctx, [InodeNumber(2)], &mut diags);
        assert!(scan.records.is_empty());
        assert!(matches!(
            diags.as_slice(),
            [Warning::InodeTableUnavailable { inode: InodeNumber(2), .. }]
        ));
    }

    #[test]
    fn unreadable_record_skips_with_warning() {
        // image ends inside the inode table
        let dev = MemByteDevice::new(vec![0_u8; 5 * 1024 + 64]);
        let ctx = context(INODE_TABLE);
        let mut diags = Diagnostics::new();

        let scan = decode_inodes(&dev, &ctx, [InodeNumber(1), InodeNumber(2)], &mut diags);
        assert!(scan.records.is_empty());
        assert_eq!(diags.len(), 2);
        assert!(matches!(diags.as_slice()[0], Warning::InodeUnreadable { .. }));
    }

    #[test]
    fn unknown_type_is_still_recorded() {
        let mut image = vec![0_u8; 64 * 1024];
        put_inode(&mut image, 3, 0o020_600, &[]);
        let dev = MemByteDevice::new(image);
        let ctx = context(INODE_TABLE);
        let mut diags = Diagnostics::new();

        let scan = decode_inodes(&dev, &ctx, [InodeNumber(3)], &mut diags);
        assert_eq!(scan.records[0].kind, InodeKind::Unknown);
        assert!(scan.directories.is_empty());
    }

    proptest! {
        #[test]
        fn from_raw_halves_sectors_and_keeps_pointers(
            mode in any::<u16>(),
            sectors in any::<u32>(),
            block in any::<[u32; 15]>(),
        ) {
            let raw = Ext2Inode {
                mode,
                uid: 1,
                size: 0,
                atime: 0,
                ctime: 0,
                mtime: 0,
                gid: 2,
                links_count: 1,
                blocks: sectors,
                block,
            };
            let rec = InodeRecord::from_raw(InodeNumber(7), &raw);
            prop_assert_eq!(rec.block_count, sectors / 2);
            prop_assert_eq!(rec.kind, InodeKind::from_mode(mode));
            prop_assert_eq!(rec.blocks.map(|b| b.0), block);
            prop_assert_eq!(rec.single_indirect().0, block[12]);
        }
    }
}
