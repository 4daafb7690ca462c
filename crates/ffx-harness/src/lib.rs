#![forbid(unsafe_code)]

use anyhow::{Result, bail, ensure};
use ffx::{GroupPointerKind, MemByteDevice};
use ffx_types::{
    EXT2_SUPER_MAGIC, GROUP_DESC_SIZE, INODE_BLOCK_ARRAY_OFFSET, INODE_RECORD_SIZE,
    N_BLOCK_POINTERS, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SUPERBLOCK_OFFSET,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field values written into one 128-byte inode record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeFields {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub links_count: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Raw `i_blocks` value in 512-byte sectors.
    pub sectors: u32,
    pub block: [u32; N_BLOCK_POINTERS],
}

impl InodeFields {
    #[must_use]
    pub fn with_mode(mode: u16) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            links_count: 1,
            size: 0,
            atime: 0x6000_0000,
            ctime: 0x6000_0000,
            mtime: 0x6000_0000,
            sectors: 0,
            block: [0; N_BLOCK_POINTERS],
        }
    }

    /// A directory whose data lives in `blocks` (direct pointers).
    #[must_use]
    pub fn directory(blocks: &[u32], block_size: u32) -> Self {
        let mut fields = Self::with_mode(S_IFDIR | 0o755);
        fields.links_count = 2;
        fields.set_direct(blocks, block_size);
        fields
    }

    /// A regular file whose data lives in `blocks` (direct pointers).
    #[must_use]
    pub fn file(blocks: &[u32], block_size: u32) -> Self {
        let mut fields = Self::with_mode(S_IFREG | 0o644);
        fields.set_direct(blocks, block_size);
        fields
    }

    #[must_use]
    pub fn symlink() -> Self {
        Self::with_mode(S_IFLNK | 0o777)
    }

    #[must_use]
    pub fn single_indirect(mut self, block: u32) -> Self {
        self.block[ffx_types::SINGLE_INDIRECT_INDEX] = block;
        self
    }

    fn set_direct(&mut self, blocks: &[u32], block_size: u32) {
        for (slot, b) in self.block.iter_mut().zip(blocks) {
            *slot = *b;
        }
        let count = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
        self.size = count.saturating_mul(block_size);
        self.sectors = count.saturating_mul(block_size / 512);
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// One directory slot written by [`Ext2ImageBuilder::dir_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryFields {
    pub inode: u32,
    pub rec_len: u16,
    pub name: Vec<u8>,
}

impl DirEntryFields {
    #[must_use]
    pub fn new(inode: u32, rec_len: u16, name: &[u8]) -> Self {
        Self {
            inode,
            rec_len,
            name: name.to_vec(),
        }
    }

    /// A deleted slot: inode 0, no name.
    #[must_use]
    pub fn deleted(rec_len: u16) -> Self {
        Self::new(0, rec_len, b"")
    }
}

/// Block positions of one group's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub inode_table_blocks: u32,
}

/// Summary of a built image, printed by `ffx-harness generate-image`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_data_block: u32,
    pub image_len: usize,
    pub groups: Vec<GroupLayout>,
    pub inodes: Vec<u32>,
}

/// Builder for small crafted ext2 images.
///
/// The image is only as long as the highest block actually written; the
/// superblock's `blocks_count` is compared numerically against the byte
/// length, so a few hundred KiB satisfy a nominal 8192-block filesystem.
#[derive(Debug, Clone)]
pub struct Ext2ImageBuilder {
    log_block_size: u32,
    log_frag_size: i32,
    groups: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    first_data_block: u32,
    magic: u16,
    pad_bitmaps: bool,
    min_image_blocks: u32,
    inodes: BTreeMap<u32, InodeFields>,
    blocks: BTreeMap<u32, Vec<u8>>,
    used_blocks: BTreeSet<u32>,
    pointer_overrides: BTreeMap<(u32, GroupPointerKind), u32>,
    patches: Vec<(usize, Vec<u8>)>,
}

impl Ext2ImageBuilder {
    /// `groups` groups of `blocks_per_group` blocks, each with
    /// `inodes_per_group` inodes, at block size `1024 << log_block_size`.
    #[must_use]
    pub fn new(log_block_size: u32, groups: u32, blocks_per_group: u32, inodes_per_group: u32) -> Self {
        Self {
            log_block_size,
            log_frag_size: i32::try_from(log_block_size).unwrap_or(0),
            groups,
            blocks_per_group,
            inodes_per_group,
            first_data_block: u32::from(log_block_size == 0),
            magic: EXT2_SUPER_MAGIC,
            pad_bitmaps: true,
            min_image_blocks: 0,
            inodes: BTreeMap::new(),
            blocks: BTreeMap::new(),
            used_blocks: BTreeSet::new(),
            pointer_overrides: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    /// One group, 1 KiB blocks, 8192 blocks, 2048 inodes, first data block 1.
    #[must_use]
    pub fn one_group_1k() -> Self {
        Self::new(0, 1, 8192, 2048)
    }

    /// [`Self::one_group_1k`] with root directory inode 2 holding `.` and
    /// `..` in its first data block.
    #[must_use]
    pub fn root_dir_scenario() -> Self {
        let builder = Self::one_group_1k();
        let data = builder.first_free_block(0);
        let block_size = builder.block_size();
        builder
            .inode(2, InodeFields::directory(&[data], block_size))
            .dir_block(
                data,
                &[DirEntryFields::new(2, 12, b"."), DirEntryFields::new(2, 1012, b"..")],
            )
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    #[must_use]
    pub fn blocks_count(&self) -> u32 {
        self.groups * self.blocks_per_group
    }

    #[must_use]
    pub fn inodes_count(&self) -> u32 {
        self.groups * self.inodes_per_group
    }

    /// Default metadata placement: block bitmap, inode bitmap, and inode
    /// table start two blocks past the group's first data block.
    #[must_use]
    pub fn group_layout(&self, group: u32) -> GroupLayout {
        let base = group * self.blocks_per_group + self.first_data_block + 2;
        let per_block = self.block_size() / INODE_RECORD_SIZE as u32;
        GroupLayout {
            block_bitmap: base,
            inode_bitmap: base + 1,
            inode_table: base + 2,
            inode_table_blocks: self.inodes_per_group.div_ceil(per_block),
        }
    }

    /// First block of `group` after its inode table.
    #[must_use]
    pub fn first_free_block(&self, group: u32) -> u32 {
        let layout = self.group_layout(group);
        layout.inode_table + layout.inode_table_blocks
    }

    #[must_use]
    pub fn magic(mut self, magic: u16) -> Self {
        self.magic = magic;
        self
    }

    #[must_use]
    pub fn log_frag_size(mut self, log: i32) -> Self {
        self.log_frag_size = log;
        self
    }

    /// Leave bitmap bits past the group size clear instead of set.
    #[must_use]
    pub fn unpadded_bitmaps(mut self) -> Self {
        self.pad_bitmaps = false;
        self
    }

    /// Make the image at least `blocks` blocks long.
    #[must_use]
    pub fn min_image_blocks(mut self, blocks: u32) -> Self {
        self.min_image_blocks = blocks;
        self
    }

    /// Allocate inode `ino` with the given record.
    #[must_use]
    pub fn inode(mut self, ino: u32, fields: InodeFields) -> Self {
        self.inodes.insert(ino, fields);
        self
    }

    /// Write `data` into block `block` and mark it used.
    #[must_use]
    pub fn block(mut self, block: u32, data: Vec<u8>) -> Self {
        self.used_blocks.insert(block);
        self.blocks.insert(block, data);
        self
    }

    /// Write a directory block made of `entries`, in order.
    #[must_use]
    pub fn dir_block(self, block: u32, entries: &[DirEntryFields]) -> Self {
        let mut data = vec![0_u8; self.block_size() as usize];
        let mut offset = 0_usize;
        for entry in entries {
            let name_len = entry.name.len().min(255);
            let end = offset + 8 + name_len;
            if end > data.len() {
                break;
            }
            data[offset..offset + 4].copy_from_slice(&entry.inode.to_le_bytes());
            data[offset + 4..offset + 6].copy_from_slice(&entry.rec_len.to_le_bytes());
            data[offset + 6] = u8::try_from(name_len).unwrap_or(u8::MAX);
            data[offset + 8..end].copy_from_slice(&entry.name[..name_len]);
            offset += usize::from(entry.rec_len);
        }
        self.block(block, data)
    }

    /// Write an indirect block holding `pointers` in slot order.
    #[must_use]
    pub fn indirect_block(self, block: u32, pointers: &[u32]) -> Self {
        let mut data = vec![0_u8; self.block_size() as usize];
        for (slot, ptr) in data.chunks_exact_mut(4).zip(pointers) {
            slot.copy_from_slice(&ptr.to_le_bytes());
        }
        self.block(block, data)
    }

    /// Replace one group descriptor pointer with a raw value.
    #[must_use]
    pub fn group_pointer(mut self, group: u32, kind: GroupPointerKind, value: u32) -> Self {
        self.pointer_overrides.insert((group, kind), value);
        self
    }

    /// Overwrite raw bytes at an absolute offset after everything else is laid out.
    #[must_use]
    pub fn patch(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.patches.push((offset, bytes.to_vec()));
        self
    }

    fn metadata_blocks(&self) -> BTreeSet<u32> {
        let mut used = BTreeSet::new();
        for b in 0..=self.first_data_block + 1 {
            used.insert(b);
        }
        for g in 0..self.groups {
            let layout = self.group_layout(g);
            used.insert(layout.block_bitmap);
            used.insert(layout.inode_bitmap);
            for b in 0..layout.inode_table_blocks {
                used.insert(layout.inode_table + b);
            }
        }
        used
    }

    #[must_use]
    pub fn manifest(&self) -> ImageManifest {
        ImageManifest {
            block_size: self.block_size(),
            blocks_count: self.blocks_count(),
            inodes_count: self.inodes_count(),
            blocks_per_group: self.blocks_per_group,
            inodes_per_group: self.inodes_per_group,
            first_data_block: self.first_data_block,
            image_len: self.image_len(),
            groups: (0..self.groups).map(|g| self.group_layout(g)).collect(),
            inodes: self.inodes.keys().copied().collect(),
        }
    }

    fn image_len(&self) -> usize {
        let bs = self.block_size() as usize;
        let last_meta = self
            .metadata_blocks()
            .last()
            .copied()
            .unwrap_or_default();
        let last_data = self.blocks.keys().last().copied().unwrap_or_default();
        let blocks = last_meta.max(last_data).max(self.min_image_blocks.saturating_sub(1)) as usize + 1;
        let patched = self
            .patches
            .iter()
            .map(|(off, bytes)| off + bytes.len())
            .max()
            .unwrap_or_default();
        (blocks * bs).max(patched).max(SUPERBLOCK_OFFSET + 1024)
    }

    /// Lay out the image bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        ensure!(self.groups > 0, "image needs at least one group");
        ensure!(self.log_block_size <= 6, "block size too large for a crafted image");
        for &ino in self.inodes.keys() {
            ensure!(
                (1..=self.inodes_count()).contains(&ino),
                "inode {ino} outside 1..={}",
                self.inodes_count()
            );
        }

        let bs = self.block_size() as usize;
        let mut img = vec![0_u8; self.image_len()];
        self.write_superblock(&mut img);

        let mut used_blocks = self.metadata_blocks();
        used_blocks.extend(self.used_blocks.iter().copied());

        let gdt = (self.first_data_block as usize + 1) * bs;
        for g in 0..self.groups {
            let layout = self.group_layout(g);
            let (block_bm, free_blocks) = self.block_bitmap(g, &used_blocks);
            let (inode_bm, free_inodes, dirs) = self.inode_bitmap(g);
            put(&mut img, layout.block_bitmap as usize * bs, &block_bm)?;
            put(&mut img, layout.inode_bitmap as usize * bs, &inode_bm)?;

            let desc = gdt + g as usize * GROUP_DESC_SIZE;
            let ptr = |kind, default| *self.pointer_overrides.get(&(g, kind)).unwrap_or(&default);
            put(&mut img, desc, &ptr(GroupPointerKind::BlockBitmap, layout.block_bitmap).to_le_bytes())?;
            put(&mut img, desc + 4, &ptr(GroupPointerKind::InodeBitmap, layout.inode_bitmap).to_le_bytes())?;
            put(&mut img, desc + 8, &ptr(GroupPointerKind::InodeTable, layout.inode_table).to_le_bytes())?;
            put(&mut img, desc + 12, &free_blocks.to_le_bytes())?;
            put(&mut img, desc + 14, &free_inodes.to_le_bytes())?;
            put(&mut img, desc + 16, &dirs.to_le_bytes())?;
        }

        for (&ino, fields) in &self.inodes {
            let g = (ino - 1) / self.inodes_per_group;
            let idx = (ino - 1) % self.inodes_per_group;
            let off = self.group_layout(g).inode_table as usize * bs + idx as usize * INODE_RECORD_SIZE;
            put(&mut img, off, &encode_inode(fields))?;
        }

        for (&block, data) in &self.blocks {
            put(&mut img, block as usize * bs, data)?;
        }

        for (offset, bytes) in &self.patches {
            put(&mut img, *offset, bytes)?;
        }

        Ok(img)
    }

    pub fn build_device(&self) -> Result<MemByteDevice> {
        Ok(MemByteDevice::new(self.build()?))
    }

    fn write_superblock(&self, img: &mut [u8]) {
        let sb = &mut img[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + 1024];
        sb[0x00..0x04].copy_from_slice(&self.inodes_count().to_le_bytes());
        sb[0x04..0x08].copy_from_slice(&self.blocks_count().to_le_bytes());
        sb[0x14..0x18].copy_from_slice(&self.first_data_block.to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&self.log_block_size.to_le_bytes());
        sb[0x1C..0x20].copy_from_slice(&self.log_frag_size.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&self.blocks_per_group.to_le_bytes());
        sb[0x24..0x28].copy_from_slice(&self.blocks_per_group.to_le_bytes());
        sb[0x28..0x2C].copy_from_slice(&self.inodes_per_group.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&self.magic.to_le_bytes());
    }

    /// Block bitmap bytes for `group` and its free block count.
    fn block_bitmap(&self, group: u32, used: &BTreeSet<u32>) -> (Vec<u8>, u16) {
        let bs = self.block_size() as usize;
        let mut bm = vec![0_u8; bs];
        let base = group * self.blocks_per_group + self.first_data_block;
        let mut free = 0_u32;
        for bit in 0..(bs as u32 * 8) {
            let set = if bit < self.blocks_per_group {
                let in_use = used.contains(&(base + bit));
                if !in_use {
                    free += 1;
                }
                in_use
            } else {
                self.pad_bitmaps
            };
            if set {
                bm[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        (bm, u16::try_from(free).unwrap_or(u16::MAX))
    }

    /// Inode bitmap bytes for `group`, free inode count, directory count.
    fn inode_bitmap(&self, group: u32) -> (Vec<u8>, u16, u16) {
        let bs = self.block_size() as usize;
        let mut bm = vec![0_u8; bs];
        let first = group * self.inodes_per_group + 1;
        let mut used = 0_u32;
        let mut dirs = 0_u16;
        for (&ino, fields) in self.inodes.range(first..first + self.inodes_per_group) {
            let bit = ino - first;
            bm[(bit / 8) as usize] |= 1 << (bit % 8);
            used += 1;
            if fields.is_directory() {
                dirs += 1;
            }
        }
        if self.pad_bitmaps {
            for bit in self.inodes_per_group..(bs as u32 * 8) {
                bm[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        let free = self.inodes_per_group.saturating_sub(used);
        (bm, u16::try_from(free).unwrap_or(u16::MAX), dirs)
    }
}

fn put(img: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let Some(dst) = img.get_mut(offset..offset + bytes.len()) else {
        bail!(
            "write of {} bytes at {offset} exceeds image length {}",
            bytes.len(),
            img.len()
        );
    };
    dst.copy_from_slice(bytes);
    Ok(())
}

/// Encode an inode record in the on-disk layout.
#[must_use]
pub fn encode_inode(fields: &InodeFields) -> [u8; INODE_RECORD_SIZE] {
    let mut rec = [0_u8; INODE_RECORD_SIZE];
    rec[0x00..0x02].copy_from_slice(&fields.mode.to_le_bytes());
    rec[0x02..0x04].copy_from_slice(&fields.uid.to_le_bytes());
    rec[0x04..0x08].copy_from_slice(&fields.size.to_le_bytes());
    rec[0x08..0x0C].copy_from_slice(&fields.atime.to_le_bytes());
    rec[0x0C..0x10].copy_from_slice(&fields.ctime.to_le_bytes());
    rec[0x10..0x14].copy_from_slice(&fields.mtime.to_le_bytes());
    rec[0x18..0x1A].copy_from_slice(&fields.gid.to_le_bytes());
    rec[0x1A..0x1C].copy_from_slice(&fields.links_count.to_le_bytes());
    rec[0x1C..0x20].copy_from_slice(&fields.sectors.to_le_bytes());
    for (i, b) in fields.block.iter().enumerate() {
        let off = INODE_BLOCK_ARRAY_OFFSET + i * 4;
        rec[off..off + 4].copy_from_slice(&b.to_le_bytes());
    }
    rec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_for_1k_blocks() {
        let b = Ext2ImageBuilder::one_group_1k();
        assert_eq!(
            b.group_layout(0),
            GroupLayout {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                inode_table_blocks: 256,
            }
        );
        assert_eq!(b.first_free_block(0), 261);
    }

    #[test]
    fn scenario_image_is_compact() {
        let img = Ext2ImageBuilder::root_dir_scenario().build().expect("build");
        assert_eq!(img.len(), 262 * 1024);
        assert_eq!(&img[1024 + 0x38..1024 + 0x3A], &EXT2_SUPER_MAGIC.to_le_bytes());
        // root inode record
        let root = 5 * 1024 + 128;
        assert_eq!(
            u16::from_le_bytes([img[root], img[root + 1]]),
            S_IFDIR | 0o755
        );
    }

    #[test]
    fn build_rejects_out_of_range_inode() {
        let err = Ext2ImageBuilder::one_group_1k()
            .inode(5000, InodeFields::symlink())
            .build()
            .expect_err("inode past inodes_count");
        assert!(err.to_string().contains("inode 5000"));
    }

    #[test]
    fn group_descriptor_counts() {
        let img = Ext2ImageBuilder::root_dir_scenario().build().expect("build");
        let gd = 2048;
        let free_blocks = u16::from_le_bytes([img[gd + 12], img[gd + 13]]);
        let free_inodes = u16::from_le_bytes([img[gd + 14], img[gd + 15]]);
        let dirs = u16::from_le_bytes([img[gd + 16], img[gd + 17]]);
        // blocks 1..=261 used (sb, gdt, bitmaps, table, root data)
        assert_eq!(free_blocks, 8192 - 261);
        assert_eq!(free_inodes, 2047);
        assert_eq!(dirs, 1);
    }
}
