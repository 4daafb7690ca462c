#![forbid(unsafe_code)]
//! Allocation bitmap scanning.
//!
//! Walks each group's block bitmap and then its inode bitmap bit by bit,
//! least significant bit first. Clear bits become [`FreeUnit`] records; set
//! bits in the inode bitmap feed the [`AllocatedInodeSet`] that drives inode
//! decoding.

use ffx_block::{ByteDevice, read_block};
use ffx_error::Result;
use ffx_ondisk::{Diagnostics, FsContext, GroupDescriptor, GroupPointerKind, Warning};
use ffx_types::{BlockNumber, GroupNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ── Bitmap primitives ───────────────────────────────────────────────────────

/// Test bit `idx` (LSB first within each byte). Out-of-range bits read as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Count clear bits in the whole bitmap.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8]) -> u32 {
    bitmap.iter().map(|byte| byte.count_zeros()).sum()
}

/// Bit indices of every clear bit, in scan order.
pub fn clear_bits(bitmap: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bits_matching(bitmap, false)
}

/// Bit indices of every set bit, in scan order.
pub fn set_bits(bitmap: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bits_matching(bitmap, true)
}

fn bits_matching(bitmap: &[u8], want: bool) -> impl Iterator<Item = u32> + '_ {
    bitmap.iter().zip(0_u32..).flat_map(move |(&byte, byte_idx)| {
        (0..8_u32)
            .filter(move |bit| ((byte >> bit) & 1 == 1) == want)
            .map(move |bit| byte_idx * 8 + bit)
    })
}

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Block,
    Inode,
}

/// One clear bitmap bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeUnit {
    pub kind: UnitKind,
    /// Block holding the bitmap that reported this unit.
    pub bitmap_block: BlockNumber,
    /// 1-based unit number: `group * per_group + bit_index + 1`.
    pub unit: u64,
}

/// Ascending, duplicate-free list of allocated inode numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocatedInodeSet {
    inodes: Vec<InodeNumber>,
}

impl AllocatedInodeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an inode number. Returns `false` (and ignores the value) when
    /// it would break strict ascending order.
    pub fn push(&mut self, ino: InodeNumber) -> bool {
        if self.inodes.last().is_some_and(|last| *last >= ino) {
            return false;
        }
        self.inodes.push(ino);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[InodeNumber] {
        &self.inodes
    }

    pub fn iter(&self) -> impl Iterator<Item = InodeNumber> + '_ {
        self.inodes.iter().copied()
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.inodes.binary_search(&ino).is_ok()
    }
}

/// Per-group bit counts. `None` when that bitmap was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBitmapSummary {
    pub group: GroupNumber,
    pub free_blocks: Option<u32>,
    pub used_blocks: Option<u32>,
    pub free_inodes: Option<u32>,
    pub used_inodes: Option<u32>,
}

/// Output of a full bitmap scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapScan {
    pub free_units: Vec<FreeUnit>,
    pub allocated: AllocatedInodeSet,
    pub groups: Vec<GroupBitmapSummary>,
}

// ── Scanning ────────────────────────────────────────────────────────────────

/// Append a free-unit record for every clear bit of a block bitmap.
///
/// Returns `(free, used)` bit counts.
pub fn scan_block_bitmap(
    group: GroupNumber,
    bitmap_block: BlockNumber,
    bitmap: &[u8],
    blocks_per_group: u32,
    out: &mut Vec<FreeUnit>,
) -> (u32, u32) {
    let base = u64::from(group.0) * u64::from(blocks_per_group);
    let before = out.len();
    out.extend(clear_bits(bitmap).map(|idx| FreeUnit {
        kind: UnitKind::Block,
        bitmap_block,
        unit: base + u64::from(idx) + 1,
    }));
    let free = u32::try_from(out.len() - before).unwrap_or(u32::MAX);
    (free, total_bits(bitmap).saturating_sub(free))
}

/// Append free-unit records for clear bits and allocated inode numbers for
/// set bits of an inode bitmap.
///
/// Set bits at local index `>= inodes_per_group` are padding and are not
/// treated as inodes. Returns `(free, used)` bit counts.
pub fn scan_inode_bitmap(
    group: GroupNumber,
    bitmap_block: BlockNumber,
    bitmap: &[u8],
    inodes_per_group: u32,
    out: &mut Vec<FreeUnit>,
    allocated: &mut AllocatedInodeSet,
) -> (u32, u32) {
    let base = u64::from(group.0) * u64::from(inodes_per_group);
    let mut free = 0_u32;
    let mut used = 0_u32;

    for (byte_idx, &byte) in (0_u32..).zip(bitmap) {
        for bit in 0..8_u32 {
            let idx = byte_idx * 8 + bit;
            let unit = base + u64::from(idx) + 1;
            if (byte >> bit) & 1 == 0 {
                free += 1;
                out.push(FreeUnit {
                    kind: UnitKind::Inode,
                    bitmap_block,
                    unit,
                });
                continue;
            }
            used += 1;
            if idx < inodes_per_group {
                if let Ok(ino) = u32::try_from(unit) {
                    let ascending = allocated.push(InodeNumber(ino));
                    debug_assert!(ascending, "inode {ino} scanned out of order");
                }
            }
        }
    }
    (free, used)
}

fn total_bits(bitmap: &[u8]) -> u32 {
    u32::try_from(bitmap.len())
        .unwrap_or(u32::MAX)
        .saturating_mul(8)
}

/// Read one bitmap, or warn and return `None` when its pointer is the sentinel.
fn load_bitmap(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    desc: &GroupDescriptor,
    kind: GroupPointerKind,
    diags: &mut Diagnostics,
) -> Result<Option<(BlockNumber, Vec<u8>)>> {
    let Some(block) = desc.pointer(kind).get() else {
        diags.warn(Warning::BitmapSkipped {
            group: desc.group,
            pointer: kind,
        });
        return Ok(None);
    };
    let bytes = read_block(dev, block, ctx.block_size())?;
    Ok(Some((block, bytes)))
}

/// Scan every group's block bitmap then inode bitmap.
///
/// A bitmap whose read fails aborts the scan.
pub fn scan_bitmaps(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    diags: &mut Diagnostics,
) -> Result<BitmapScan> {
    let mut scan = BitmapScan::default();

    for desc in ctx.groups.iter() {
        let mut summary = GroupBitmapSummary {
            group: desc.group,
            free_blocks: None,
            used_blocks: None,
            free_inodes: None,
            used_inodes: None,
        };

        if let Some((block, bitmap)) =
            load_bitmap(dev, ctx, desc, GroupPointerKind::BlockBitmap, diags)?
        {
            let (free, used) = scan_block_bitmap(
                desc.group,
                block,
                &bitmap,
                ctx.geometry.blocks_per_group(),
                &mut scan.free_units,
            );
            summary.free_blocks = Some(free);
            summary.used_blocks = Some(used);
        }

        if let Some((block, bitmap)) =
            load_bitmap(dev, ctx, desc, GroupPointerKind::InodeBitmap, diags)?
        {
            let (free, used) = scan_inode_bitmap(
                desc.group,
                block,
                &bitmap,
                ctx.geometry.inodes_per_group(),
                &mut scan.free_units,
                &mut scan.allocated,
            );
            summary.free_inodes = Some(free);
            summary.used_inodes = Some(used);
        }

        debug!(
            group = desc.group.0,
            free_blocks = ?summary.free_blocks,
            free_inodes = ?summary.free_inodes,
            "scanned group bitmaps"
        );
        scan.groups.push(summary);
    }

    info!(
        groups = scan.groups.len(),
        free_units = scan.free_units.len(),
        allocated_inodes = scan.allocated.len(),
        "bitmap scan complete"
    );
    Ok(scan)
}
