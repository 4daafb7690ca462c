#![forbid(unsafe_code)]
//! Extraction pipeline.
//!
//! Sequences the stages over a read-only image: superblock decode and
//! validation, group descriptor table, bitmap scan, inode decode, directory
//! walk, indirect walk. The whole [`ExtractionReport`] is assembled in
//! memory before anything is handed to a sink, so a fatal error never
//! leaves partial output behind.

pub mod sink;

use ffx_block::{ByteDevice, FileByteDevice, read_range, read_superblock_region};
use ffx_ondisk::{Diagnostics, Ext2Geometry, Ext2Superblock, FsContext, GroupDescriptor, GroupTable};
use ffx_types::ParseError;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

pub use ffx_alloc::{AllocatedInodeSet, FreeUnit, GroupBitmapSummary, UnitKind};
pub use ffx_block::MemByteDevice;
pub use ffx_dir::DirectoryEntry;
pub use ffx_error::{FfxError, Result, Severity};
pub use ffx_indirect::{IndirectPointer, IndirectSource};
pub use ffx_inode::{DirectoryWork, InodeRecord};
pub use ffx_ondisk::{GroupPointerKind, InodeKind, SuperblockViolation, Warning};

/// Options controlling an extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Where each inode's single-indirect block number is read from.
    pub indirect_source: IndirectSource,
}

/// One group descriptor row, with the group size it was checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRecord {
    pub blocks_per_group: u32,
    #[serde(flatten)]
    pub descriptor: GroupDescriptor,
}

/// Every record produced by one extraction run, in output order.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub superblock: Ext2Geometry,
    pub groups: Vec<GroupRecord>,
    pub free_units: Vec<FreeUnit>,
    pub group_bitmaps: Vec<GroupBitmapSummary>,
    pub allocated_inodes: AllocatedInodeSet,
    pub inodes: Vec<InodeRecord>,
    pub directory_entries: Vec<DirectoryEntry>,
    pub indirect_pointers: Vec<IndirectPointer>,
    pub warnings: Vec<Warning>,
}

impl ExtractionReport {
    /// Serialize the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FfxError::Format(e.to_string()))
    }
}

/// Map a parse-layer error onto the runtime error taxonomy.
#[must_use]
pub fn parse_error_to_ffx(e: &ParseError) -> FfxError {
    match e {
        ParseError::InvalidField { .. } => FfxError::Format(e.to_string()),
        ParseError::InsufficientData { .. } => FfxError::Parse(e.to_string()),
    }
}

fn violations_to_ffx(violations: &[SuperblockViolation]) -> FfxError {
    FfxError::InvalidSuperblock {
        violations: violations.iter().map(ToString::to_string).collect(),
    }
}

/// Decode and validate the superblock of `dev`.
///
/// Every failed check is reported together in `FfxError::InvalidSuperblock`.
pub fn read_geometry(dev: &dyn ByteDevice) -> Result<Ext2Geometry> {
    let region = read_superblock_region(dev)?;
    let sb = Ext2Superblock::parse_superblock_region(&region).map_err(|e| parse_error_to_ffx(&e))?;
    let geometry = Ext2Geometry::from_superblock(sb, dev.len_bytes())
        .map_err(|violations| violations_to_ffx(&violations))?;
    info!(
        block_size = geometry.block_size.get(),
        groups = geometry.groups_count,
        inodes = geometry.inodes_count(),
        "superblock valid"
    );
    Ok(geometry)
}

/// Build the immutable filesystem context: validated superblock plus the
/// range-checked group descriptor table.
pub fn open_context(dev: &dyn ByteDevice, diags: &mut Diagnostics) -> Result<FsContext> {
    let geometry = read_geometry(dev)?;
    let table = read_range(
        dev,
        geometry.group_desc_table_offset(),
        geometry.group_desc_table_len(),
    )?;
    let (groups, warnings) =
        GroupTable::decode(&geometry, &table).map_err(|e| parse_error_to_ffx(&e))?;
    diags.extend(warnings);
    debug!(groups = groups.len(), "group descriptor table decoded");
    Ok(FsContext::new(geometry, groups))
}

/// Run the full extraction over `dev`.
pub fn extract(dev: &dyn ByteDevice, options: &ExtractOptions) -> Result<ExtractionReport> {
    let mut diags = Diagnostics::new();
    let ctx = open_context(dev, &mut diags)?;

    let scan = ffx_alloc::scan_bitmaps(dev, &ctx, &mut diags)?;
    let inodes = ffx_inode::decode_inodes(dev, &ctx, scan.allocated.iter(), &mut diags);
    let directory_entries =
        ffx_dir::walk_directories(dev, &ctx, &inodes.directories, &mut diags);
    let indirect_pointers = ffx_indirect::walk_indirect(
        dev,
        &ctx,
        scan.allocated.iter(),
        &inodes,
        options.indirect_source,
        &mut diags,
    );

    let blocks_per_group = ctx.geometry.blocks_per_group();
    let groups = ctx
        .groups
        .iter()
        .map(|descriptor| GroupRecord {
            blocks_per_group,
            descriptor: descriptor.clone(),
        })
        .collect();

    let report = ExtractionReport {
        superblock: ctx.geometry,
        groups,
        free_units: scan.free_units,
        group_bitmaps: scan.groups,
        allocated_inodes: scan.allocated,
        inodes: inodes.records,
        directory_entries,
        indirect_pointers,
        warnings: diags.into_vec(),
    };
    info!(
        groups = report.groups.len(),
        allocated_inodes = report.allocated_inodes.len(),
        entries = report.directory_entries.len(),
        indirect = report.indirect_pointers.len(),
        warnings = report.warnings.len(),
        "extraction complete"
    );
    Ok(report)
}

/// Open the image at `path` read-only and extract it.
pub fn extract_path(path: impl AsRef<Path>, options: &ExtractOptions) -> Result<ExtractionReport> {
    let dev = FileByteDevice::open(path)?;
    extract(&dev, options)
}

/// Open the image at `path` read-only and validate its superblock only.
pub fn inspect_path(path: impl AsRef<Path>) -> Result<Ext2Geometry> {
    let dev = FileByteDevice::open(path)?;
    read_geometry(&dev)
}
