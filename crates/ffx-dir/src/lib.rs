#![forbid(unsafe_code)]
//! Directory entry walking.
//!
//! Linear scan of each queued directory's direct blocks. Every slot, live
//! or deleted, advances the directory's sequence counter; only live entries
//! whose child inode is in range are emitted.

use ffx_block::{ByteDevice, read_block};
use ffx_error::{FfxError, Result};
use ffx_inode::DirectoryWork;
use ffx_ondisk::{DirSlot, Diagnostics, FsContext, Warning, iter_dir_block};
use ffx_types::{BlockNumber, InodeNumber};
use serde::{Serialize, Serializer};
use tracing::{debug, info};

/// One live directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub parent: InodeNumber,
    /// Slot position within the parent directory, deleted slots included.
    pub sequence: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub child: InodeNumber,
    #[serde(serialize_with = "serialize_name_lossy")]
    pub name: Vec<u8>,
}

impl DirectoryEntry {
    /// Entry name with invalid UTF-8 replaced.
    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

fn serialize_name_lossy<S: Serializer>(name: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(name))
}

/// Walks directory blocks, carrying one directory's sequence counter
/// across its blocks.
pub struct DirectoryWalker<'a> {
    ctx: &'a FsContext,
    parent: InodeNumber,
    sequence: u32,
}

impl<'a> DirectoryWalker<'a> {
    #[must_use]
    pub fn new(ctx: &'a FsContext, parent: InodeNumber) -> Self {
        Self {
            ctx,
            parent,
            sequence: 0,
        }
    }

    /// Next sequence index to be assigned.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Scan one directory block, appending live in-range entries to `out`.
    ///
    /// Entries before a malformed slot are kept; the error describes the
    /// first malformed slot and the rest of the block is not scanned.
    pub fn walk_block(
        &mut self,
        block_no: BlockNumber,
        block: &[u8],
        out: &mut Vec<DirectoryEntry>,
        diags: &mut Diagnostics,
    ) -> Result<()> {
        let mut iter = iter_dir_block(block);
        loop {
            let at = iter.offset();
            let slot = match iter.next() {
                None => return Ok(()),
                Some(Ok(slot)) => slot,
                Some(Err(err)) => {
                    return Err(FfxError::Corruption {
                        block: u64::from(block_no.0),
                        detail: format!("offset {at}: {err}"),
                    });
                }
            };

            let sequence = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);

            let DirSlot::Live {
                inode,
                rec_len,
                name_len,
                name,
                ..
            } = slot
            else {
                continue;
            };

            if !self.ctx.geometry.inode_in_range(inode) {
                diags.warn(Warning::DirectoryChildOutOfRange {
                    inode: self.parent,
                    sequence,
                    child: inode,
                    inodes_count: self.ctx.geometry.inodes_count(),
                });
                continue;
            }

            out.push(DirectoryEntry {
                parent: self.parent,
                sequence,
                rec_len,
                name_len,
                child: inode,
                name: name.to_vec(),
            });
        }
    }
}

/// Walk every non-null direct block of one directory.
pub fn walk_directory(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    work: &DirectoryWork,
    diags: &mut Diagnostics,
) -> Vec<DirectoryEntry> {
    let mut walker = DirectoryWalker::new(ctx, work.inode);
    let mut out = Vec::new();

    for &block_no in work.direct_blocks.iter().filter(|b| !b.is_null()) {
        let block = match read_block(dev, block_no, ctx.block_size()) {
            Ok(block) => block,
            Err(err) => {
                diags.warn(Warning::DirectoryBlockUnreadable {
                    inode: work.inode,
                    record_offset: work.record_offset,
                    block: block_no,
                    detail: err.to_string(),
                });
                continue;
            }
        };
        if let Err(err) = walker.walk_block(block_no, &block, &mut out, diags) {
            diags.warn(Warning::DirectoryBlockMalformed {
                inode: work.inode,
                record_offset: work.record_offset,
                block: block_no,
                detail: err.to_string(),
            });
        }
    }

    debug!(
        inode = work.inode.0,
        record_offset = work.record_offset.0,
        entries = out.len(),
        slots = walker.sequence(),
        "walked directory"
    );
    out
}

/// Walk every queued directory in queue order.
pub fn walk_directories(
    dev: &dyn ByteDevice,
    ctx: &FsContext,
    queue: &[DirectoryWork],
    diags: &mut Diagnostics,
) -> Vec<DirectoryEntry> {
    let mut entries = Vec::new();
    for work in queue {
        entries.extend(walk_directory(dev, ctx, work, diags));
    }
    info!(
        directories = queue.len(),
        entries = entries.len(),
        "directory walk complete"
    );
    entries
}
