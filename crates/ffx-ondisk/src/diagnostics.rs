#![forbid(unsafe_code)]
//! Non-fatal extraction warnings.
//!
//! Every recoverable anomaly becomes a [`Warning`] value. The collector logs
//! each one through `tracing` as it is recorded so that a subscriber sees
//! them in order, and the caller still gets the full list in the report.

use ffx_types::{BlockNumber, ByteOffset, GroupNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Which group-descriptor pointer a warning refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPointerKind {
    InodeBitmap,
    BlockBitmap,
    InodeTable,
}

impl GroupPointerKind {
    /// Label used in group pointer diagnostics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::InodeBitmap => "free inode map",
            Self::BlockBitmap => "free block map",
            Self::InodeTable => "inode table",
        }
    }
}

impl fmt::Display for GroupPointerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A group descriptor pointer lies outside the group's block range.
    GroupPointerOutOfRange {
        group: GroupNumber,
        pointer: GroupPointerKind,
        range_start: u64,
        range_end: u64,
        value: BlockNumber,
    },
    /// A bitmap was not scanned because its group pointer is invalid.
    BitmapSkipped {
        group: GroupNumber,
        pointer: GroupPointerKind,
    },
    /// An allocated inode's record was not decoded because its group's
    /// inode table pointer is invalid.
    InodeTableUnavailable {
        inode: InodeNumber,
        group: GroupNumber,
    },
    /// An allocated inode's record could not be read from the image.
    InodeUnreadable { inode: InodeNumber, detail: String },
    /// A directory block could not be read; it contributes no entries.
    DirectoryBlockUnreadable {
        inode: InodeNumber,
        /// Byte offset of the directory's own inode record.
        record_offset: ByteOffset,
        block: BlockNumber,
        detail: String,
    },
    /// A directory block is malformed; the rest of the block is skipped.
    DirectoryBlockMalformed {
        inode: InodeNumber,
        /// Byte offset of the directory's own inode record.
        record_offset: ByteOffset,
        block: BlockNumber,
        detail: String,
    },
    /// A live entry names an inode outside `[1, inodes_count]`.
    DirectoryChildOutOfRange {
        inode: InodeNumber,
        sequence: u32,
        child: InodeNumber,
        inodes_count: u32,
    },
    /// The word naming an inode's indirect block could not be read.
    IndirectPointerUnreadable {
        inode: InodeNumber,
        offset: u64,
        detail: String,
    },
    /// An indirect block could not be read; it contributes no pointers.
    IndirectBlockUnreadable {
        inode: InodeNumber,
        block: BlockNumber,
        detail: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupPointerOutOfRange {
                group,
                pointer,
                range_start,
                range_end,
                value,
            } => write!(
                f,
                "Group {group}: blocks {range_start}-{range_end}, {pointer} starts at {value:x}"
            ),
            Self::BitmapSkipped { group, pointer } => {
                write!(f, "Group {group}: {pointer} pointer invalid, bitmap not scanned")
            }
            Self::InodeTableUnavailable { inode, group } => write!(
                f,
                "Inode {inode}: group {group} inode table pointer invalid, record not decoded"
            ),
            Self::InodeUnreadable { inode, detail } => {
                write!(f, "Inode {inode}: record unreadable: {detail}")
            }
            Self::DirectoryBlockUnreadable {
                inode,
                block,
                detail,
                ..
            } => write!(f, "Directory {inode}: block {block:x} unreadable: {detail}"),
            Self::DirectoryBlockMalformed {
                inode,
                block,
                detail,
                ..
            } => write!(f, "Directory {inode}: block {block:x} malformed: {detail}"),
            Self::DirectoryChildOutOfRange {
                inode,
                sequence,
                child,
                inodes_count,
            } => write!(
                f,
                "Directory {inode}: entry {sequence} names inode {child} outside 1-{inodes_count}"
            ),
            Self::IndirectPointerUnreadable {
                inode,
                offset,
                detail,
            } => write!(
                f,
                "Inode {inode}: indirect pointer at byte {offset} unreadable: {detail}"
            ),
            Self::IndirectBlockUnreadable {
                inode,
                block,
                detail,
            } => write!(
                f,
                "Inode {inode}: indirect block {block:x} unreadable: {detail}"
            ),
        }
    }
}

/// Ordered warning collector.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and record one warning.
    pub fn warn(&mut self, warning: Warning) {
        warn!(target: "ffx::extract", "{warning}");
        self.warnings.push(warning);
    }

    /// Append warnings produced elsewhere, logging each.
    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        for warning in warnings {
            self.warn(warning);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Warning] {
        &self.warnings
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Warning> {
        self.warnings
    }
}
