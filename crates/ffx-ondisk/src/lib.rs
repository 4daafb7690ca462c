#![forbid(unsafe_code)]
//! On-disk format parsing for ext2-style structures.
//!
//! Pure parsing crate: no I/O. Parses byte slices into typed superblock,
//! group descriptor, inode, directory-slot, and indirect-block values, and
//! holds the validated [`FsContext`] plus the warning taxonomy shared by the
//! extraction stages.

pub mod context;
pub mod diagnostics;
pub mod ext2;

pub use context::{Ext2Geometry, FsContext, GroupDescriptor, GroupPointer, GroupTable};
pub use diagnostics::{Diagnostics, GroupPointerKind, Warning};
pub use ext2::{
    DirBlockIter, DirSlot, Ext2GroupDesc, Ext2Inode, Ext2Superblock, InodeKind,
    SuperblockViolation, indirect_pointers, iter_dir_block,
};
