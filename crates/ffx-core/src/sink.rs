#![forbid(unsafe_code)]
//! CSV record sinks.
//!
//! One comma-separated line per record; block numbers in lowercase hex, the
//! mode in octal, counts in decimal. Directory entry names are written as
//! raw bytes.

use crate::{ExtractionReport, GroupRecord};
use ffx_alloc::FreeUnit;
use ffx_dir::DirectoryEntry;
use ffx_error::Result;
use ffx_indirect::IndirectPointer;
use ffx_inode::InodeRecord;
use ffx_ondisk::{Ext2Geometry, GroupPointer};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A record that renders as one CSV line.
pub trait CsvRecord {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()>;
}

impl CsvRecord for Ext2Geometry {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        let sb = &self.superblock;
        writeln!(
            out,
            "{:04x},{},{},{},{},{},{},{},{}",
            sb.magic,
            sb.inodes_count,
            sb.blocks_count,
            sb.block_size,
            sb.frag_size,
            sb.blocks_per_group,
            sb.inodes_per_group,
            sb.frags_per_group,
            sb.first_data_block,
        )
    }
}

fn write_pointer(out: &mut dyn Write, ptr: GroupPointer) -> io::Result<()> {
    match ptr.get() {
        Some(block) => write!(out, ",{block:x}"),
        None => out.write_all(b",-1"),
    }
}

impl CsvRecord for GroupRecord {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        let d = &self.descriptor;
        write!(
            out,
            "{},{},{},{}",
            self.blocks_per_group, d.free_blocks_count, d.free_inodes_count, d.used_dirs_count
        )?;
        write_pointer(out, d.inode_bitmap)?;
        write_pointer(out, d.block_bitmap)?;
        write_pointer(out, d.inode_table)?;
        out.write_all(b"\n")
    }
}

impl CsvRecord for FreeUnit {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{:x},{}", self.bitmap_block, self.unit)
    }
}

impl CsvRecord for InodeRecord {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{},{},{:o},{},{},{},{:x},{:x},{:x},{},{}",
            self.inode,
            self.kind.tag(),
            self.mode,
            self.uid,
            self.gid,
            self.links_count,
            self.ctime,
            self.mtime,
            self.atime,
            self.size,
            self.block_count,
        )?;
        for block in &self.blocks {
            write!(out, ",{block:x}")?;
        }
        out.write_all(b"\n")
    }
}

impl CsvRecord for DirectoryEntry {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{},{},{},{},{},",
            self.parent, self.sequence, self.rec_len, self.name_len, self.child
        )?;
        out.write_all(&self.name)?;
        out.write_all(b"\n")
    }
}

impl CsvRecord for IndirectPointer {
    fn write_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "{:x},{},{:x}",
            self.indirect_block, self.sequence, self.pointee
        )
    }
}

/// Write every record of one stream to `out`.
pub fn write_stream<'a, R, I>(out: &mut dyn Write, records: I) -> io::Result<()>
where
    R: CsvRecord + 'a,
    I: IntoIterator<Item = &'a R>,
{
    for record in records {
        record.write_csv(out)?;
    }
    Ok(())
}

/// File names of the six output streams.
pub struct CsvStreams;

impl CsvStreams {
    pub const SUPER: &'static str = "super.csv";
    pub const GROUP: &'static str = "group.csv";
    pub const BITMAP: &'static str = "bitmap.csv";
    pub const INODE: &'static str = "inode.csv";
    pub const DIRECTORY: &'static str = "directory.csv";
    pub const INDIRECT: &'static str = "indirect.csv";

    /// Write all six streams into `dir`, returning the created paths.
    pub fn write_to_dir(dir: impl AsRef<Path>, report: &ExtractionReport) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let mut written = Vec::with_capacity(6);

        written.push(write_file(dir, Self::SUPER, |out| {
            report.superblock.write_csv(out)
        })?);
        written.push(write_file(dir, Self::GROUP, |out| {
            write_stream(out, &report.groups)
        })?);
        written.push(write_file(dir, Self::BITMAP, |out| {
            write_stream(out, &report.free_units)
        })?);
        written.push(write_file(dir, Self::INODE, |out| {
            write_stream(out, &report.inodes)
        })?);
        written.push(write_file(dir, Self::DIRECTORY, |out| {
            write_stream(out, &report.directory_entries)
        })?);
        written.push(write_file(dir, Self::INDIRECT, |out| {
            write_stream(out, &report.indirect_pointers)
        })?);

        Ok(written)
    }
}

fn write_file(
    dir: &Path,
    name: &str,
    body: impl FnOnce(&mut dyn Write) -> io::Result<()>,
) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut out = BufWriter::new(File::create(&path)?);
    body(&mut out)?;
    out.flush()?;
    debug!(path = %path.display(), "wrote stream");
    Ok(path)
}
