#![forbid(unsafe_code)]
//! Read-only image access.
//!
//! Provides the `ByteDevice` trait with `pread` semantics, a file-backed
//! implementation, and an in-memory implementation used by tests and by
//! callers that already hold the image bytes. The image is never written.

use ffx_error::{FfxError, Result};
use ffx_types::{BlockNumber, BlockSize, ByteOffset, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Byte-addressed, read-only device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A range that ends past `len_bytes()` is `FfxError::OutOfBounds`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Check that `[offset, offset + len)` lies inside a device of `image_len` bytes.
fn check_range(offset: u64, len: usize, image_len: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len));
    match end {
        Some(end) if end <= image_len => Ok(()),
        _ => Err(FfxError::OutOfBounds {
            offset,
            len,
            image_len,
        }),
    }
}

/// File-backed byte device using `pread` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file is opened read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), len, "opened image read-only");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image buffer.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<[u8]>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        // check_range proved offset + len <= bytes.len(), which is a usize.
        #[allow(clippy::cast_possible_truncation)]
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read `len` bytes at `offset` into a freshly allocated buffer.
///
/// The range is checked before the buffer is allocated, so a corrupt length
/// cannot trigger a huge allocation.
pub fn read_range(dev: &dyn ByteDevice, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
    check_range(offset.0, len, dev.len_bytes())?;
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset.0, &mut buf)?;
    Ok(buf)
}

/// Read one whole block.
pub fn read_block(dev: &dyn ByteDevice, block: BlockNumber, block_size: BlockSize) -> Result<Vec<u8>> {
    read_range(dev, block_size.block_to_byte(block), block_size.as_usize())
}

/// Read a little-endian `u32` at an absolute byte offset.
pub fn read_u32_at(dev: &dyn ByteDevice, offset: ByteOffset) -> Result<u32> {
    let mut buf = [0_u8; 4];
    dev.read_exact_at(offset.0, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read the 1024-byte superblock region at its fixed origin.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; SUPERBLOCK_SIZE];
    dev.read_exact_at(SUPERBLOCK_OFFSET as u64, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_reads_in_bounds() {
        let dev = MemByteDevice::new((0_u8..=255).collect());
        let mut buf = [0_u8; 4];
        dev.read_exact_at(10, &mut buf).expect("read");
        assert_eq!(buf, [10, 11, 12, 13]);
        assert_eq!(dev.len_bytes(), 256);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemByteDevice::new(vec![0_u8; 16]);
        let mut buf = [0_u8; 4];
        let err = dev.read_exact_at(14, &mut buf).expect_err("oob");
        assert!(matches!(
            err,
            FfxError::OutOfBounds {
                offset: 14,
                len: 4,
                image_len: 16,
            }
        ));
        assert!(dev.read_exact_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn block_and_word_helpers() {
        let mut image = vec![0_u8; 4096];
        image[2048..2052].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        let dev = MemByteDevice::new(image);
        let bs = BlockSize::new(1024).unwrap();

        let block = read_block(&dev, BlockNumber(2), bs).expect("block");
        assert_eq!(block.len(), 1024);
        assert_eq!(&block[..4], &0xDEAD_BEEF_u32.to_le_bytes());
        assert_eq!(
            read_u32_at(&dev, ByteOffset(2048)).expect("word"),
            0xDEAD_BEEF
        );
        assert!(read_block(&dev, BlockNumber(4), bs).is_err());
    }

    #[test]
    fn superblock_region_requires_two_kib() {
        let short = MemByteDevice::new(vec![0_u8; 1500]);
        assert!(read_superblock_region(&short).is_err());

        let mut image = vec![0_u8; 2048];
        image[1024] = 0xAB;
        let dev = MemByteDevice::new(image);
        let region = read_superblock_region(&dev).expect("region");
        assert_eq!(region[0], 0xAB);
    }

    #[test]
    fn file_device_reads_via_pread() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("write");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 8);
        let mut buf = [0_u8; 3];
        dev.read_exact_at(5, &mut buf).expect("read");
        assert_eq!(buf, [6, 7, 8]);
        assert!(dev.read_exact_at(6, &mut buf).is_err());
    }

    #[test]
    fn file_device_missing_path_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileByteDevice::open(dir.path().join("absent.img")).expect_err("missing");
        assert!(matches!(err, FfxError::Io(_)));
    }
}
