// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Block-device access for the executor and verity writer.
//!
//! [`BlockDev`] is the seam between the pipeline and whatever backs a
//! partition: a raw block device, a plain image file, or a copy-on-write
//! overlay. [`ExtentWriter`]/[`ExtentReader`] adapt a scattered extent
//! list into sequential `Write`/`Read` streams so decompressors can be
//! piped straight onto target blocks. All bulk copies move in bounded
//! slices to keep cancellation responsive.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crau::manifest::Extent;

/// Upper bound for one blocking I/O slice
pub const COPY_SLICE_SIZE: usize = 2 << 20;

pub trait BlockDev {
    /// Device length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Hint that `[offset, offset + length)` will never be read again.
    /// Returns true when the range was actually discarded.
    fn discard(&mut self, offset: u64, length: u64) -> io::Result<bool> {
        let _ = (offset, length);
        Ok(false)
    }

    /// Whether discarded ranges are guaranteed to read back as zeros
    fn discard_zeroes_data(&self) -> bool {
        false
    }

    fn flush(&mut self) -> io::Result<()>;
}

/// A partition backed by a regular file or a raw block device node
#[derive(Debug)]
pub struct FileBlockDev {
    file: File,
    len: u64,
}

impl FileBlockDev {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.into(),
                source,
            })?;
        let len = file.metadata().map_err(Error::Io)?.len();

        Ok(Self { file, len })
    }

    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.into(),
            source,
        })?;
        let len = file.metadata().map_err(Error::Io)?.len();

        Ok(Self { file, len })
    }
}

#[cfg(target_os = "linux")]
mod ioctl {
    // BLKDISCARD = _IO(0x12, 119), takes a [start, length] byte range
    nix::ioctl_write_ptr_bad!(blk_discard, nix::request_code_none!(0x12, 119), [u64; 2]);
}

impl BlockDev for FileBlockDev {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    #[cfg(target_os = "linux")]
    fn discard(&mut self, offset: u64, length: u64) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let range = [offset, length];
        // Regular files reject the ioctl; that is a fallback, not an error
        match unsafe { ioctl::blk_discard(self.file.as_raw_fd(), &range) } {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Sequential writer over an ordered extent list. Bytes stream across the
/// extents in order; writing past the total extent size errors.
pub struct ExtentWriter<'a> {
    dev: &'a mut dyn BlockDev,
    block_size: u64,
    extents: &'a [Extent],
    extent_index: usize,
    offset_in_extent: u64,
    written: u64,
}

impl<'a> ExtentWriter<'a> {
    pub fn new(dev: &'a mut dyn BlockDev, block_size: u32, extents: &'a [Extent]) -> Self {
        Self {
            dev,
            block_size: block_size as u64,
            extents,
            extent_index: 0,
            offset_in_extent: 0,
            written: 0,
        }
    }

    /// Bytes the extent list can hold in total
    pub fn capacity(&self) -> u64 {
        self.extents.iter().map(|e| e.num_blocks * self.block_size).sum()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for ExtentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(extent) = self.extents.get(self.extent_index) else {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the extent list",
            ));
        };

        let extent_bytes = extent.num_blocks * self.block_size;
        let device_offset = extent.start_block * self.block_size + self.offset_in_extent;
        let available = extent_bytes - self.offset_in_extent;
        let take = (buf.len() as u64).min(available).min(COPY_SLICE_SIZE as u64) as usize;

        self.dev.write_at(device_offset, &buf[..take])?;

        self.offset_in_extent += take as u64;
        self.written += take as u64;

        if self.offset_in_extent == extent_bytes {
            self.extent_index += 1;
            self.offset_in_extent = 0;
        }

        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dev.flush()
    }
}

/// Sequential reader over an ordered extent list
pub struct ExtentReader<'a> {
    dev: &'a dyn BlockDev,
    block_size: u64,
    extents: &'a [Extent],
    extent_index: usize,
    offset_in_extent: u64,
}

impl<'a> ExtentReader<'a> {
    pub fn new(dev: &'a dyn BlockDev, block_size: u32, extents: &'a [Extent]) -> Self {
        Self {
            dev,
            block_size: block_size as u64,
            extents,
            extent_index: 0,
            offset_in_extent: 0,
        }
    }
}

impl Read for ExtentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(extent) = self.extents.get(self.extent_index) else {
            return Ok(0);
        };

        let extent_bytes = extent.num_blocks * self.block_size;
        let device_offset = extent.start_block * self.block_size + self.offset_in_extent;
        let available = extent_bytes - self.offset_in_extent;
        let take = (buf.len() as u64).min(available).min(COPY_SLICE_SIZE as u64) as usize;

        self.dev.read_at(device_offset, &mut buf[..take])?;

        self.offset_in_extent += take as u64;

        if self.offset_in_extent == extent_bytes {
            self.extent_index += 1;
            self.offset_in_extent = 0;
        }

        Ok(take)
    }
}

/// Read the full content of an extent list into memory
pub fn read_extents(dev: &dyn BlockDev, block_size: u32, extents: &[Extent]) -> io::Result<Vec<u8>> {
    let total: u64 = extents.iter().map(|e| e.num_blocks * block_size as u64).sum();
    let mut bytes = Vec::with_capacity(total as usize);
    ExtentReader::new(dev, block_size, extents).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// SHA-256 over the content of an extent list, streamed in slices
pub fn hash_extents(dev: &dyn BlockDev, block_size: u32, extents: &[Extent]) -> io::Result<[u8; 32]> {
    let mut reader = ExtentReader::new(dev, block_size, extents);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_SLICE_SIZE];

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize().into())
}

/// SHA-256 over the first `length` bytes of the device
pub fn hash_device(dev: &dyn BlockDev, length: u64) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_SLICE_SIZE];
    let mut offset = 0u64;

    while offset < length {
        let take = (length - offset).min(COPY_SLICE_SIZE as u64) as usize;
        dev.read_at(offset, &mut buf[..take])?;
        hasher.update(&buf[..take]);
        offset += take as u64;
    }

    Ok(hasher.finalize().into())
}

/// Write zeros across an extent list, in slices
pub fn zero_extents(dev: &mut dyn BlockDev, block_size: u32, extents: &[Extent]) -> io::Result<()> {
    let zeros = vec![0u8; COPY_SLICE_SIZE];

    for extent in extents {
        let mut offset = extent.start_block * block_size as u64;
        let end = extent.end_block() * block_size as u64;

        while offset < end {
            let take = (end - offset).min(COPY_SLICE_SIZE as u64) as usize;
            dev.write_at(offset, &zeros[..take])?;
            offset += take as u64;
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("opening {path:?}")]
    Open {
        path: std::path::PathBuf,
        source: io::Error,
    },
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_dev(blocks: u64, block_size: u32) -> (tempfile::TempDir, FileBlockDev) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.img");
        let file = File::create(&path).unwrap();
        file.set_len(blocks * block_size as u64).unwrap();
        drop(file);

        (dir, FileBlockDev::open(path).unwrap())
    }

    #[test]
    fn extent_writer_scatters_in_order() {
        let (_dir, mut dev) = temp_dev(8, 4);
        let extents = [Extent::new(6, 1), Extent::new(1, 2)];

        let mut writer = ExtentWriter::new(&mut dev, 4, &extents);
        assert_eq!(writer.capacity(), 12);
        writer.write_all(b"AAAABBBBCCCC").unwrap();
        assert_eq!(writer.written(), 12);

        let mut block = [0u8; 4];
        dev.read_at(24, &mut block).unwrap();
        assert_eq!(&block, b"AAAA");
        dev.read_at(4, &mut block).unwrap();
        assert_eq!(&block, b"BBBB");
        dev.read_at(8, &mut block).unwrap();
        assert_eq!(&block, b"CCCC");
    }

    #[test]
    fn extent_writer_rejects_overflow() {
        let (_dir, mut dev) = temp_dev(8, 4);
        let extents = [Extent::new(0, 1)];

        let mut writer = ExtentWriter::new(&mut dev, 4, &extents);
        assert!(writer.write_all(b"AAAAB").is_err());
    }

    #[test]
    fn extent_reader_roundtrip() {
        let (_dir, mut dev) = temp_dev(8, 4);
        let extents = [Extent::new(2, 1), Extent::new(5, 1)];

        let mut writer = ExtentWriter::new(&mut dev, 4, &extents);
        writer.write_all(b"wxyzstuv").unwrap();

        let bytes = read_extents(&dev, 4, &extents).unwrap();
        assert_eq!(bytes, b"wxyzstuv");
    }

    #[test]
    fn discard_on_regular_file_reports_unsupported() {
        let (_dir, mut dev) = temp_dev(8, 4);
        assert!(!dev.discard(0, 16).unwrap());
        assert!(!dev.discard_zeroes_data());
    }

    #[test]
    fn zero_extents_zeroes() {
        let (_dir, mut dev) = temp_dev(4, 4);
        dev.write_at(0, &[0xff; 16]).unwrap();

        zero_extents(&mut dev, 4, &[Extent::new(1, 2)]).unwrap();

        let mut content = [0u8; 16];
        dev.read_at(0, &mut content).unwrap();
        assert_eq!(&content[..4], &[0xff; 4]);
        assert_eq!(&content[4..12], &[0u8; 8]);
        assert_eq!(&content[12..], &[0xff; 4]);
    }
}
