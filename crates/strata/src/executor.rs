// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Applies one install operation to one partition.
//!
//! Preconditions checked before any target byte moves: the blob matches
//! its declared SHA-256 (official builds require one for blob-carrying
//! operations), source extents match what the algorithm expects, and
//! source content matches its declared hash where present. Decompression
//! streams straight onto target extents via [`ExtentWriter`].

use std::io::{self, Read};

use log::trace;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crau::manifest::{total_blocks, InstallOperation, OperationKind};

use crate::block::{self, read_extents, zero_extents, BlockDev, ExtentWriter, COPY_SLICE_SIZE};
use crate::bspatch;
use crate::error::ErrorCode;

/// The install operations this executor will run. Manifests may carry
/// other kinds; they parse but are refused here.
pub fn is_supported(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::Replace
            | OperationKind::ReplaceBz
            | OperationKind::ReplaceXz
            | OperationKind::Zero
            | OperationKind::Discard
            | OperationKind::SourceCopy
            | OperationKind::BrotliBsdiff
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Executor {
    block_size: u32,
    /// Official builds refuse blob operations without a declared hash
    require_operation_hash: bool,
}

impl Executor {
    pub fn new(block_size: u32, require_operation_hash: bool) -> Self {
        Self {
            block_size,
            require_operation_hash,
        }
    }

    /// Apply `op`. `blob` holds exactly `data_length` bytes for
    /// blob-carrying operations and is empty otherwise; `source` is the
    /// source-slot device for operations that read it.
    pub fn apply(
        &self,
        op: &InstallOperation,
        blob: &[u8],
        source: Option<&dyn BlockDev>,
        target: &mut dyn BlockDev,
    ) -> Result<(), Error> {
        // SOURCE_COPY optimized away by the snapshot controller
        if op.dst_extents.is_empty() {
            trace!("skipping no-op {}", op.kind);
            return Ok(());
        }

        if !is_supported(op.kind) {
            return Err(Error::Unsupported(op.kind));
        }

        self.check_blob_hash(op, blob)?;

        let dst_bytes = total_blocks(&op.dst_extents) * self.block_size as u64;

        match op.kind {
            OperationKind::Replace => {
                if blob.len() as u64 != dst_bytes {
                    return Err(Error::OutputSize {
                        kind: op.kind,
                        expected: dst_bytes,
                        got: blob.len() as u64,
                    });
                }
                self.write_stream(op, blob, target)
            }
            OperationKind::ReplaceBz => {
                self.write_stream(op, bzip2::read::BzDecoder::new(blob), target)
            }
            OperationKind::ReplaceXz => self.write_stream(op, xz2::read::XzDecoder::new(blob), target),
            OperationKind::Zero => {
                zero_extents(target, self.block_size, &op.dst_extents).map_err(Error::TargetIo)
            }
            OperationKind::Discard => self.discard(op, target),
            OperationKind::SourceCopy => self.source_copy(op, source, target),
            OperationKind::BrotliBsdiff => self.patch(op, blob, source, target),
            _ => Err(Error::Unsupported(op.kind)),
        }
    }

    fn check_blob_hash(&self, op: &InstallOperation, blob: &[u8]) -> Result<(), Error> {
        if !op.kind.has_blob() {
            return Ok(());
        }

        match op.data_sha256 {
            Some(expected) => {
                let digest: [u8; 32] = Sha256::digest(blob).into();
                if digest != expected {
                    return Err(Error::BlobHashMismatch {
                        expected: hex::encode(expected),
                        got: hex::encode(digest),
                    });
                }
                Ok(())
            }
            None if self.require_operation_hash => Err(Error::BlobHashMissing(op.kind)),
            None => Ok(()),
        }
    }

    /// Stream `reader` onto the destination extents, requiring it to
    /// produce exactly the destination size
    fn write_stream(
        &self,
        op: &InstallOperation,
        mut reader: impl Read,
        target: &mut dyn BlockDev,
    ) -> Result<(), Error> {
        let mut writer = ExtentWriter::new(target, self.block_size, &op.dst_extents);
        let expected = writer.capacity();

        let mut buf = vec![0u8; COPY_SLICE_SIZE];
        loop {
            let read = reader.read(&mut buf).map_err(Error::Decompress)?;
            if read == 0 {
                break;
            }
            io::Write::write_all(&mut writer, &buf[..read]).map_err(Error::TargetIo)?;
        }

        if writer.written() != expected {
            return Err(Error::OutputSize {
                kind: op.kind,
                expected,
                got: writer.written(),
            });
        }

        Ok(())
    }

    /// Discard is a hint; unless the device promises zeroed reads after a
    /// discard, zeros are written so later verity passes see stable bytes
    fn discard(&self, op: &InstallOperation, target: &mut dyn BlockDev) -> Result<(), Error> {
        if target.discard_zeroes_data() {
            let mut all_discarded = true;
            for extent in &op.dst_extents {
                let offset = extent.start_block * self.block_size as u64;
                let length = extent.num_blocks * self.block_size as u64;
                all_discarded &= target.discard(offset, length).map_err(Error::TargetIo)?;
            }
            if all_discarded {
                return Ok(());
            }
        }

        zero_extents(target, self.block_size, &op.dst_extents).map_err(Error::TargetIo)
    }

    fn source_copy(
        &self,
        op: &InstallOperation,
        source: Option<&dyn BlockDev>,
        target: &mut dyn BlockDev,
    ) -> Result<(), Error> {
        let source = source.ok_or(Error::NoSourceDevice(op.kind))?;

        self.check_source_hash(op, source)?;

        let mut reader = block::ExtentReader::new(source, self.block_size, &op.src_extents);
        let mut writer = ExtentWriter::new(target, self.block_size, &op.dst_extents);
        let mut buf = vec![0u8; COPY_SLICE_SIZE];

        loop {
            let read = reader.read(&mut buf).map_err(Error::SourceIo)?;
            if read == 0 {
                break;
            }
            io::Write::write_all(&mut writer, &buf[..read]).map_err(Error::TargetIo)?;
        }

        Ok(())
    }

    fn patch(
        &self,
        op: &InstallOperation,
        blob: &[u8],
        source: Option<&dyn BlockDev>,
        target: &mut dyn BlockDev,
    ) -> Result<(), Error> {
        let source = source.ok_or(Error::NoSourceDevice(op.kind))?;

        self.check_source_hash(op, source)?;

        let old = read_extents(source, self.block_size, &op.src_extents).map_err(Error::SourceIo)?;
        let new = bspatch::bspatch(&old, blob)?;

        let dst_bytes = total_blocks(&op.dst_extents) * self.block_size as u64;
        if new.len() as u64 != dst_bytes {
            return Err(Error::OutputSize {
                kind: op.kind,
                expected: dst_bytes,
                got: new.len() as u64,
            });
        }

        self.write_stream(op, new.as_slice(), target)
    }

    fn check_source_hash(&self, op: &InstallOperation, source: &dyn BlockDev) -> Result<(), Error> {
        let Some(expected) = op.src_sha256 else {
            return Ok(());
        };

        let digest =
            block::hash_extents(source, self.block_size, &op.src_extents).map_err(Error::SourceIo)?;

        if digest != expected {
            return Err(Error::SourceHashMismatch {
                expected: hex::encode(expected),
                got: hex::encode(digest),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation {0} is not supported by this build")]
    Unsupported(OperationKind),
    #[error("blob hash mismatch: expected {expected}, got {got}")]
    BlobHashMismatch { expected: String, got: String },
    #[error("operation {0} carries no blob hash on an official build")]
    BlobHashMissing(OperationKind),
    #[error("source hash mismatch: expected {expected}, got {got}")]
    SourceHashMismatch { expected: String, got: String },
    #[error("operation {0} needs a source device")]
    NoSourceDevice(OperationKind),
    #[error("{kind} produced {got} bytes for {expected} byte destination")]
    OutputSize {
        kind: OperationKind,
        expected: u64,
        got: u64,
    },
    #[error("patch apply")]
    Patch(#[from] bspatch::Error),
    #[error("decompress")]
    Decompress(#[source] io::Error),
    #[error("source read")]
    SourceIo(#[source] io::Error),
    #[error("target write")]
    TargetIo(#[source] io::Error),
}

impl Error {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Error::BlobHashMismatch { .. } => ErrorCode::DownloadOperationHashMismatch,
            Error::BlobHashMissing(_) => ErrorCode::DownloadOperationHashMissingError,
            Error::SourceHashMismatch { .. } => ErrorCode::FilesystemCopierError,
            Error::TargetIo(_) => ErrorCode::InstallDeviceOpenError,
            _ => ErrorCode::DownloadOperationExecutionError,
        }
    }
}
