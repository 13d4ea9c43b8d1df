// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Payload construction.
//!
//! [`Writer`] emits the bit-exact framing for a manifest whose operations
//! already carry `data_length` and `data_sha256`. Data offsets are
//! recomputed sequentially before the manifest is serialized, so the
//! monotonic-offset invariant holds by construction; callers then stream
//! one blob per blob-carrying operation in manifest order.

use std::io::{self, Write};

use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::header::{Header, Version};
use crate::manifest::{self, Manifest};
use crate::signature::{sign_digest, signature_blob_size};

pub struct Writer<W: Write> {
    inner: W,
    /// Digest excluding signature blobs, the one that gets signed
    signed_hasher: Sha256,
    /// Digest over every byte, reported to the caller on finish
    full_hasher: Sha256,
    bytes_written: u64,
    /// (blob length, blob sha256) for each blob-carrying op, in order
    blobs: Vec<(u64, Option<[u8; 32]>)>,
    next_blob: usize,
    key: Option<RsaPrivateKey>,
}

impl<W: Write> Writer<W> {
    /// Lay down header, manifest and metadata signature. The manifest's
    /// `data_offset` fields are recomputed here; `signatures_offset` and
    /// `signatures_size` are filled in when a signing key is supplied.
    pub fn new(inner: W, mut manifest: Manifest, key: Option<&RsaPrivateKey>) -> Result<Self, Error> {
        let mut next_offset = 0u64;
        let mut blobs = vec![];

        for partition in &mut manifest.partitions {
            for op in &mut partition.operations {
                match op.data_length {
                    Some(length) => {
                        op.data_offset = Some(next_offset);
                        next_offset += length;
                        blobs.push((length, op.data_sha256));
                    }
                    None => op.data_offset = None,
                }
            }
        }

        match key {
            Some(key) => {
                manifest.signatures_offset = Some(next_offset);
                manifest.signatures_size = Some(signature_blob_size(key) as u64);
            }
            None => {
                manifest.signatures_offset = None;
                manifest.signatures_size = None;
            }
        }

        let manifest_bytes = manifest.encode_vec()?;

        let metadata_signature_size = match key {
            Some(key) => signature_blob_size(key),
            None => 0,
        };

        let header = Header {
            version: Version::V2,
            manifest_size: manifest_bytes.len() as u64,
            metadata_signature_size,
        };

        let mut writer = Self {
            inner,
            signed_hasher: Sha256::new(),
            full_hasher: Sha256::new(),
            bytes_written: 0,
            blobs,
            next_blob: 0,
            key: key.cloned(),
        };

        let mut framing = vec![];
        header.encode(&mut framing)?;
        framing.extend_from_slice(&manifest_bytes);
        writer.write_signed(&framing)?;

        if let Some(key) = &writer.key {
            // Metadata signature covers exactly [0, metadata_size)
            let metadata_digest = writer.signed_hasher.clone().finalize();
            let blob = sign_digest(&metadata_digest, key)?.encode_vec();
            debug_assert_eq!(blob.len() as u32, metadata_signature_size);
            writer.write_unsigned(&blob)?;
        }

        Ok(writer)
    }

    /// Append the next operation's blob. Blobs must arrive in manifest
    /// order and match the length and hash declared by their operation.
    pub fn write_blob(&mut self, blob: &[u8]) -> Result<(), Error> {
        let Some((length, hash)) = self.blobs.get(self.next_blob).copied() else {
            return Err(Error::UnexpectedBlob);
        };

        if blob.len() as u64 != length {
            return Err(Error::BlobLength {
                expected: length,
                got: blob.len() as u64,
            });
        }

        if let Some(expected) = hash {
            let digest: [u8; 32] = Sha256::digest(blob).into();
            if digest != expected {
                return Err(Error::BlobHash(self.next_blob));
            }
        }

        self.write_signed(blob)?;
        self.next_blob += 1;

        Ok(())
    }

    /// Sign and append the payload signature, returning the inner writer,
    /// the SHA-256 over the whole payload, and the total byte count.
    pub fn finish(mut self) -> Result<(W, [u8; 32], u64), Error> {
        if self.next_blob != self.blobs.len() {
            return Err(Error::MissingBlobs {
                written: self.next_blob,
                expected: self.blobs.len(),
            });
        }

        if let Some(key) = self.key.take() {
            let signed_digest = self.signed_hasher.clone().finalize();
            let blob = sign_digest(&signed_digest, &key)?.encode_vec();
            self.write_unsigned(&blob)?;
        }

        let digest: [u8; 32] = self.full_hasher.finalize().into();

        Ok((self.inner, digest, self.bytes_written))
    }

    fn write_signed(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.signed_hasher.update(bytes);
        self.write_unsigned(bytes)
    }

    fn write_unsigned(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.full_hasher.update(bytes);
        self.bytes_written += bytes.len() as u64;
        self.inner.write_all(bytes)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest encode")]
    ManifestEncode(#[from] manifest::EncodeError),
    #[error("signing")]
    Sign(#[from] rsa::Error),
    #[error("blob supplied for an operation that declares none")]
    UnexpectedBlob,
    #[error("blob length mismatch: operation declares {expected}, got {got}")]
    BlobLength { expected: u64, got: u64 },
    #[error("blob {0} does not match its declared hash")]
    BlobHash(usize),
    #[error("only {written} of {expected} blobs were written")]
    MissingBlobs { written: usize, expected: usize },
    #[error("io")]
    Io(#[from] io::Error),
}
