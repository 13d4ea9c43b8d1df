// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Streaming payload consumption.
//!
//! [`StreamParser`] is fed arbitrary-sized chunks and walks the payload
//! framing exactly: header, manifest, metadata signature, one blob per
//! operation in manifest order, payload signature. Metadata is validated
//! before a single operation is surfaced, and two running SHA-256 digests
//! are maintained: one over every byte (checked against the update
//! descriptor's expected payload hash) and one excluding the signature
//! blobs (the digest the payload signature actually signs).

use std::sync::Arc;

use log::{debug, info};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::header::{self, Header};
use crate::manifest::{self, Manifest};
use crate::signature::{self, Signatures};
use crate::BuildPolicy;

/// Delta minor versions this parser understands
pub const SUPPORTED_MINOR_VERSIONS: &[u32] = &[5, 6, 7, 8];

/// Minor version carried by full payloads
pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;

/// Upper bound for the manifest and metadata signature, to keep a hostile
/// header from ballooning the buffer
pub const DEFAULT_MAX_METADATA_SIZE: u64 = 4 << 20;

/// Expectations supplied by the update descriptor before any payload byte
/// arrives. The parser fails closed against these.
#[derive(Debug, Clone)]
pub struct Options {
    /// Total payload size in bytes, signatures included
    pub payload_size: u64,
    /// SHA-256 over the whole payload
    pub payload_hash: [u8; 32],
    /// Metadata size from the descriptor, cross-checked against the header
    pub metadata_size: Option<u64>,
    /// Detached metadata signature blob from the descriptor, used when a
    /// legacy payload carries none in its framing
    pub metadata_signature: Option<Vec<u8>>,
    /// Keys accepted for metadata and payload signatures
    pub public_keys: Vec<RsaPublicKey>,
    /// When set, unsigned payloads are rejected outright
    pub signatures_required: bool,
    pub max_metadata_size: u64,
}

impl Options {
    pub fn new(payload_size: u64, payload_hash: [u8; 32]) -> Self {
        Self {
            payload_size,
            payload_hash,
            metadata_size: None,
            metadata_signature: None,
            public_keys: vec![],
            signatures_required: false,
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
        }
    }

    pub fn with_public_keys(self, public_keys: Vec<RsaPublicKey>) -> Self {
        Self {
            signatures_required: !public_keys.is_empty(),
            public_keys,
            ..self
        }
    }
}

/// Something the parser surfaced while draining a chunk
#[derive(Debug)]
pub enum Event {
    /// Header, manifest and metadata signature are consumed and validated;
    /// the manifest is now available via [`StreamParser::manifest`]
    Metadata,
    /// One operation's blob is fully buffered. Operations without a blob
    /// are surfaced in order with an empty blob.
    Operation {
        partition_index: usize,
        operation_index: usize,
        blob: Vec<u8>,
    },
    /// Every byte is consumed; hashes and signatures check out
    Complete,
}

/// Flattened schedule entry: one operation in global manifest order
#[derive(Debug, Clone, Copy)]
struct OpRef {
    partition_index: usize,
    operation_index: usize,
    blob_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitHeader,
    WaitManifest,
    WaitMetadataSignature,
    WaitOperations,
    WaitPayloadSignature,
    Done,
}

pub struct StreamParser {
    options: Options,
    policy: Arc<dyn BuildPolicy>,

    state: State,
    pending: Vec<u8>,
    bytes_consumed: u64,

    /// Hash over every payload byte, compared to the descriptor hash
    full_hasher: Sha256,
    /// Hash excluding both signature blobs, the signed digest
    signed_hasher: Sha256,

    header: Option<Header>,
    /// Raw manifest bytes, held until the metadata signature clears
    manifest_bytes: Vec<u8>,
    manifest: Option<Manifest>,
    schedule: Vec<OpRef>,
    next_schedule: usize,
}

impl StreamParser {
    pub fn new(options: Options, policy: Arc<dyn BuildPolicy>) -> Self {
        Self {
            options,
            policy,
            state: State::WaitHeader,
            pending: vec![],
            bytes_consumed: 0,
            full_hasher: Sha256::new(),
            signed_hasher: Sha256::new(),
            header: None,
            manifest_bytes: vec![],
            manifest: None,
            schedule: vec![],
            next_schedule: 0,
        }
    }

    /// The validated manifest, available after [`Event::Metadata`]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Bytes consumed from the stream so far
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one chunk and drain every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Event>, Error> {
        if self.state == State::Done && !chunk.is_empty() {
            return Err(Error::PayloadSizeMismatch {
                expected: self.options.payload_size,
                got: self.bytes_consumed + chunk.len() as u64,
            });
        }

        if self.bytes_consumed + self.pending.len() as u64 + chunk.len() as u64 > self.options.payload_size {
            return Err(Error::PayloadSizeMismatch {
                expected: self.options.payload_size,
                got: self.bytes_consumed + self.pending.len() as u64 + chunk.len() as u64,
            });
        }

        self.pending.extend_from_slice(chunk);

        let mut events = vec![];

        loop {
            let need = match self.need() {
                Some(need) => need,
                None => break,
            };

            if (self.pending.len() as u64) < need {
                break;
            }

            let bytes = self.take(need as usize);

            match self.state {
                State::WaitHeader => self.enter_manifest(&bytes)?,
                State::WaitManifest => {
                    // Untrusted until the metadata signature clears; the
                    // bytes are only stashed here
                    self.manifest_bytes = bytes;
                    self.state = State::WaitMetadataSignature;
                }
                State::WaitMetadataSignature => {
                    self.validate_metadata(&bytes)?;
                    events.push(Event::Metadata);
                    self.enter_operations();
                    if self.state == State::Done {
                        self.finish()?;
                        events.push(Event::Complete);
                    }
                }
                State::WaitOperations => {
                    let op = self.schedule[self.next_schedule];
                    self.next_schedule += 1;

                    events.push(Event::Operation {
                        partition_index: op.partition_index,
                        operation_index: op.operation_index,
                        blob: bytes,
                    });

                    if self.next_schedule == self.schedule.len() {
                        self.enter_payload_signature();
                        if self.state == State::Done {
                            self.finish()?;
                            events.push(Event::Complete);
                        }
                    }
                }
                State::WaitPayloadSignature => {
                    self.verify_payload_signature(&bytes)?;
                    self.state = State::Done;
                    self.finish()?;
                    events.push(Event::Complete);
                }
                State::Done => unreachable!("no byte need in Done"),
            }
        }

        Ok(events)
    }

    /// Bytes required to advance out of the current state, or None when no
    /// further input is expected
    fn need(&self) -> Option<u64> {
        match self.state {
            State::WaitHeader => Some(Header::SIZE as u64),
            State::WaitManifest => Some(self.header.as_ref().expect("header set").manifest_size),
            State::WaitMetadataSignature => {
                Some(self.header.as_ref().expect("header set").metadata_signature_size as u64)
            }
            State::WaitOperations => self.schedule.get(self.next_schedule).map(|op| op.blob_length),
            State::WaitPayloadSignature => {
                self.manifest.as_ref().expect("manifest set").signatures_size
            }
            State::Done => None,
        }
    }

    /// Remove `count` bytes from the buffer, folding them into the running
    /// digests as the current state requires
    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.pending.split_off(count);
        let bytes = std::mem::replace(&mut self.pending, rest);

        self.full_hasher.update(&bytes);

        // Signature blobs are excluded from the digest they sign
        if !matches!(self.state, State::WaitMetadataSignature | State::WaitPayloadSignature) {
            self.signed_hasher.update(&bytes);
        }

        self.bytes_consumed += bytes.len() as u64;
        bytes
    }

    fn enter_manifest(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let header = Header::decode(bytes)?;

        if header.manifest_size > self.options.max_metadata_size {
            return Err(Error::ManifestTooLarge(header.manifest_size));
        }
        if header.metadata_signature_size as u64 > self.options.max_metadata_size {
            return Err(Error::ManifestTooLarge(header.metadata_signature_size as u64));
        }

        if let Some(expected) = self.options.metadata_size {
            if header.metadata_size() != expected {
                return Err(Error::MetadataSizeMismatch {
                    expected,
                    got: header.metadata_size(),
                });
            }
        }

        debug!(
            "payload header: version {:?}, manifest {} bytes, metadata signature {} bytes",
            header.version, header.manifest_size, header.metadata_signature_size
        );

        self.header = Some(header);
        self.state = State::WaitManifest;

        Ok(())
    }

    /// Runs once header, manifest and metadata signature are all buffered.
    /// The signature is checked against the raw bytes first; the manifest
    /// is only decoded, and thereby only ever observed downstream, after
    /// it clears.
    fn validate_metadata(&mut self, signature_bytes: &[u8]) -> Result<(), Error> {
        let header = self.header.as_ref().expect("header set");

        // Legacy payloads may omit the in-stream signature; the update
        // descriptor can supply it detached instead
        let signature_bytes = if signature_bytes.is_empty() {
            self.options.metadata_signature.clone().unwrap_or_default()
        } else {
            signature_bytes.to_vec()
        };

        if signature_bytes.is_empty() {
            if self.options.signatures_required {
                return Err(Error::MetadataSignatureMissing);
            }
        } else if !self.options.public_keys.is_empty() {
            let signatures =
                Signatures::decode(&signature_bytes).map_err(Error::MetadataSignatureDecode)?;

            // The signed digest covers exactly [0, metadata_size)
            let metadata_digest = self.signed_hasher.clone().finalize();

            signatures
                .verify(&metadata_digest, &self.options.public_keys)
                .map_err(|_| Error::MetadataSignatureMismatch)?;
        }

        let manifest_bytes = std::mem::take(&mut self.manifest_bytes);
        let manifest = Manifest::decode(&manifest_bytes).map_err(Error::ManifestParse)?;

        manifest.validate().map_err(Error::ManifestValidate)?;
        self.manifest = Some(manifest);
        let manifest = self.manifest.as_ref().expect("just set");

        if manifest.is_full() {
            if manifest.minor_version != FULL_PAYLOAD_MINOR_VERSION {
                return Err(Error::MismatchedType(manifest.minor_version));
            }
        } else if manifest.minor_version == FULL_PAYLOAD_MINOR_VERSION {
            return Err(Error::MismatchedType(manifest.minor_version));
        } else if !SUPPORTED_MINOR_VERSIONS.contains(&manifest.minor_version) {
            return Err(Error::UnsupportedMinorVersion(manifest.minor_version));
        }

        if let Some(max_timestamp) = manifest.max_timestamp {
            let build_timestamp = self.policy.build_timestamp();
            if max_timestamp < build_timestamp && !self.policy.allow_downgrade() {
                return Err(Error::Timestamp {
                    payload: max_timestamp,
                    build: build_timestamp,
                });
            }
        }

        // The signature blob must terminate the stream exactly
        let data_size = manifest.data_blobs_size();
        let signature_size = manifest.signatures_size.unwrap_or(0);
        let expected_total = header.data_offset() + data_size + signature_size;
        if expected_total != self.options.payload_size {
            return Err(Error::PayloadSizeMismatch {
                expected: self.options.payload_size,
                got: expected_total,
            });
        }

        info!(
            "metadata validated: {} partitions, minor version {}, {} blob bytes",
            manifest.partitions.len(),
            manifest.minor_version,
            data_size
        );

        Ok(())
    }

    fn enter_operations(&mut self) {
        let manifest = self.manifest.as_ref().expect("manifest set");

        self.schedule = manifest
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition_index, partition)| {
                partition
                    .operations
                    .iter()
                    .enumerate()
                    .map(move |(operation_index, op)| OpRef {
                        partition_index,
                        operation_index,
                        blob_length: op.blob_length(),
                    })
            })
            .collect();

        self.next_schedule = 0;

        if self.schedule.is_empty() {
            self.enter_payload_signature();
        } else {
            self.state = State::WaitOperations;
        }
    }

    fn enter_payload_signature(&mut self) {
        let manifest = self.manifest.as_ref().expect("manifest set");

        if manifest.signatures_size.is_some() {
            self.state = State::WaitPayloadSignature;
        } else {
            self.state = State::Done;
        }
    }

    fn verify_payload_signature(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.options.public_keys.is_empty() {
            if self.options.signatures_required {
                return Err(Error::PayloadSignatureMissing);
            }
            return Ok(());
        }

        let signatures = Signatures::decode(bytes).map_err(Error::PayloadSignatureDecode)?;
        let signed_digest = self.signed_hasher.clone().finalize();

        signatures
            .verify(&signed_digest, &self.options.public_keys)
            .map_err(|_| Error::PayloadSignatureMismatch)
    }

    /// Terminal accounting once every byte is in
    fn finish(&mut self) -> Result<(), Error> {
        if self.bytes_consumed != self.options.payload_size {
            return Err(Error::PayloadSizeMismatch {
                expected: self.options.payload_size,
                got: self.bytes_consumed,
            });
        }

        let digest: [u8; 32] = self.full_hasher.clone().finalize().into();
        if digest != self.options.payload_hash {
            return Err(Error::PayloadHashMismatch {
                expected: hex::encode(self.options.payload_hash),
                got: hex::encode(digest),
            });
        }

        info!("payload verified: {} bytes", self.bytes_consumed);

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("header decode")]
    HeaderDecode(#[from] header::DecodeError),
    #[error("manifest of {0} bytes exceeds the configured cap")]
    ManifestTooLarge(u64),
    #[error("metadata size mismatch: descriptor says {expected}, header says {got}")]
    MetadataSizeMismatch { expected: u64, got: u64 },
    #[error("manifest parse")]
    ManifestParse(#[source] manifest::DecodeError),
    #[error("manifest validation")]
    ManifestValidate(#[from] manifest::ValidateError),
    #[error("metadata signature required but absent")]
    MetadataSignatureMissing,
    #[error("metadata signature decode")]
    MetadataSignatureDecode(#[source] signature::DecodeError),
    #[error("metadata signature does not match any accepted key")]
    MetadataSignatureMismatch,
    #[error("payload signature required but absent")]
    PayloadSignatureMissing,
    #[error("payload signature decode")]
    PayloadSignatureDecode(#[source] signature::DecodeError),
    #[error("payload signature does not match any accepted key")]
    PayloadSignatureMismatch,
    #[error("payload hash mismatch: expected {expected}, got {got}")]
    PayloadHashMismatch { expected: String, got: String },
    #[error("payload size mismatch: expected {expected}, got {got}")]
    PayloadSizeMismatch { expected: u64, got: u64 },
    #[error("unsupported minor version {0}")]
    UnsupportedMinorVersion(u32),
    #[error("payload type does not match minor version {0}")]
    MismatchedType(u32),
    #[error("payload timestamp {payload} is older than build {build}")]
    Timestamp { payload: i64, build: i64 },
}
