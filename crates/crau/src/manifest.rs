// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The manifest record codec.
//!
//! The manifest is a count-prefixed sequence of fixed-layout records in
//! network byte order. Optional fields carry a presence byte; repeated
//! fields a u32 count. [`Manifest::validate`] enforces the structural
//! invariants the rest of the pipeline relies on, most importantly the
//! strictly increasing `data_offset` across every operation emitted.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ext::{ReadExt, WriteExt};

/// A half-open block range within a partition
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Self { start_block, num_blocks }
    }

    /// One past the last block covered
    pub fn end_block(&self) -> u64 {
        self.start_block + self.num_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }
}

/// Total block count over a list of extents
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OperationKind {
    /// Blob is the raw bytes of the destination extents
    Replace = 0,
    /// Blob is bzip2-compressed destination bytes
    ReplaceBz = 1,
    /// Blob is xz-compressed destination bytes
    ReplaceXz = 2,
    /// No blob; destination blocks become zero
    Zero = 3,
    /// No blob; destination blocks are trimmed (zero where trim is unreliable)
    Discard = 4,
    /// No blob; source extents copied to destination extents
    SourceCopy = 5,
    /// Blob is a bsdiff patch with brotli-compressed streams
    BrotliBsdiff = 6,
    /// Blob is a puffin patch (recognized, not executed)
    Puffdiff = 7,
    /// Blob is a zucchini patch (recognized, not executed)
    Zucchini = 8,
    /// Blob is an lz4diff patch (recognized, not executed)
    Lz4diff = 9,
}

impl OperationKind {
    /// Whether the operation references bytes in the data-blob region
    pub fn has_blob(&self) -> bool {
        !matches!(self, OperationKind::Zero | OperationKind::Discard | OperationKind::SourceCopy)
    }

    /// Whether the operation reads from the source partition
    pub fn reads_source(&self) -> bool {
        matches!(
            self,
            OperationKind::SourceCopy
                | OperationKind::BrotliBsdiff
                | OperationKind::Puffdiff
                | OperationKind::Zucchini
                | OperationKind::Lz4diff
        )
    }
}

/// One unit of transformation from source blocks to target blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOperation {
    pub kind: OperationKind,
    /// Offset of the blob within the data-blob region
    pub data_offset: Option<u64>,
    pub data_length: Option<u64>,
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// SHA-256 of the referenced blob bytes
    pub data_sha256: Option<[u8; 32]>,
    /// SHA-256 of the source extent bytes, verified before patching
    pub src_sha256: Option<[u8; 32]>,
}

impl InstallOperation {
    /// Blob length, zero for operations without one
    pub fn blob_length(&self) -> u64 {
        self.data_length.unwrap_or(0)
    }
}

/// Size and hash of a whole partition image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub size: u64,
    pub hash: [u8; 32],
}

/// Hash algorithm for the verity tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum HashAlgorithm {
    #[strum(serialize = "sha256")]
    Sha256,
}

/// Per-partition verity layout: where the hash tree and FEC data live and
/// which region of the partition they cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityConfig {
    pub hash_tree_algorithm: HashAlgorithm,
    pub hash_tree_data_extent: Extent,
    pub hash_tree_extent: Extent,
    pub hash_tree_salt: Vec<u8>,
    pub fec_data_extent: Extent,
    pub fec_extent: Extent,
    pub fec_roots: u32,
}

impl VerityConfig {
    /// True when a hash tree is configured
    pub fn has_hash_tree(&self) -> bool {
        !self.hash_tree_extent.is_empty()
    }

    /// True when FEC parity is configured
    pub fn has_fec(&self) -> bool {
        !self.fec_extent.is_empty()
    }
}

/// Snapshot merge ordering hint for one target extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowMergeOperation {
    pub src_extent: Extent,
    pub dst_extent: Extent,
}

/// Postinstall program to run against the updated partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Postinstall {
    pub path: String,
    pub optional: bool,
}

/// All the updates for one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdate {
    pub partition_name: String,
    /// Present for delta payloads; absent for full payloads
    pub old_partition_info: Option<PartitionInfo>,
    pub new_partition_info: PartitionInfo,
    pub operations: Vec<InstallOperation>,
    /// Snapshot merge order; empty when snapshots are not in play
    pub merge_operations: Vec<CowMergeOperation>,
    pub verity: Option<VerityConfig>,
    pub postinstall: Option<Postinstall>,
}

impl PartitionUpdate {
    /// Whether any operation consumes source-partition data
    pub fn is_delta(&self) -> bool {
        self.operations.iter().any(|op| op.kind.reads_source())
    }
}

/// Sizing contract for one group of dynamic partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPartitionGroup {
    pub name: String,
    /// Maximum byte size the group's partitions may sum to
    pub size: u64,
    pub partition_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPartitionMetadata {
    pub groups: Vec<DynamicPartitionGroup>,
    pub snapshot_enabled: bool,
}

/// Version metadata for an updated APEX package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApexInfo {
    pub package_name: String,
    pub version: i64,
    pub is_compressed: bool,
    pub decompressed_size: u64,
}

/// The structured metadata preceding the data blobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Power of two, typically 4096
    pub block_size: u32,
    pub minor_version: u32,
    /// Refuse payloads older than the running build when set
    pub max_timestamp: Option<i64>,
    pub partitions: Vec<PartitionUpdate>,
    /// Offset of the payload signature blob relative to the data region
    pub signatures_offset: Option<u64>,
    pub signatures_size: Option<u64>,
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
    pub apex_info: Vec<ApexInfo>,
}

impl Manifest {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = bytes;
        let manifest = Self::decode_reader(&mut reader)?;

        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.len()));
        }

        Ok(manifest)
    }

    fn decode_reader<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let block_size = reader.read_u32()?;
        let minor_version = reader.read_u32()?;
        let max_timestamp = decode_option(reader, |r| Ok(r.read_i64()?))?;
        let partitions = decode_records(reader)?;
        let signatures_offset = decode_option(reader, |r| Ok(r.read_u64()?))?;
        let signatures_size = decode_option(reader, |r| Ok(r.read_u64()?))?;
        let dynamic_partition_metadata = decode_option(reader, DynamicPartitionMetadata::decode)?;
        let apex_info = decode_records(reader)?;

        Ok(Self {
            block_size,
            minor_version,
            max_timestamp,
            partitions,
            signatures_offset,
            signatures_size,
            dynamic_partition_metadata,
            apex_info,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32(self.block_size)?;
        writer.write_u32(self.minor_version)?;
        encode_option(writer, &self.max_timestamp, |w, v| Ok(w.write_i64(*v)?))?;
        encode_records(writer, &self.partitions)?;
        encode_option(writer, &self.signatures_offset, |w, v| Ok(w.write_u64(*v)?))?;
        encode_option(writer, &self.signatures_size, |w, v| Ok(w.write_u64(*v)?))?;
        encode_option(writer, &self.dynamic_partition_metadata, |w, v| v.encode(w))?;
        encode_records(writer, &self.apex_info)?;

        Ok(())
    }

    pub fn encode_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = vec![];
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Structural validation applied once the manifest is decoded and its
    /// signature checked. Verifies the block size, the monotonic
    /// `data_offset` ordering across all partitions, per-operation extent
    /// accounting against declared partition sizes, and that the payload
    /// signature blob sits at the end of the data region.
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ValidateError::BadBlockSize(self.block_size));
        }

        let block_size = self.block_size as u64;
        let mut next_data_offset = 0u64;

        for partition in &self.partitions {
            let name = &partition.partition_name;
            let new_blocks = partition.new_partition_info.size.div_ceil(block_size);

            for op in &partition.operations {
                match (op.data_offset, op.data_length) {
                    (Some(offset), Some(length)) => {
                        if !op.kind.has_blob() {
                            return Err(ValidateError::UnexpectedBlob(name.clone(), op.kind));
                        }
                        if offset != next_data_offset {
                            return Err(ValidateError::NonMonotonicDataOffset {
                                partition: name.clone(),
                                expected: next_data_offset,
                                got: offset,
                            });
                        }
                        if length == 0 {
                            return Err(ValidateError::EmptyBlob(name.clone()));
                        }
                        next_data_offset += length;
                    }
                    (None, None) => {
                        if op.kind.has_blob() {
                            return Err(ValidateError::MissingBlob(name.clone(), op.kind));
                        }
                    }
                    _ => return Err(ValidateError::PartialBlobFields(name.clone())),
                }

                if op.dst_extents.is_empty() {
                    return Err(ValidateError::NoDestination(name.clone()));
                }

                for extent in op.dst_extents.iter() {
                    if extent.end_block() > new_blocks {
                        return Err(ValidateError::ExtentOutOfRange {
                            partition: name.clone(),
                            extent: *extent,
                            blocks: new_blocks,
                        });
                    }
                }

                if op.kind.reads_source() && op.src_extents.is_empty() {
                    return Err(ValidateError::NoSource(name.clone(), op.kind));
                }

                // Copies move whole blocks; both sides must agree
                if op.kind == OperationKind::SourceCopy
                    && total_blocks(&op.src_extents) != total_blocks(&op.dst_extents)
                {
                    return Err(ValidateError::SourceCopyMismatch(name.clone()));
                }
            }
        }

        match (self.signatures_offset, self.signatures_size) {
            (Some(offset), Some(size)) => {
                if offset != next_data_offset || size == 0 {
                    return Err(ValidateError::SignatureRegion {
                        expected: next_data_offset,
                        offset,
                        size,
                    });
                }
            }
            (None, None) => {}
            _ => {
                return Err(ValidateError::SignatureRegion {
                    expected: next_data_offset,
                    offset: self.signatures_offset.unwrap_or_default(),
                    size: self.signatures_size.unwrap_or_default(),
                })
            }
        }

        Ok(())
    }

    /// Total bytes occupied by operation blobs, excluding the signature blob
    pub fn data_blobs_size(&self) -> u64 {
        self.partitions
            .iter()
            .flat_map(|p| &p.operations)
            .map(InstallOperation::blob_length)
            .sum()
    }

    /// A payload is full when no operation consumes source data
    pub fn is_full(&self) -> bool {
        !self.partitions.iter().any(PartitionUpdate::is_delta)
    }

    /// Whether the target should be built under copy-on-write snapshots
    pub fn snapshot_enabled(&self) -> bool {
        self.dynamic_partition_metadata
            .as_ref()
            .map(|m| m.snapshot_enabled)
            .unwrap_or_default()
    }
}

pub(crate) trait Record: Sized {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;
}

fn decode_records<T: Record, R: Read>(reader: &mut R) -> Result<Vec<T>, DecodeError> {
    let num_records = reader.read_u32()? as usize;
    let mut records = Vec::with_capacity(num_records.min(4096));

    for _ in 0..num_records {
        records.push(T::decode(reader)?);
    }

    Ok(records)
}

fn encode_records<T: Record, W: Write>(writer: &mut W, records: &[T]) -> Result<(), EncodeError> {
    writer.write_u32(records.len() as u32)?;
    for record in records {
        record.encode(writer)?;
    }
    Ok(())
}

fn decode_option<T, R: Read>(
    reader: &mut R,
    decode: impl FnOnce(&mut R) -> Result<T, DecodeError>,
) -> Result<Option<T>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(decode(reader)?)),
        b => Err(DecodeError::BadPresenceByte(b)),
    }
}

fn encode_option<T, W: Write>(
    writer: &mut W,
    value: &Option<T>,
    encode: impl FnOnce(&mut W, &T) -> Result<(), EncodeError>,
) -> Result<(), EncodeError> {
    match value {
        None => Ok(writer.write_u8(0)?),
        Some(value) => {
            writer.write_u8(1)?;
            encode(writer, value)
        }
    }
}

fn decode_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let length = reader.read_u32()? as u64;
    Ok(reader.read_string(length)?)
}

fn encode_string<W: Write>(writer: &mut W, value: &str) -> Result<(), EncodeError> {
    writer.write_u32(value.len() as u32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

impl Record for Extent {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let start_block = reader.read_u64()?;
        let num_blocks = reader.read_u64()?;
        Ok(Self { start_block, num_blocks })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64(self.start_block)?;
        writer.write_u64(self.num_blocks)?;
        Ok(())
    }
}

impl Record for PartitionInfo {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let size = reader.read_u64()?;
        let hash = reader.read_array()?;
        Ok(Self { size, hash })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64(self.size)?;
        writer.write_array(self.hash)?;
        Ok(())
    }
}

impl Record for InstallOperation {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let kind = match reader.read_u8()? {
            0 => OperationKind::Replace,
            1 => OperationKind::ReplaceBz,
            2 => OperationKind::ReplaceXz,
            3 => OperationKind::Zero,
            4 => OperationKind::Discard,
            5 => OperationKind::SourceCopy,
            6 => OperationKind::BrotliBsdiff,
            7 => OperationKind::Puffdiff,
            8 => OperationKind::Zucchini,
            9 => OperationKind::Lz4diff,
            k => return Err(DecodeError::UnknownOperation(k)),
        };

        let data_offset = decode_option(reader, |r| Ok(r.read_u64()?))?;
        let data_length = decode_option(reader, |r| Ok(r.read_u64()?))?;
        let src_extents = decode_records(reader)?;
        let dst_extents = decode_records(reader)?;
        let data_sha256 = decode_option(reader, |r| Ok(r.read_array()?))?;
        let src_sha256 = decode_option(reader, |r| Ok(r.read_array()?))?;

        Ok(Self {
            kind,
            data_offset,
            data_length,
            src_extents,
            dst_extents,
            data_sha256,
            src_sha256,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.kind as u8)?;
        encode_option(writer, &self.data_offset, |w, v| Ok(w.write_u64(*v)?))?;
        encode_option(writer, &self.data_length, |w, v| Ok(w.write_u64(*v)?))?;
        encode_records(writer, &self.src_extents)?;
        encode_records(writer, &self.dst_extents)?;
        encode_option(writer, &self.data_sha256, |w, v| Ok(w.write_array(*v)?))?;
        encode_option(writer, &self.src_sha256, |w, v| Ok(w.write_array(*v)?))?;
        Ok(())
    }
}

impl Record for CowMergeOperation {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let src_extent = Extent::decode(reader)?;
        let dst_extent = Extent::decode(reader)?;
        Ok(Self { src_extent, dst_extent })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.src_extent.encode(writer)?;
        self.dst_extent.encode(writer)?;
        Ok(())
    }
}

impl Record for VerityConfig {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let hash_tree_algorithm = match reader.read_u8()? {
            0 => HashAlgorithm::Sha256,
            a => return Err(DecodeError::UnknownHashAlgorithm(a)),
        };
        let hash_tree_data_extent = Extent::decode(reader)?;
        let hash_tree_extent = Extent::decode(reader)?;
        let salt_len = reader.read_u32()? as usize;
        let hash_tree_salt = reader.read_vec(salt_len)?;
        let fec_data_extent = Extent::decode(reader)?;
        let fec_extent = Extent::decode(reader)?;
        let fec_roots = reader.read_u32()?;

        Ok(Self {
            hash_tree_algorithm,
            hash_tree_data_extent,
            hash_tree_extent,
            hash_tree_salt,
            fec_data_extent,
            fec_extent,
            fec_roots,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.hash_tree_algorithm as u8)?;
        self.hash_tree_data_extent.encode(writer)?;
        self.hash_tree_extent.encode(writer)?;
        writer.write_u32(self.hash_tree_salt.len() as u32)?;
        writer.write_all(&self.hash_tree_salt)?;
        self.fec_data_extent.encode(writer)?;
        self.fec_extent.encode(writer)?;
        writer.write_u32(self.fec_roots)?;
        Ok(())
    }
}

impl Record for Postinstall {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let path = decode_string(reader)?;
        let optional = reader.read_u8()? != 0;
        Ok(Self { path, optional })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_string(writer, &self.path)?;
        writer.write_u8(self.optional as u8)?;
        Ok(())
    }
}

impl Record for PartitionUpdate {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let partition_name = decode_string(reader)?;
        let old_partition_info = decode_option(reader, PartitionInfo::decode)?;
        let new_partition_info = PartitionInfo::decode(reader)?;
        let operations = decode_records(reader)?;
        let merge_operations = decode_records(reader)?;
        let verity = decode_option(reader, VerityConfig::decode)?;
        let postinstall = decode_option(reader, Postinstall::decode)?;

        Ok(Self {
            partition_name,
            old_partition_info,
            new_partition_info,
            operations,
            merge_operations,
            verity,
            postinstall,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_string(writer, &self.partition_name)?;
        encode_option(writer, &self.old_partition_info, |w, v| v.encode(w))?;
        self.new_partition_info.encode(writer)?;
        encode_records(writer, &self.operations)?;
        encode_records(writer, &self.merge_operations)?;
        encode_option(writer, &self.verity, |w, v| v.encode(w))?;
        encode_option(writer, &self.postinstall, |w, v| v.encode(w))?;
        Ok(())
    }
}

impl Record for DynamicPartitionGroup {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let name = decode_string(reader)?;
        let size = reader.read_u64()?;
        let num_names = reader.read_u32()? as usize;
        let mut partition_names = Vec::with_capacity(num_names.min(256));
        for _ in 0..num_names {
            partition_names.push(decode_string(reader)?);
        }
        Ok(Self {
            name,
            size,
            partition_names,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_string(writer, &self.name)?;
        writer.write_u64(self.size)?;
        writer.write_u32(self.partition_names.len() as u32)?;
        for name in &self.partition_names {
            encode_string(writer, name)?;
        }
        Ok(())
    }
}

impl DynamicPartitionMetadata {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let groups = decode_records(reader)?;
        let snapshot_enabled = reader.read_u8()? != 0;
        Ok(Self { groups, snapshot_enabled })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_records(writer, &self.groups)?;
        writer.write_u8(self.snapshot_enabled as u8)?;
        Ok(())
    }
}

impl Record for ApexInfo {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let package_name = decode_string(reader)?;
        let version = reader.read_i64()?;
        let is_compressed = reader.read_u8()? != 0;
        let decompressed_size = reader.read_u64()?;
        Ok(Self {
            package_name,
            version,
            is_compressed,
            decompressed_size,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_string(writer, &self.package_name)?;
        writer.write_i64(self.version)?;
        writer.write_u8(self.is_compressed as u8)?;
        writer.write_u64(self.decompressed_size)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unknown operation type: {0}")]
    UnknownOperation(u8),
    #[error("Unknown hash algorithm: {0}")]
    UnknownHashAlgorithm(u8),
    #[error("Invalid presence byte: {0}")]
    BadPresenceByte(u8),
    #[error("{0} trailing bytes after manifest")]
    TrailingBytes(usize),
    #[error("io")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("io")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("Block size {0} is not a power of two")]
    BadBlockSize(u32),
    #[error("{partition}: data offset {got} out of order, expected {expected}")]
    NonMonotonicDataOffset {
        partition: String,
        expected: u64,
        got: u64,
    },
    #[error("{0}: operation {1} carries a blob but takes none")]
    UnexpectedBlob(String, OperationKind),
    #[error("{0}: operation {1} requires a blob")]
    MissingBlob(String, OperationKind),
    #[error("{0}: zero-length blob")]
    EmptyBlob(String),
    #[error("{0}: data offset and length must be set together")]
    PartialBlobFields(String),
    #[error("{0}: operation has no destination extents")]
    NoDestination(String),
    #[error("{0}: operation {1} has no source extents")]
    NoSource(String, OperationKind),
    #[error("{0}: source and destination block counts differ for copy")]
    SourceCopyMismatch(String),
    #[error("{partition}: extent {extent:?} exceeds partition of {blocks} blocks")]
    ExtentOutOfRange {
        partition: String,
        extent: Extent,
        blocks: u64,
    },
    #[error("signature region mismatch: expected offset {expected}, got offset {offset} size {size}")]
    SignatureRegion { expected: u64, offset: u64, size: u64 },
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            block_size: 4096,
            minor_version: 0,
            max_timestamp: Some(1700000000),
            partitions: vec![PartitionUpdate {
                partition_name: "system".into(),
                old_partition_info: None,
                new_partition_info: PartitionInfo {
                    size: 8192,
                    hash: [0xab; 32],
                },
                operations: vec![InstallOperation {
                    kind: OperationKind::Replace,
                    data_offset: Some(0),
                    data_length: Some(8192),
                    src_extents: vec![],
                    dst_extents: vec![Extent::new(0, 2)],
                    data_sha256: Some([0xcd; 32]),
                    src_sha256: None,
                }],
                merge_operations: vec![],
                verity: None,
                postinstall: Some(Postinstall {
                    path: "postinstall".into(),
                    optional: true,
                }),
            }],
            signatures_offset: Some(8192),
            signatures_size: Some(267),
            dynamic_partition_metadata: Some(DynamicPartitionMetadata {
                groups: vec![DynamicPartitionGroup {
                    name: "group_foo".into(),
                    size: 1 << 20,
                    partition_names: vec!["system".into()],
                }],
                snapshot_enabled: true,
            }),
            apex_info: vec![ApexInfo {
                package_name: "com.example.apex".into(),
                version: 3,
                is_compressed: false,
                decompressed_size: 0,
            }],
        }
    }

    #[test]
    fn roundtrip() {
        let manifest = sample_manifest();
        let bytes = manifest.encode_vec().unwrap();
        let decoded = Manifest::decode(&bytes).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn validate_accepts_sample() {
        sample_manifest().validate().unwrap();
    }

    #[test]
    fn validate_rejects_gap_in_data_offsets() {
        let mut manifest = sample_manifest();
        manifest.partitions[0].operations[0].data_offset = Some(4096);

        assert!(matches!(
            manifest.validate(),
            Err(ValidateError::NonMonotonicDataOffset { .. })
        ));
    }

    #[test]
    fn validate_rejects_extent_past_partition_end() {
        let mut manifest = sample_manifest();
        manifest.partitions[0].operations[0].dst_extents = vec![Extent::new(1, 2)];

        assert!(matches!(
            manifest.validate(),
            Err(ValidateError::ExtentOutOfRange { .. })
        ));
    }

    #[test]
    fn validate_rejects_signature_region_gap() {
        let mut manifest = sample_manifest();
        manifest.signatures_offset = Some(4096);

        assert!(matches!(
            manifest.validate(),
            Err(ValidateError::SignatureRegion { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample_manifest().encode_vec().unwrap();
        bytes.push(0);

        assert!(matches!(
            Manifest::decode(&bytes),
            Err(DecodeError::TrailingBytes(1))
        ));
    }
}
