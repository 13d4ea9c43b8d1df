// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dynamic partitions and copy-on-write snapshots.
//!
//! A super partition holds one set of logical partitions per slot,
//! grouped with byte caps. Before an update writes anything, the
//! controller validates the target layout against the caps (half the
//! super partition at most: both slots must coexist) and lays out the
//! target slot. With snapshots enabled, target writes land in a COW
//! overlay keyed over the source slot content, so unchanged blocks read
//! through to the source bytes and a SOURCE_COPY over identical extents
//! becomes a no-op. After the new slot boots successfully the overlays
//! merge into the target base images in the manifest's merge order.
//!
//! On-disk topology under the controller root:
//! `super/<name><suffix>.img` base images, `metadata_target` the target
//! layout record, `snapshots/<name>/{cow.img,bitmap,merge-ops}` overlays,
//! `state` the update cycle, `merge-cursor` merge progress.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use itertools::Itertools;
use log::{info, warn};
use strum::{Display, EnumString};
use thiserror::Error;

use crau::ext::{ReadExt, WriteExt};
use crau::manifest::{Extent, InstallOperation, Manifest, OperationKind};

use crate::block::{BlockDev, FileBlockDev, COPY_SLICE_SIZE};
use crate::boot::Slot;
use crate::error::ErrorCode;
use crate::extents::ExtentRanges;

/// Update cycle of the target slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SnapshotState {
    Idle,
    Prepared,
    Writing,
    Finished,
    Merging,
}

/// One logical partition in a slot's layout
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartitionMeta {
    name: String,
    size: u64,
    group: String,
    snapshotted: bool,
}

/// Target-slot layout, persisted as a record file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Metadata {
    partitions: Vec<PartitionMeta>,
}

impl Metadata {
    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = bytes;
        let count = reader.read_u32()? as usize;
        let mut partitions = Vec::with_capacity(count.min(128));

        for _ in 0..count {
            let name_len = reader.read_u32()? as u64;
            let name = reader.read_string(name_len)?;
            let size = reader.read_u64()?;
            let group_len = reader.read_u32()? as u64;
            let group = reader.read_string(group_len)?;
            let snapshotted = reader.read_u8()? != 0;

            partitions.push(PartitionMeta {
                name,
                size,
                group,
                snapshotted,
            });
        }

        Ok(Self { partitions })
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![];
        bytes.write_u32(self.partitions.len() as u32)?;

        for partition in &self.partitions {
            bytes.write_u32(partition.name.len() as u32)?;
            bytes.write_all(partition.name.as_bytes())?;
            bytes.write_u64(partition.size)?;
            bytes.write_u32(partition.group.len() as u32)?;
            bytes.write_all(partition.group.as_bytes())?;
            bytes.write_u8(partition.snapshotted as u8)?;
        }

        Ok(bytes)
    }

    fn find(&self, name: &str) -> Option<&PartitionMeta> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

/// A block device handed to the executor: either a base image directly,
/// or a snapshot overlay during an in-progress update
pub enum PartitionDevice {
    File(FileBlockDev),
    Cow(CowDevice),
}

impl BlockDev for PartitionDevice {
    fn len(&self) -> u64 {
        match self {
            PartitionDevice::File(dev) => dev.len(),
            PartitionDevice::Cow(dev) => dev.len(),
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            PartitionDevice::File(dev) => dev.read_at(offset, buf),
            PartitionDevice::Cow(dev) => dev.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        match self {
            PartitionDevice::File(dev) => dev.write_at(offset, buf),
            PartitionDevice::Cow(dev) => dev.write_at(offset, buf),
        }
    }

    fn discard(&mut self, offset: u64, length: u64) -> io::Result<bool> {
        match self {
            PartitionDevice::File(dev) => dev.discard(offset, length),
            PartitionDevice::Cow(_) => Ok(false),
        }
    }

    fn discard_zeroes_data(&self) -> bool {
        match self {
            PartitionDevice::File(dev) => dev.discard_zeroes_data(),
            PartitionDevice::Cow(_) => false,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PartitionDevice::File(dev) => dev.flush(),
            PartitionDevice::Cow(dev) => dev.flush(),
        }
    }
}

/// Copy-on-write overlay: written blocks live in the cow file, untouched
/// blocks read through to the source base image, zeros past its end
pub struct CowDevice {
    base: Option<File>,
    base_len: u64,
    cow: File,
    bitmap: Vec<u8>,
    bitmap_path: PathBuf,
    block_size: u64,
    len: u64,
}

impl CowDevice {
    fn open(dir: &Path, base_path: &Path, size: u64, block_size: u32) -> io::Result<Self> {
        let cow_path = dir.join("cow.img");
        let bitmap_path = dir.join("bitmap");
        let blocks = size.div_ceil(block_size as u64) as usize;

        let cow = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&cow_path)?;
        cow.set_len(size)?;

        let bitmap = match std::fs::read(&bitmap_path) {
            Ok(bytes) if bytes.len() == blocks => bytes,
            _ => vec![0u8; blocks],
        };

        let (base, base_len) = match File::open(base_path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                (Some(file), len)
            }
            Err(_) => (None, 0),
        };

        Ok(Self {
            base,
            base_len,
            cow,
            bitmap,
            bitmap_path,
            block_size: block_size as u64,
            len: size,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks currently materialized in the overlay
    pub fn written_blocks(&self) -> u64 {
        self.bitmap.iter().filter(|b| **b != 0).count() as u64
    }

    fn read_base(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset + buf.len() as u64;

        if offset >= self.base_len {
            buf.fill(0);
            return Ok(());
        }

        match &self.base {
            Some(base) if end <= self.base_len => base.read_exact_at(buf, offset),
            Some(base) => {
                let have = (self.base_len - offset) as usize;
                base.read_exact_at(&mut buf[..have], offset)?;
                buf[have..].fill(0);
                Ok(())
            }
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0usize;

        while done < buf.len() {
            let at = offset + done as u64;
            let block = at / self.block_size;
            let within = at % self.block_size;
            let take = ((self.block_size - within) as usize).min(buf.len() - done);

            if self.bitmap[block as usize] != 0 {
                self.cow.read_exact_at(&mut buf[done..done + take], at)?;
            } else {
                self.read_base(at, &mut buf[done..done + take])?;
            }

            done += take;
        }

        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut done = 0usize;

        while done < buf.len() {
            let at = offset + done as u64;
            let block = at / self.block_size;
            let within = at % self.block_size;
            let take = ((self.block_size - within) as usize).min(buf.len() - done);

            // A partial write into an untouched block materializes the
            // source content first
            if self.bitmap[block as usize] == 0 && (take as u64) < self.block_size {
                let mut original = vec![0u8; self.block_size as usize];
                self.read_base(block * self.block_size, &mut original)?;
                self.cow.write_all_at(&original, block * self.block_size)?;
            }

            self.cow.write_all_at(&buf[done..done + take], at)?;
            self.bitmap[block as usize] = 1;

            done += take;
        }

        Ok(())
    }

    /// Persist data and the block bitmap so a restart resumes the overlay
    pub fn flush(&mut self) -> io::Result<()> {
        self.cow.sync_data()?;
        std::fs::write(&self.bitmap_path, &self.bitmap)?;
        Ok(())
    }
}

pub struct DynamicPartitionControl {
    root: PathBuf,
    super_size: u64,
    block_size: u32,
    /// Virtual A/B: snapshots available. Retrofit devices run with plain
    /// target block devices and no copy-on-write.
    vabc: bool,
    state: SnapshotState,
    metadata: Metadata,
}

impl DynamicPartitionControl {
    pub fn open(root: impl Into<PathBuf>, super_size: u64, block_size: u32, vabc: bool) -> Result<Self, Error> {
        let root = root.into();

        std::fs::create_dir_all(root.join("super"))?;
        std::fs::create_dir_all(root.join("snapshots"))?;

        let state = match std::fs::read_to_string(root.join("state")) {
            Ok(value) => SnapshotState::from_str(value.trim()).unwrap_or(SnapshotState::Idle),
            Err(_) => SnapshotState::Idle,
        };

        let mut ctl = Self {
            root,
            super_size,
            block_size,
            vabc,
            state,
            metadata: Metadata::default(),
        };

        if ctl.state != SnapshotState::Idle {
            match ctl.load_metadata() {
                Ok(metadata) => ctl.metadata = metadata,
                Err(error) => {
                    // Unusable target layout: unmap everything and force a
                    // restart from zero
                    warn!("target metadata unreadable ({error}), discarding in-flight update");
                    ctl.reset()?;
                }
            }
        }

        Ok(ctl)
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.vabc
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata_target")
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state")
    }

    fn cursor_path(&self) -> PathBuf {
        self.root.join("merge-cursor")
    }

    fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.root.join("snapshots").join(name)
    }

    fn image_path(&self, name: &str, slot: Slot) -> PathBuf {
        self.root.join("super").join(format!("{name}{}.img", slot.suffix()))
    }

    fn set_state(&mut self, state: SnapshotState) -> Result<(), Error> {
        std::fs::write(self.state_path(), state.to_string())?;
        self.state = state;
        Ok(())
    }

    fn load_metadata(&self) -> Result<Metadata, Error> {
        let bytes = std::fs::read(self.metadata_path())?;
        Metadata::decode(&bytes)
    }

    fn reset(&mut self) -> Result<(), Error> {
        let snapshots = self.root.join("snapshots");
        if snapshots.exists() {
            std::fs::remove_dir_all(&snapshots)?;
            std::fs::create_dir_all(&snapshots)?;
        }

        let _ = std::fs::remove_file(self.metadata_path());
        let _ = std::fs::remove_file(self.cursor_path());
        self.metadata = Metadata::default();
        self.set_state(SnapshotState::Idle)
    }

    /// Validate and lay out the target slot for `manifest`. Group sums
    /// must fit their caps, and everything must fit half the super
    /// partition unless the caller allows consuming the source slot.
    /// Returns the total bytes the target slot requires.
    pub fn prepare_partitions_for_update(
        &mut self,
        source_slot: Slot,
        target_slot: Slot,
        manifest: &Manifest,
        delete_source: bool,
    ) -> Result<u64, Error> {
        if !matches!(self.state, SnapshotState::Idle | SnapshotState::Prepared) {
            return Err(Error::BadState {
                state: self.state,
                operation: "prepare",
            });
        }

        let block = self.block_size as u64;
        let budget = if delete_source {
            self.super_size
        } else {
            self.super_size / 2
        };

        let snapshot = self.vabc && manifest.snapshot_enabled();

        let mut metadata = Metadata::default();
        let mut total = 0u64;

        for partition in &manifest.partitions {
            let size = partition.new_partition_info.size.next_multiple_of(block);
            total += size;

            let group = manifest
                .dynamic_partition_metadata
                .as_ref()
                .and_then(|dynamic| {
                    dynamic
                        .groups
                        .iter()
                        .find(|g| g.partition_names.iter().any(|n| *n == partition.partition_name))
                })
                .map(|g| g.name.clone())
                .unwrap_or_else(|| "default".to_owned());

            metadata.partitions.push(PartitionMeta {
                name: partition.partition_name.clone(),
                size,
                group,
                snapshotted: snapshot,
            });
        }

        if let Some(dynamic) = &manifest.dynamic_partition_metadata {
            let by_group = metadata
                .partitions
                .iter()
                .map(|p| (p.group.clone(), p.size))
                .into_group_map();

            for group in &dynamic.groups {
                let used: u64 = by_group.get(&group.name).map(|sizes| sizes.iter().sum()).unwrap_or(0);

                if used > group.size {
                    return Err(Error::GroupOverCap {
                        group: group.name.clone(),
                        used,
                        cap: group.size,
                    });
                }

                if group.size > budget {
                    return Err(Error::NotEnoughSpace {
                        required: group.size,
                        available: budget,
                    });
                }
            }
        }

        if total > budget {
            return Err(Error::NotEnoughSpace {
                required: total,
                available: budget,
            });
        }

        // Lay the target slot out: base images sized, overlays created
        for partition in &metadata.partitions {
            let image = self.image_path(&partition.name, target_slot);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&image)?;
            file.set_len(partition.size)?;

            if partition.snapshotted {
                let dir = self.snapshot_dir(&partition.name);
                std::fs::create_dir_all(&dir)?;

                let source_image = self.image_path(&partition.name, source_slot);
                // Instantiate overlay files now so resume finds them
                CowDevice::open(&dir, &source_image, partition.size, self.block_size)?.flush()?;

                let merge_ops = manifest
                    .partitions
                    .iter()
                    .find(|p| p.partition_name == partition.name)
                    .map(|p| p.merge_operations.as_slice())
                    .unwrap_or_default();
                write_merge_ops(&dir.join("merge-ops"), merge_ops)?;
            }
        }

        std::fs::write(self.metadata_path(), metadata.encode()?)?;
        self.metadata = metadata;
        self.set_state(SnapshotState::Prepared)?;

        info!(
            "target slot {target_slot} prepared: {} partitions, {total} bytes",
            self.metadata.partitions.len()
        );

        Ok(total)
    }

    /// First target write is about to happen
    pub fn start_writing(&mut self) -> Result<(), Error> {
        if !matches!(self.state, SnapshotState::Prepared | SnapshotState::Writing) {
            return Err(Error::BadState {
                state: self.state,
                operation: "start_writing",
            });
        }
        self.set_state(SnapshotState::Writing)
    }

    /// A device for `name` in `slot`. Reads of the current slot go to its
    /// base image; the in-update target resolves to its snapshot overlay
    /// when one exists.
    pub fn get_partition_device(
        &self,
        name: &str,
        slot: Slot,
        current_slot: Slot,
    ) -> Result<PartitionDevice, Error> {
        let updating = matches!(
            self.state,
            SnapshotState::Prepared | SnapshotState::Writing | SnapshotState::Finished
        );

        if slot != current_slot && updating {
            let meta = self.metadata.find(name).ok_or_else(|| Error::UnknownPartition(name.to_owned()))?;

            if meta.snapshotted {
                let dir = self.snapshot_dir(name);
                let source_image = self.image_path(name, current_slot);
                let cow = CowDevice::open(&dir, &source_image, meta.size, self.block_size)?;
                return Ok(PartitionDevice::Cow(cow));
            }
        }

        let path = self.image_path(name, slot);
        if !path.exists() {
            return Err(Error::UnknownPartition(name.to_owned()));
        }

        Ok(PartitionDevice::File(FileBlockDev::open(path).map_err(|e| Error::Device(name.to_owned(), e))?))
    }

    /// With snapshots active, an identity SOURCE_COPY is already
    /// virtualized by the overlay: return it with empty extents so the
    /// executor skips it. Retrofit devices get no optimization.
    pub fn optimize_operation(&self, name: &str, op: &InstallOperation) -> InstallOperation {
        let snapshotted = self.metadata.find(name).map(|m| m.snapshotted).unwrap_or(false);

        if snapshotted && op.kind == OperationKind::SourceCopy && op.src_extents == op.dst_extents {
            let mut optimized = op.clone();
            optimized.src_extents = vec![];
            optimized.dst_extents = vec![];
            return optimized;
        }

        op.clone()
    }

    /// Commit snapshot state so the bootloader may switch slots
    pub fn finish_update(&mut self) -> Result<(), Error> {
        if self.state != SnapshotState::Writing {
            return Err(Error::BadState {
                state: self.state,
                operation: "finish_update",
            });
        }
        self.set_state(SnapshotState::Finished)
    }

    /// Abandon the in-flight update and return the target slot to idle
    pub fn cancel_update(&mut self) -> Result<(), Error> {
        self.reset()
    }

    /// Collapse overlays into the target base images, in the merge order
    /// recorded at prepare time. Idempotent and resumable: progress is
    /// tracked per partition and a re-run of a partition merge rewrites
    /// the same bytes.
    pub fn merge_snapshots(&mut self, target_slot: Slot, source_slot: Slot) -> Result<(), Error> {
        if !matches!(self.state, SnapshotState::Finished | SnapshotState::Merging) {
            return Err(Error::BadState {
                state: self.state,
                operation: "merge_snapshots",
            });
        }

        self.set_state(SnapshotState::Merging)?;

        let cursor: usize = std::fs::read_to_string(self.cursor_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let partitions = self.metadata.partitions.clone();

        for (index, partition) in partitions.iter().enumerate().skip(cursor) {
            if partition.snapshotted {
                self.merge_partition(partition, target_slot, source_slot)?;
            }

            std::fs::write(self.cursor_path(), (index + 1).to_string())?;
        }

        self.reset()?;
        info!("snapshot merge complete");

        Ok(())
    }

    fn merge_partition(
        &self,
        partition: &PartitionMeta,
        target_slot: Slot,
        source_slot: Slot,
    ) -> Result<(), Error> {
        let dir = self.snapshot_dir(&partition.name);
        let source_image = self.image_path(&partition.name, source_slot);
        let cow = CowDevice::open(&dir, &source_image, partition.size, self.block_size)?;

        let mut target = FileBlockDev::open(self.image_path(&partition.name, target_slot))
            .map_err(|e| Error::Device(partition.name.clone(), e))?;

        let merge_ops = read_merge_ops(&dir.join("merge-ops")).unwrap_or_default();
        let block = self.block_size as u64;
        let blocks = partition.size.div_ceil(block);

        // Merge-order extents first, then the remainder of the partition.
        // Every pass reads through the overlay, so re-running a partition
        // merge rewrites identical bytes.
        let mut buf = vec![0u8; COPY_SLICE_SIZE];
        let mut copy_range = |cow: &CowDevice, target: &mut FileBlockDev, begin: u64, end: u64| -> Result<(), Error> {
            let mut offset = begin;
            while offset < end {
                let take = (end - offset).min(COPY_SLICE_SIZE as u64) as usize;
                cow.read_at(offset, &mut buf[..take])?;
                target.write_at(offset, &buf[..take])?;
                offset += take as u64;
            }
            Ok(())
        };

        let mut remaining = ExtentRanges::new();
        remaining.add_extent(Extent::new(0, blocks));

        for op in &merge_ops {
            let begin = op.dst_extent.start_block * block;
            let end = (op.dst_extent.end_block() * block).min(partition.size);
            copy_range(&cow, &mut target, begin, end)?;
            remaining.subtract_extent(op.dst_extent);
        }

        for extent in remaining.iter().copied().collect::<Vec<_>>() {
            let begin = extent.start_block * block;
            let end = (extent.end_block() * block).min(partition.size);
            copy_range(&cow, &mut target, begin, end)?;
        }

        target.flush()?;

        info!("merged snapshot for {}", partition.name);

        Ok(())
    }
}

/// Merge order on disk: src/dst extent pairs, count-prefixed
fn write_merge_ops(path: &Path, ops: &[crau::manifest::CowMergeOperation]) -> Result<(), Error> {
    let mut bytes = vec![];
    bytes.write_u32(ops.len() as u32)?;

    for op in ops {
        bytes.write_u64(op.src_extent.start_block)?;
        bytes.write_u64(op.src_extent.num_blocks)?;
        bytes.write_u64(op.dst_extent.start_block)?;
        bytes.write_u64(op.dst_extent.num_blocks)?;
    }

    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_merge_ops(path: &Path) -> Result<Vec<crau::manifest::CowMergeOperation>, Error> {
    let bytes = std::fs::read(path)?;
    let mut reader = bytes.as_slice();

    let count = reader.read_u32()? as usize;
    let mut ops = Vec::with_capacity(count.min(1024));

    for _ in 0..count {
        let src = Extent::new(reader.read_u64()?, reader.read_u64()?);
        let dst = Extent::new(reader.read_u64()?, reader.read_u64()?);
        ops.push(crau::manifest::CowMergeOperation {
            src_extent: src,
            dst_extent: dst,
        });
    }

    Ok(ops)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} not allowed in state {state}")]
    BadState {
        state: SnapshotState,
        operation: &'static str,
    },
    #[error("group {group} needs {used} bytes, cap is {cap}")]
    GroupOverCap { group: String, used: u64, cap: u64 },
    #[error("need {required} bytes, {available} available")]
    NotEnoughSpace { required: u64, available: u64 },
    #[error("unknown partition {0}")]
    UnknownPartition(String),
    #[error("device for {0}")]
    Device(String, #[source] crate::block::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Error::GroupOverCap { .. } | Error::NotEnoughSpace { .. } => ErrorCode::NotEnoughSpace,
            Error::UnknownPartition(_) | Error::Device(..) => ErrorCode::InstallDeviceOpenError,
            Error::BadState { .. } => ErrorCode::DeviceCorrupted,
            Error::Io(_) => ErrorCode::InstallDeviceOpenError,
        }
    }
}
