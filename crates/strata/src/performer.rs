// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The delta performer: one state machine driving the whole apply.
//!
//! Payload chunks arrive through [`DeltaPerformer::write_bytes`]; the
//! parser surfaces validated metadata, then operations in manifest
//! order. Each operation is optimized by the snapshot controller,
//! executed, fed to the partition's verity writer, flushed, and only
//! then checkpointed inside a preference-store transaction, so a crash
//! at any point re-attempts at most one operation. Once the stream
//! completes, verity finalize runs in bounded slices, partition hashes
//! are verified against the manifest, postinstall programs run, the
//! snapshot state commits, and the bootloader is pointed at the new
//! slot.
//!
//! Cancellation sets a flag observed at every suspension point: chunk
//! boundaries, operation boundaries, and verity slices. The checkpoint
//! reflects only fully applied operations, so a cancelled update resumes
//! exactly where it stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use crau::manifest::{Manifest, Postinstall};
use crau::read::{Event, Options, StreamParser};
use prefs::Prefs;

use crate::block::{hash_device, read_extents, BlockDev};
use crate::boot::{self, BootControl, Slot};
use crate::checkpoint::{self, Checkpoint, UpdateState, KEY_UPDATE_STATE};
use crate::descriptor::UpdateDescriptor;
use crate::error::ErrorCode;
use crate::executor::{self, Executor};
use crate::hardware::{BuildPolicyAdapter, Hardware};
use crate::progress::{ProgressCallback, Stage};
use crate::snapshot::{self, DynamicPartitionControl, PartitionDevice, SnapshotState};
use crate::subprocess::{self, Subprocess};
use crate::verity::{self, VerityWriter};

/// Cap for one postinstall program
const POSTINSTALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Beginning,
    ApplyingOperations,
    Done,
}

/// Everything the performer tracks for one partition while applying
struct PartitionRuntime {
    name: String,
    new_size: u64,
    new_hash: [u8; 32],
    source: Option<PartitionDevice>,
    target: PartitionDevice,
    verity: Option<VerityWriter>,
    postinstall: Option<Postinstall>,
}

pub struct DeltaPerformer {
    descriptor: UpdateDescriptor,
    hardware: Arc<dyn Hardware>,
    boot: Box<dyn BootControl>,
    partitions_ctl: DynamicPartitionControl,
    prefs: Prefs,
    subprocess: Subprocess,
    /// Root the manifest's postinstall paths resolve under; None
    /// disables the postinstall step entirely
    postinstall_root: Option<PathBuf>,
    progress: ProgressCallback,

    parser: StreamParser,
    state: State,
    cancel_requested: bool,

    manifest: Option<Manifest>,
    executor: Option<Executor>,
    partitions: Vec<PartitionRuntime>,

    /// Operations handled so far in global manifest order, skips included
    global_index: usize,
    /// Operations to skip because the checkpoint already covers them
    resume_from: usize,
    /// Running total of consumed blob bytes
    next_data_offset: u64,

    current_slot: Slot,
    target_slot: Slot,
}

impl DeltaPerformer {
    pub fn new(
        descriptor: UpdateDescriptor,
        hardware: Arc<dyn Hardware>,
        boot: Box<dyn BootControl>,
        partitions_ctl: DynamicPartitionControl,
        mut prefs: Prefs,
        subprocess: Subprocess,
        progress: ProgressCallback,
    ) -> Result<Self, Error> {
        let current_slot = boot.current_slot();
        let target_slot = current_slot.other();

        // A stored checkpoint only applies when it belongs to this exact
        // payload; anything else is discarded so the apply starts clean
        let resume_from = match Checkpoint::load(&prefs)? {
            Some(record) if record.payload_hash == descriptor.payload_hash_hex() => {
                info!(
                    "resuming payload {} at operation {}",
                    record.payload_hash, record.next_operation
                );
                record.next_operation as usize
            }
            Some(record) => {
                info!("checkpoint for {} does not match, restarting", record.payload_hash);
                Checkpoint::clear(&mut prefs)?;
                0
            }
            None => 0,
        };

        let options = Options {
            metadata_size: descriptor.metadata_size,
            metadata_signature: descriptor.metadata_signature.clone(),
            ..Options::new(descriptor.payload_size, descriptor.payload_sha256)
        }
        .with_public_keys(descriptor.public_keys.clone());

        let parser = StreamParser::new(options, Arc::new(BuildPolicyAdapter(hardware.clone())));

        Ok(Self {
            descriptor,
            hardware,
            boot,
            partitions_ctl,
            prefs,
            subprocess,
            postinstall_root: None,
            progress,
            parser,
            state: State::Beginning,
            cancel_requested: false,
            manifest: None,
            executor: None,
            partitions: vec![],
            global_index: 0,
            resume_from,
            next_data_offset: 0,
            current_slot,
            target_slot,
        })
    }

    /// Enable the postinstall step, resolving manifest paths under `root`
    pub fn with_postinstall_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.postinstall_root = Some(root.into());
        self
    }

    /// Request a clean abort. Observed at the next suspension point; a
    /// call after completion is a no-op.
    pub fn cancel(&mut self) {
        if self.state != State::Done {
            self.cancel_requested = true;
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one payload chunk. On a fatal error the terminal state is
    /// recorded; cancellation and retryable transport errors leave the
    /// stored progress untouched.
    pub fn write_bytes(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let result = self.write_bytes_inner(chunk);

        if let Err(error) = &result {
            let code = error.to_error_code();
            if code.is_cancel() || code.is_retryable() {
                warn!("apply interrupted: {error} ({code})");
            } else {
                error!("apply failed: {error} ({code})");
                let _ = self.prefs.set_string(KEY_UPDATE_STATE, &UpdateState::Failed.to_string());
            }
        }

        result
    }

    fn write_bytes_inner(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.check_cancel()?;

        let events = self.parser.push(chunk).map_err(Error::Parse)?;

        for event in events {
            match event {
                Event::Metadata => self.on_metadata()?,
                Event::Operation {
                    partition_index,
                    operation_index,
                    blob,
                } => self.on_operation(partition_index, operation_index, blob)?,
                Event::Complete => self.on_complete()?,
            }
        }

        let stage = match self.state {
            State::Beginning => Stage::VerifyingMetadata,
            State::ApplyingOperations => Stage::ApplyingOperations,
            State::Done => Stage::Finalizing,
        };
        (self.progress)(self.parser.bytes_consumed(), self.descriptor.payload_size, stage);

        Ok(())
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if self.cancel_requested {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Metadata validated: arrange target space, open devices, write the
    /// initial checkpoint
    fn on_metadata(&mut self) -> Result<(), Error> {
        let manifest = self.parser.manifest().expect("metadata event").clone();
        let block_size = manifest.block_size;

        self.executor = Some(Executor::new(block_size, self.hardware.is_official_build()));

        // Resuming only works when the snapshot state survived; if the
        // controller lost the overlay, applied operations are gone too
        if self.resume_from > 0 && self.partitions_ctl.state() != SnapshotState::Writing {
            warn!("checkpoint survives but snapshot state does not, restarting from zero");
            Checkpoint::clear(&mut self.prefs)?;
            self.resume_from = 0;
        }

        self.boot
            .mark_slot_unbootable(self.target_slot)
            .map_err(Error::Boot)?;

        if matches!(
            self.partitions_ctl.state(),
            SnapshotState::Idle | SnapshotState::Prepared
        ) {
            self.partitions_ctl
                .prepare_partitions_for_update(self.current_slot, self.target_slot, &manifest, false)
                .map_err(Error::Snapshot)?;
        }
        self.partitions_ctl.start_writing().map_err(Error::Snapshot)?;

        for partition in &manifest.partitions {
            let name = &partition.partition_name;

            let source = match partition.old_partition_info {
                Some(_) => Some(
                    self.partitions_ctl
                        .get_partition_device(name, self.current_slot, self.current_slot)
                        .map_err(Error::Snapshot)?,
                ),
                None => None,
            };

            let target = self
                .partitions_ctl
                .get_partition_device(name, self.target_slot, self.current_slot)
                .map_err(Error::Snapshot)?;

            let verity = match &partition.verity {
                Some(config) if config.has_hash_tree() || config.has_fec() => Some(
                    VerityWriter::new(config.clone(), block_size).map_err(|source| Error::Verity {
                        partition: name.clone(),
                        source,
                    })?,
                ),
                _ => None,
            };

            self.partitions.push(PartitionRuntime {
                name: name.clone(),
                new_size: partition.new_partition_info.size,
                new_hash: partition.new_partition_info.hash,
                source,
                target,
                verity,
                postinstall: partition.postinstall.clone(),
            });
        }

        if self.resume_from == 0 {
            Checkpoint::start(
                self.descriptor.payload_hash_hex(),
                self.parser.header().expect("header parsed").metadata_size() as i64,
            )
            .store(&mut self.prefs)?;
        }

        self.manifest = Some(manifest);
        self.state = State::ApplyingOperations;

        Ok(())
    }

    fn on_operation(
        &mut self,
        partition_index: usize,
        operation_index: usize,
        blob: Vec<u8>,
    ) -> Result<(), Error> {
        self.check_cancel()?;

        let ordinal = self.global_index;
        self.global_index += 1;

        let manifest = self.manifest.as_ref().expect("metadata handled");
        let op = manifest.partitions[partition_index].operations[operation_index].clone();
        let block_size = manifest.block_size;

        self.next_data_offset += op.blob_length();

        // Already covered by the checkpoint; its bytes streamed past for
        // the payload hash but the blocks are on disk
        if ordinal < self.resume_from {
            return Ok(());
        }

        let name = self.partitions[partition_index].name.clone();
        let optimized = self.partitions_ctl.optimize_operation(&name, &op);

        let executor = self.executor.expect("metadata handled");
        let runtime = &mut self.partitions[partition_index];

        executor
            .apply(
                &optimized,
                &blob,
                runtime.source.as_ref().map(|dev| dev as &dyn BlockDev),
                &mut runtime.target,
            )
            .map_err(|source| Error::Executor {
                partition: name.clone(),
                source,
            })?;

        // Stream the freshly written blocks through the hash tree
        if let Some(verity) = &mut runtime.verity {
            for extent in &optimized.dst_extents {
                let bytes = read_extents(&runtime.target, block_size, &[*extent]).map_err(Error::Io)?;
                verity.update(extent.start_block * block_size as u64, &bytes);
            }
        }

        // Flush before the checkpoint may claim this operation done
        runtime.target.flush().map_err(Error::Io)?;

        Checkpoint {
            payload_hash: self.descriptor.payload_hash_hex(),
            metadata_size: self.parser.header().expect("header parsed").metadata_size() as i64,
            next_operation: (ordinal + 1) as i64,
            next_data_offset: self.next_data_offset as i64,
            state: UpdateState::Downloading,
        }
        .store(&mut self.prefs)?;

        Ok(())
    }

    /// Stream fully verified: write verity, check hashes, commit
    fn on_complete(&mut self) -> Result<(), Error> {
        self.write_verity()?;
        self.finalize()?;

        self.state = State::Done;

        Ok(())
    }

    fn write_verity(&mut self) -> Result<(), Error> {
        (self.progress)(
            self.parser.bytes_consumed(),
            self.descriptor.payload_size,
            Stage::WritingVerity,
        );

        for runtime in &mut self.partitions {
            let Some(verity) = &mut runtime.verity else {
                continue;
            };

            while !verity.fec_finished() {
                if self.cancel_requested {
                    return Err(Error::Cancelled);
                }

                verity
                    .incremental_finalize(&mut runtime.target)
                    .map_err(|source| Error::Verity {
                        partition: runtime.name.clone(),
                        source,
                    })?;
            }

            runtime.target.flush().map_err(Error::Io)?;
            info!("verity complete for {}", runtime.name);
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        (self.progress)(
            self.parser.bytes_consumed(),
            self.descriptor.payload_size,
            Stage::Finalizing,
        );

        for runtime in &mut self.partitions {
            let digest = hash_device(&runtime.target, runtime.new_size).map_err(Error::Io)?;

            if digest != runtime.new_hash {
                return Err(Error::PartitionHashMismatch {
                    partition: runtime.name.clone(),
                    expected: hex::encode(runtime.new_hash),
                    got: hex::encode(digest),
                });
            }

            info!("partition {} verified", runtime.name);
        }

        self.run_postinstall()?;

        self.partitions_ctl.finish_update().map_err(Error::Snapshot)?;

        let target_slot = self.target_slot;
        self.boot
            .set_active_boot_slot(target_slot)
            .map_err(|_| Error::SlotActivation(target_slot))?;

        Checkpoint {
            payload_hash: self.descriptor.payload_hash_hex(),
            metadata_size: self.parser.header().expect("header parsed").metadata_size() as i64,
            next_operation: self.global_index as i64,
            next_data_offset: self.next_data_offset as i64,
            state: UpdateState::Succeeded,
        }
        .store(&mut self.prefs)?;

        info!("update applied, slot {} active on next boot", self.target_slot);

        Ok(())
    }

    fn run_postinstall(&mut self) -> Result<(), Error> {
        let Some(root) = &self.postinstall_root else {
            return Ok(());
        };

        for runtime in &self.partitions {
            let Some(postinstall) = &runtime.postinstall else {
                continue;
            };

            let program = root.join(&postinstall.path);
            let result = self
                .subprocess
                .exec(&program, &[], POSTINSTALL_TIMEOUT)
                .map_err(|source| Error::Postinstall {
                    partition: runtime.name.clone(),
                    source,
                });

            match result {
                Ok(status) if status.success() => {}
                Ok(status) if postinstall.optional => {
                    warn!("optional postinstall for {} exited {status}", runtime.name);
                }
                Ok(status) => {
                    return Err(Error::PostinstallStatus {
                        partition: runtime.name.clone(),
                        status,
                    })
                }
                Err(error) if postinstall.optional => {
                    warn!("optional postinstall for {}: {error}", runtime.name);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }
}

/// First boot of the new slot went well: make it permanent and collapse
/// the snapshots into the base partitions
pub fn complete_post_boot(
    boot: &mut dyn BootControl,
    partitions_ctl: &mut DynamicPartitionControl,
) -> Result<(), Error> {
    boot.mark_boot_successful().map_err(Error::Boot)?;

    let current = boot.current_slot();
    partitions_ctl
        .merge_snapshots(current, current.other())
        .map_err(Error::Snapshot)?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("payload parse")]
    Parse(#[source] crau::read::Error),
    #[error("{partition}: operation failed")]
    Executor {
        partition: String,
        #[source]
        source: executor::Error,
    },
    #[error("snapshot controller")]
    Snapshot(#[source] snapshot::Error),
    #[error("{partition}: verity")]
    Verity {
        partition: String,
        #[source]
        source: verity::Error,
    },
    #[error("checkpoint")]
    Checkpoint(#[from] checkpoint::Error),
    #[error("prefs")]
    Prefs(#[from] prefs::Error),
    #[error("boot control")]
    Boot(#[source] boot::Error),
    #[error("update applied but slot {0} could not be activated")]
    SlotActivation(Slot),
    #[error("{partition}: hash mismatch, expected {expected}, got {got}")]
    PartitionHashMismatch {
        partition: String,
        expected: String,
        got: String,
    },
    #[error("{partition}: postinstall")]
    Postinstall {
        partition: String,
        #[source]
        source: subprocess::Error,
    },
    #[error("{partition}: postinstall exited {status}")]
    PostinstallStatus {
        partition: String,
        status: std::process::ExitStatus,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("io")]
    Io(#[source] std::io::Error),
}

impl Error {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Error::Parse(parse) => ErrorCode::from(parse),
            Error::Executor { source, .. } => source.to_error_code(),
            Error::Snapshot(source) => source.to_error_code(),
            Error::Verity { .. } => ErrorCode::VerityCalculationError,
            Error::Checkpoint(_) | Error::Prefs(_) => ErrorCode::DownloadStateInitializationError,
            Error::Boot(_) => ErrorCode::DownloadStateInitializationError,
            Error::SlotActivation(_) => ErrorCode::UpdatedButNotActive,
            Error::PartitionHashMismatch { .. } => ErrorCode::NewRootfsVerificationError,
            Error::Postinstall { .. } | Error::PostinstallStatus { .. } => ErrorCode::PostinstallRunnerError,
            Error::Cancelled => ErrorCode::UserCanceled,
            Error::Io(_) => ErrorCode::InstallDeviceOpenError,
        }
    }
}
