// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Hash-tree and FEC post-processing for one partition.
//!
//! The verity writer owns the region arithmetic for a partition whose
//! manifest carries verity metadata: it collects leaf hashes as operation
//! output streams past, then builds the tree bottom-up and writes it
//! level by level into the reserved hash-tree extent, and finally emits
//! Reed–Solomon parity over data plus tree into the FEC extent. All
//! finalize work happens in bounded slices so the orchestrator can
//! interleave checkpointing and cancellation.
//!
//! On-disk tree layout: levels are stored top-down, the root block
//! first and the leaf level last; every level is padded with zeros to a
//! block boundary. A leaf is `sha256(salt || data_block)`.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crau::manifest::VerityConfig;

use crate::block::BlockDev;
use crate::fec::{self, FecConfig, FecEncoder};

/// Hash size; the tree is sha256 throughout
const HASH_SIZE: usize = 32;

/// Leaf blocks read back per finalize slice
const LEAF_SLICE_BLOCKS: u64 = 512;

/// Tree bytes written per finalize slice
const TREE_WRITE_SLICE: usize = 1 << 20;

/// FEC groups encoded per finalize slice
const FEC_GROUP_SLICE: usize = 4;

/// Blocks a hash tree over `data_blocks` leaves occupies, all levels
/// included
pub fn hash_tree_blocks(data_blocks: u64, block_size: u32) -> u64 {
    let hashes_per_block = (block_size as u64) / HASH_SIZE as u64;
    let mut total = 0;
    let mut level = data_blocks;

    while level > 1 {
        level = level.div_ceil(hashes_per_block);
        total += level;
    }

    total
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Leaves,
    BuildTree,
    WriteTree,
    Fec,
    Done,
}

pub struct VerityWriter {
    config: VerityConfig,
    block_size: u32,

    /// Byte bounds of the covered data region
    data_begin: u64,
    data_end: u64,

    /// Leaf hash per data block, filled from streamed output or read back
    leaves: Vec<Option<[u8; 32]>>,
    leaves_present: u64,

    /// High-water byte offset of streamed data; only ever advances
    cursor: u64,

    phase: Phase,
    tree: Vec<u8>,
    tree_written: usize,
    fec: Option<FecState>,
}

struct FecState {
    encoder: FecEncoder,
    next_group: u64,
    total_groups: u64,
}

impl VerityWriter {
    pub fn new(config: VerityConfig, block_size: u32) -> Result<Self, Error> {
        let data_begin = config.hash_tree_data_extent.start_block * block_size as u64;
        let data_end = config.hash_tree_data_extent.end_block() * block_size as u64;
        let data_blocks = config.hash_tree_data_extent.num_blocks;

        if config.has_hash_tree() {
            let expected = hash_tree_blocks(data_blocks, block_size);
            if config.hash_tree_extent.num_blocks != expected {
                return Err(Error::TreeExtentSize {
                    got: config.hash_tree_extent.num_blocks,
                    expected,
                });
            }
        }

        let fec = if config.has_fec() {
            let encoder = FecEncoder::new(FecConfig {
                roots: config.fec_roots,
                block_size,
            })?;
            let covered = config.fec_data_extent.num_blocks;
            let total_groups = covered.div_ceil(encoder.data_symbols() as u64);

            let expected = encoder.parity_blocks_for(covered);
            if config.fec_extent.num_blocks != expected {
                return Err(Error::FecExtentSize {
                    got: config.fec_extent.num_blocks,
                    expected,
                });
            }

            Some(FecState {
                encoder,
                next_group: 0,
                total_groups,
            })
        } else {
            None
        };

        Ok(Self {
            leaves: vec![None; data_blocks as usize],
            leaves_present: 0,
            cursor: data_begin,
            phase: Phase::Leaves,
            tree: vec![],
            tree_written: 0,
            fec,
            config,
            block_size,
            data_begin,
            data_end,
        })
    }

    /// Fold freshly written partition bytes into the leaf set. `offset`
    /// is the absolute byte offset within the partition; anything outside
    /// the covered data region is ignored. Re-presenting already-hashed
    /// blocks is a no-op, and the cursor only advances.
    pub fn update(&mut self, offset: u64, bytes: &[u8]) {
        let block_size = self.block_size as u64;
        let begin = offset.max(self.data_begin);
        let end = (offset + bytes.len() as u64).min(self.data_end);

        if begin >= end {
            return;
        }

        // Only whole blocks aligned within the buffer; stragglers are
        // picked up from the device during finalize
        let first_block = begin.div_ceil(block_size);
        let last_block = end / block_size;

        for block in first_block..last_block {
            let index = ((block * block_size - self.data_begin) / block_size) as usize;
            if self.leaves[index].is_some() {
                continue;
            }

            let start = (block * block_size - offset) as usize;
            let leaf = self.hash_block(&bytes[start..start + block_size as usize]);
            self.leaves[index] = Some(leaf);
            self.leaves_present += 1;
        }

        self.cursor = self.cursor.max(end);
    }

    /// Perform one bounded slice of finalize work against the partition
    /// device. Call until [`Self::fec_finished`] turns true.
    pub fn incremental_finalize(&mut self, dev: &mut dyn BlockDev) -> Result<(), Error> {
        match self.phase {
            Phase::Leaves => self.fill_missing_leaves(dev)?,
            Phase::BuildTree => self.build_tree(),
            Phase::WriteTree => self.write_tree_slice(dev)?,
            Phase::Fec => self.encode_fec_slice(dev)?,
            Phase::Done => {}
        }

        Ok(())
    }

    /// True once the hash tree and any parity are fully on the device
    pub fn fec_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Completion fraction in [0, 1]
    pub fn progress(&self) -> f64 {
        let leaf_units = self.leaves.len() as f64;
        let tree_units = self.config.hash_tree_extent.num_blocks as f64;
        let fec_units = self
            .fec
            .as_ref()
            .map(|f| f.total_groups as f64)
            .unwrap_or_default();
        let total = leaf_units + tree_units + fec_units;

        if total == 0.0 || self.phase == Phase::Done {
            return 1.0;
        }

        let done = self.leaves_present as f64
            + (self.tree_written / self.block_size as usize) as f64
            + self.fec.as_ref().map(|f| f.next_group as f64).unwrap_or_default();

        (done / total).clamp(0.0, 1.0)
    }

    fn hash_block(&self, block: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.config.hash_tree_salt);
        hasher.update(block);
        hasher.finalize().into()
    }

    fn fill_missing_leaves(&mut self, dev: &mut dyn BlockDev) -> Result<(), Error> {
        let block_size = self.block_size as u64;
        let mut filled = 0u64;
        let mut block = vec![0u8; self.block_size as usize];

        for index in 0..self.leaves.len() {
            if filled == LEAF_SLICE_BLOCKS {
                return Ok(());
            }
            if self.leaves[index].is_some() {
                continue;
            }

            let offset = self.data_begin + index as u64 * block_size;
            dev.read_at(offset, &mut block)?;

            self.leaves[index] = Some(self.hash_block(&block));
            self.leaves_present += 1;
            filled += 1;
        }

        self.phase = if self.config.has_hash_tree() {
            Phase::BuildTree
        } else {
            self.after_tree_phase()
        };

        Ok(())
    }

    /// Stack levels bottom-up; serialize the finished tree top-down
    fn build_tree(&mut self) {
        let block_size = self.block_size as usize;
        let hashes_per_block = block_size / HASH_SIZE;

        let mut levels: Vec<Vec<u8>> = vec![];
        let mut current: Vec<u8> = self
            .leaves
            .iter()
            .flat_map(|leaf| leaf.expect("leaves complete"))
            .collect();

        while current.len() > HASH_SIZE {
            // Pad the level to a block boundary before hashing upward
            let padded_blocks = (current.len() / HASH_SIZE).div_ceil(hashes_per_block);
            current.resize(padded_blocks * block_size, 0);
            levels.push(current.clone());

            let mut next = Vec::with_capacity(padded_blocks * HASH_SIZE);
            for chunk in current.chunks(block_size) {
                next.extend_from_slice(&self.hash_block(chunk));
            }
            current = next;
        }

        self.tree = levels.iter().rev().flatten().copied().collect();
        self.phase = Phase::WriteTree;
    }

    fn write_tree_slice(&mut self, dev: &mut dyn BlockDev) -> Result<(), Error> {
        let tree_begin = self.config.hash_tree_extent.start_block * self.block_size as u64;
        let remaining = &self.tree[self.tree_written..];
        let take = remaining.len().min(TREE_WRITE_SLICE);

        dev.write_at(tree_begin + self.tree_written as u64, &remaining[..take])?;
        self.tree_written += take;

        if self.tree_written == self.tree.len() {
            self.phase = self.after_tree_phase();
        }

        Ok(())
    }

    fn after_tree_phase(&self) -> Phase {
        if self.fec.is_some() {
            Phase::Fec
        } else {
            Phase::Done
        }
    }

    fn encode_fec_slice(&mut self, dev: &mut dyn BlockDev) -> Result<(), Error> {
        let block_size = self.block_size as u64;
        let fec = self.fec.as_mut().expect("fec configured");

        let covered_begin = self.config.fec_data_extent.start_block * block_size;
        let covered_blocks = self.config.fec_data_extent.num_blocks;
        let parity_begin = self.config.fec_extent.start_block * block_size;
        let k = fec.encoder.data_symbols() as u64;
        let roots = self.config.fec_roots as u64;

        for _ in 0..FEC_GROUP_SLICE {
            if fec.next_group == fec.total_groups {
                break;
            }

            let group = fec.next_group;
            let first_block = group * k;
            let blocks = k.min(covered_blocks - first_block);

            let mut data = vec![0u8; (blocks * block_size) as usize];
            dev.read_at(covered_begin + first_block * block_size, &mut data)?;

            let parity = fec.encoder.encode_group(&data)?;
            dev.write_at(parity_begin + group * roots * block_size, &parity)?;

            fec.next_group += 1;
        }

        if fec.next_group == fec.total_groups {
            self.phase = Phase::Done;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("hash tree extent holds {got} blocks, layout requires {expected}")]
    TreeExtentSize { got: u64, expected: u64 },
    #[error("fec extent holds {got} blocks, layout requires {expected}")]
    FecExtentSize { got: u64, expected: u64 },
    #[error("fec")]
    Fec(#[from] fec::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use crau::manifest::{Extent, HashAlgorithm};

    use crate::block::{ExtentWriter, FileBlockDev};

    use super::*;

    const BLOCK: u32 = 4096;

    fn device(blocks: u64) -> (tempfile::TempDir, FileBlockDev) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.img");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(blocks * BLOCK as u64).unwrap();
        drop(file);

        (dir, FileBlockDev::open(path).unwrap())
    }

    fn config(data_blocks: u64, salt: &[u8], fec_roots: u32) -> VerityConfig {
        let tree_blocks = hash_tree_blocks(data_blocks, BLOCK);
        let covered = data_blocks + tree_blocks;
        let fec_extent = if fec_roots > 0 {
            let k = (fec::RS_N - fec_roots as usize) as u64;
            Extent::new(covered, covered.div_ceil(k) * fec_roots as u64)
        } else {
            Extent::new(0, 0)
        };

        VerityConfig {
            hash_tree_algorithm: HashAlgorithm::Sha256,
            hash_tree_data_extent: Extent::new(0, data_blocks),
            hash_tree_extent: Extent::new(data_blocks, tree_blocks),
            hash_tree_salt: salt.to_vec(),
            fec_data_extent: Extent::new(0, covered),
            fec_extent,
            fec_roots,
        }
    }

    fn drive(writer: &mut VerityWriter, dev: &mut FileBlockDev) {
        while !writer.fec_finished() {
            writer.incremental_finalize(dev).unwrap();
        }
        assert_eq!(writer.progress(), 1.0);
    }

    #[test]
    fn tree_blocks_accounting() {
        // 128 hashes fit one 4096 block
        assert_eq!(hash_tree_blocks(1, BLOCK), 0);
        assert_eq!(hash_tree_blocks(2, BLOCK), 1);
        assert_eq!(hash_tree_blocks(128, BLOCK), 1);
        assert_eq!(hash_tree_blocks(129, BLOCK), 3);
    }

    #[test]
    fn tree_matches_bottom_up_recomputation() {
        let data_blocks = 130u64;
        let salt = [7u8; 16];
        let config = config(data_blocks, &salt, 0);
        let tree_extent = config.hash_tree_extent;

        let total = data_blocks + tree_extent.num_blocks;
        let (_dir, mut dev) = device(total);

        // Deterministic data content
        let data: Vec<u8> = (0..data_blocks * BLOCK as u64).map(|i| (i % 251) as u8).collect();
        let extents = [Extent::new(0, data_blocks)];
        let mut writer = ExtentWriter::new(&mut dev, BLOCK, &extents);
        writer.write_all(&data).unwrap();

        let mut verity = VerityWriter::new(config, BLOCK).unwrap();
        verity.update(0, &data);
        drive(&mut verity, &mut dev);

        // Recompute bottom-up straight from the device
        let hash = |bytes: &[u8]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(salt);
            hasher.update(bytes);
            hasher.finalize().into()
        };

        let mut level: Vec<u8> = data.chunks(BLOCK as usize).flat_map(|c| hash(c)).collect();
        let mut levels = vec![];
        while level.len() > 32 {
            let blocks = (level.len() / 32).div_ceil(128);
            level.resize(blocks * BLOCK as usize, 0);
            levels.push(level.clone());
            level = level.chunks(BLOCK as usize).flat_map(|c| hash(c)).collect();
        }
        let expected: Vec<u8> = levels.iter().rev().flatten().copied().collect();

        let mut written = vec![0u8; expected.len()];
        dev.read_at(tree_extent.start_block * BLOCK as u64, &mut written).unwrap();
        assert_eq!(written, expected);
    }

    #[test]
    fn idempotent_update() {
        let data_blocks = 4u64;
        let config = config(data_blocks, &[1u8; 8], 0);
        let total = data_blocks + config.hash_tree_extent.num_blocks;

        let data: Vec<u8> = (0..data_blocks * BLOCK as u64).map(|i| (i % 13) as u8).collect();

        let run = |updates: &[(u64, &[u8])]| -> Vec<u8> {
            let (_dir, mut dev) = device(total);
            dev.write_at(0, &data).unwrap();

            let mut verity = VerityWriter::new(config.clone(), BLOCK).unwrap();
            for (offset, bytes) in updates {
                verity.update(*offset, bytes);
            }
            drive(&mut verity, &mut dev);

            let mut tree = vec![0u8; (config.hash_tree_extent.num_blocks * BLOCK as u64) as usize];
            dev.read_at(config.hash_tree_extent.start_block * BLOCK as u64, &mut tree)
                .unwrap();
            tree
        };

        let once = run(&[(0, &data)]);
        let twice = run(&[(0, &data), (0, &data), (BLOCK as u64, &data[BLOCK as usize..])]);
        let never = run(&[]);

        assert_eq!(once, twice);
        assert_eq!(once, never, "finalize reads unseen blocks from the device");
    }

    #[test]
    fn fec_parity_written_and_deterministic() {
        let data_blocks = 6u64;
        let config = config(data_blocks, &[9u8; 4], 2);
        let covered = config.fec_data_extent.num_blocks;
        let total = covered + config.fec_extent.num_blocks;

        let (_dir, mut dev) = device(total);
        let data: Vec<u8> = (0..data_blocks * BLOCK as u64).map(|i| (i % 97) as u8).collect();
        dev.write_at(0, &data).unwrap();

        let mut verity = VerityWriter::new(config.clone(), BLOCK).unwrap();
        drive(&mut verity, &mut dev);

        // Recompute the single parity group over data + tree
        let encoder = FecEncoder::new(FecConfig { roots: 2, block_size: BLOCK }).unwrap();
        let mut covered_bytes = vec![0u8; (covered * BLOCK as u64) as usize];
        dev.read_at(0, &mut covered_bytes).unwrap();
        let expected = encoder.encode_group(&covered_bytes).unwrap();

        let mut parity = vec![0u8; (config.fec_extent.num_blocks * BLOCK as u64) as usize];
        dev.read_at(config.fec_extent.start_block * BLOCK as u64, &mut parity).unwrap();
        assert_eq!(parity, expected);
    }
}
