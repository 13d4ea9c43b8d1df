// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reed–Solomon forward-error-correction parity.
//!
//! Parity uses the conventional RS(255, 255 − roots) code over GF(256)
//! with the 0x11d reduction polynomial. The covered region is processed
//! in groups of `255 − roots` blocks; within a group, byte `b` of every
//! block forms one codeword column, so a damaged block corrupts exactly
//! one symbol per codeword and stays correctable up to `roots / 2` lost
//! blocks. Each group emits `roots` parity blocks, concatenated in group
//! order.

use thiserror::Error;

/// RS codeword length over GF(256)
pub const RS_N: usize = 255;

/// GF(256) reduction polynomial x^8 + x^4 + x^3 + x^2 + 1
const GF_POLY: u16 = 0x11d;

#[derive(Debug, Clone, Copy)]
pub struct FecConfig {
    /// Parity symbols per codeword, typically 2
    pub roots: u32,
    pub block_size: u32,
}

#[derive(Debug)]
pub struct FecEncoder {
    config: FecConfig,
    exp: [u8; 512],
    log: [u8; 256],
    /// Generator polynomial of degree `roots`, highest coefficient first
    generator: Vec<u8>,
}

impl FecEncoder {
    pub fn new(config: FecConfig) -> Result<Self, Error> {
        if config.roots == 0 || config.roots as usize >= RS_N {
            return Err(Error::BadRoots(config.roots));
        }

        let (exp, log) = build_tables();

        let mut encoder = Self {
            config,
            exp,
            log,
            generator: vec![],
        };
        encoder.generator = encoder.build_generator(config.roots as usize);

        Ok(encoder)
    }

    /// Message symbols per codeword
    pub fn data_symbols(&self) -> usize {
        RS_N - self.config.roots as usize
    }

    /// Parity blocks produced for a region of `data_blocks` blocks
    pub fn parity_blocks_for(&self, data_blocks: u64) -> u64 {
        data_blocks.div_ceil(self.data_symbols() as u64) * self.config.roots as u64
    }

    /// Encode one group: up to `255 - roots` blocks of input (the final
    /// group may be short; missing blocks count as zeros) producing
    /// `roots` parity blocks.
    pub fn encode_group(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let block_size = self.config.block_size as usize;
        let k = self.data_symbols();

        if data.is_empty() || data.len() > k * block_size || data.len() % block_size != 0 {
            return Err(Error::BadGroupSize {
                bytes: data.len(),
                block_size: self.config.block_size,
                max_blocks: k,
            });
        }

        let blocks = data.len() / block_size;
        let roots = self.config.roots as usize;
        let mut parity = vec![0u8; roots * block_size];

        // Column b across the group's blocks is one message, first block
        // as the highest power; systematic encoding leaves the data alone
        // and appends the remainder of m(x)*x^roots divided by the
        // generator. Short final groups behave as leading zeros.
        let mut remainder = vec![0u8; roots];
        for b in 0..block_size {
            remainder.iter_mut().for_each(|r| *r = 0);

            for blk in 0..blocks {
                let feedback = data[blk * block_size + b] ^ remainder[0];
                remainder.rotate_left(1);
                remainder[roots - 1] = 0;

                if feedback != 0 {
                    for (j, coefficient) in self.generator[1..].iter().enumerate() {
                        remainder[j] ^= self.mul(feedback, *coefficient);
                    }
                }
            }

            for (j, value) in remainder.iter().enumerate() {
                parity[j * block_size + b] = *value;
            }
        }

        Ok(parity)
    }

    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
    }

    /// g(x) = (x - α^0)(x - α^1)…(x - α^(roots-1))
    fn build_generator(&self, roots: usize) -> Vec<u8> {
        let mut generator = vec![1u8];

        for i in 0..roots {
            let alpha_i = self.exp[i];
            let mut next = vec![0u8; generator.len() + 1];

            for (j, coefficient) in generator.iter().enumerate() {
                next[j] ^= *coefficient;
                next[j + 1] ^= self.mul(*coefficient, alpha_i);
            }

            generator = next;
        }

        generator
    }
}

fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];

    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
    }

    // Double the table so mul never reduces the exponent sum
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }

    (exp, log)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fec roots {0} out of range")]
    BadRoots(u32),
    #[error("group of {bytes} bytes is not 1..={max_blocks} blocks of {block_size}")]
    BadGroupSize {
        bytes: usize,
        block_size: u32,
        max_blocks: usize,
    },
}
