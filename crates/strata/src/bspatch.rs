// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Binary patch application for the bsdiff family.
//!
//! Two containers are accepted: classic `BSDIFF40` (all three streams
//! bzip2) and `BSDF2` (per-stream compressor byte: raw, bzip2 or brotli,
//! which is the encoding the BROTLI_BSDIFF operation carries). The patch
//! is three concatenated streams: control triples, a diff stream added
//! byte-wise onto old data, and an extra stream of literal bytes.

use std::io::{self, Read};

use thiserror::Error;

const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";

/// Header: 8-byte magic, then three signed-magnitude 64-bit lengths:
/// compressed control size, compressed diff size, output size
const HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compressor {
    Raw,
    Bz2,
    Brotli,
}

impl Compressor {
    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(Compressor::Raw),
            1 => Ok(Compressor::Bz2),
            2 => Ok(Compressor::Brotli),
            b => Err(Error::UnknownCompressor(b)),
        }
    }

    fn wrap<'a>(&self, bytes: &'a [u8]) -> Box<dyn Read + 'a> {
        match self {
            Compressor::Raw => Box::new(bytes),
            Compressor::Bz2 => Box::new(bzip2::read::BzDecoder::new(bytes)),
            Compressor::Brotli => Box::new(brotli::Decompressor::new(bytes, 4096)),
        }
    }
}

/// Apply `patch` to `old`, producing the new content
pub fn bspatch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>, Error> {
    if patch.len() < HEADER_SIZE {
        return Err(Error::Truncated);
    }

    let magic = &patch[..8];
    let (control_comp, diff_comp, extra_comp) = if magic == BSDIFF40_MAGIC {
        (Compressor::Bz2, Compressor::Bz2, Compressor::Bz2)
    } else if &magic[..5] == BSDF2_MAGIC {
        (
            Compressor::from_byte(magic[5])?,
            Compressor::from_byte(magic[6])?,
            Compressor::from_byte(magic[7])?,
        )
    } else {
        return Err(Error::BadMagic);
    };

    let control_size = read_off(&patch[8..16])?;
    let diff_size = read_off(&patch[16..24])?;
    let new_size = read_off(&patch[24..32])?;

    if control_size < 0 || diff_size < 0 || new_size < 0 {
        return Err(Error::Corrupt("negative stream length"));
    }

    let control_end = HEADER_SIZE
        .checked_add(control_size as usize)
        .ok_or(Error::Truncated)?;
    let diff_end = control_end.checked_add(diff_size as usize).ok_or(Error::Truncated)?;

    if diff_end > patch.len() {
        return Err(Error::Truncated);
    }

    let mut control = control_comp.wrap(&patch[HEADER_SIZE..control_end]);
    let mut diff = diff_comp.wrap(&patch[control_end..diff_end]);
    let mut extra = extra_comp.wrap(&patch[diff_end..]);

    let mut new = vec![0u8; new_size as usize];
    let mut new_pos = 0usize;
    let mut old_pos = 0i64;

    while new_pos < new.len() {
        let add_len = read_off_stream(&mut control)?;
        let copy_len = read_off_stream(&mut control)?;
        let seek = read_off_stream(&mut control)?;

        if add_len < 0 || copy_len < 0 {
            return Err(Error::Corrupt("negative control length"));
        }

        // Diff bytes are added to old content at the running old cursor
        let add_len = add_len as usize;
        if new_pos + add_len > new.len() {
            return Err(Error::Corrupt("add run past output"));
        }

        diff.read_exact(&mut new[new_pos..new_pos + add_len])?;

        for i in 0..add_len {
            let old_index = old_pos + i as i64;
            if old_index >= 0 && (old_index as usize) < old.len() {
                new[new_pos + i] = new[new_pos + i].wrapping_add(old[old_index as usize]);
            }
        }

        new_pos += add_len;
        old_pos += add_len as i64;

        // Extra bytes are copied verbatim
        let copy_len = copy_len as usize;
        if new_pos + copy_len > new.len() {
            return Err(Error::Corrupt("extra run past output"));
        }

        extra.read_exact(&mut new[new_pos..new_pos + copy_len])?;
        new_pos += copy_len;
        old_pos += seek;
    }

    Ok(new)
}

/// bsdiff's signed-magnitude little-endian 64-bit integer
fn read_off(bytes: &[u8]) -> Result<i64, Error> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);

    let magnitude = i64::from_le_bytes([
        raw[0],
        raw[1],
        raw[2],
        raw[3],
        raw[4],
        raw[5],
        raw[6],
        raw[7] & 0x7f,
    ]);

    Ok(if raw[7] & 0x80 != 0 { -magnitude } else { magnitude })
}

fn read_off_stream(reader: &mut dyn Read) -> Result<i64, Error> {
    let mut raw = [0u8; 8];
    reader.read_exact(&mut raw)?;
    read_off(&raw)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("patch too short")]
    Truncated,
    #[error("not a bsdiff patch")]
    BadMagic,
    #[error("unknown stream compressor {0}")]
    UnknownCompressor(u8),
    #[error("corrupt patch: {0}")]
    Corrupt(&'static str),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_off(value: i64, out: &mut Vec<u8>) {
        let magnitude = value.unsigned_abs().to_le_bytes();
        let mut raw = magnitude;
        if value < 0 {
            raw[7] |= 0x80;
        }
        out.extend_from_slice(&raw);
    }

    /// Hand-assemble a raw-stream BSDF2 patch from control triples plus
    /// diff and extra streams
    fn assemble(control: &[(i64, i64, i64)], diff: &[u8], extra: &[u8], new_size: i64) -> Vec<u8> {
        let mut control_bytes = vec![];
        for (add, copy, seek) in control {
            write_off(*add, &mut control_bytes);
            write_off(*copy, &mut control_bytes);
            write_off(*seek, &mut control_bytes);
        }

        let mut patch = vec![];
        patch.extend_from_slice(BSDF2_MAGIC);
        patch.extend_from_slice(&[0, 0, 0]);
        write_off(control_bytes.len() as i64, &mut patch);
        write_off(diff.len() as i64, &mut patch);
        write_off(new_size, &mut patch);
        patch.extend_from_slice(&control_bytes);
        patch.extend_from_slice(diff);
        patch.extend_from_slice(extra);
        patch
    }

    #[test]
    fn identity_patch() {
        let old = b"the quick brown fox";
        // One control triple: add the whole old file with zero diff
        let patch = assemble(
            &[(old.len() as i64, 0, 0)],
            &vec![0u8; old.len()],
            &[],
            old.len() as i64,
        );

        assert_eq!(bspatch(old, &patch).unwrap(), old);
    }

    #[test]
    fn diff_and_extra_runs() {
        let old = b"aaaabbbb";
        // Add 4 bytes of old with +1 on each, then append 3 literal bytes
        let patch = assemble(&[(4, 3, 0)], &[1, 1, 1, 1], b"xyz", 7);

        assert_eq!(bspatch(old, &patch).unwrap(), b"bbbbxyz");
    }

    #[test]
    fn negative_seek_reuses_old_data() {
        let old = b"abcd";
        // Copy old twice by seeking back over it
        let patch = assemble(&[(4, 0, -4), (4, 0, 0)], &vec![0u8; 8], &[], 8);

        assert_eq!(bspatch(old, &patch).unwrap(), b"abcdabcd");
    }

    #[test]
    fn bzip2_streams() {
        let old = b"hello world hello world";

        let compress = |bytes: &[u8]| -> Vec<u8> {
            let mut encoder = bzip2::write::BzEncoder::new(vec![], bzip2::Compression::fast());
            encoder.write_all(bytes).unwrap();
            encoder.finish().unwrap()
        };

        let mut control_bytes = vec![];
        write_off(old.len() as i64, &mut control_bytes);
        write_off(0, &mut control_bytes);
        write_off(0, &mut control_bytes);

        let control = compress(&control_bytes);
        let diff = compress(&vec![0u8; old.len()]);
        let extra = compress(&[]);

        let mut patch = vec![];
        patch.extend_from_slice(BSDIFF40_MAGIC);
        write_off(control.len() as i64, &mut patch);
        write_off(diff.len() as i64, &mut patch);
        write_off(old.len() as i64, &mut patch);
        patch.extend_from_slice(&control);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);

        assert_eq!(bspatch(old, &patch).unwrap(), old);
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(bspatch(b"old", b"short"), Err(Error::Truncated)));
        assert!(matches!(bspatch(b"old", &[0u8; 64]), Err(Error::BadMagic)));
    }
}
