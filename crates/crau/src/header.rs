// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ext::{ReadExt, WriteExt};

/// Well defined magic field for a payload header
pub const PAYLOAD_HEADER_MAGIC: &[u8; 4] = b"CrAU";

/// Major format versions are defined as u64, big endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Version {
    /// Legacy payloads; the metadata signature length may be zero
    V1 = 1,
    /// Current payloads with a mandatory signed metadata section
    V2 = 2,
}

/// The fixed framing at the start of every payload. The magic sits in the
/// first 4 bytes, followed by the major version, the manifest length and
/// the metadata-signature length, all big endian.
///
/// "Metadata" is defined as this header plus the manifest bytes; the
/// metadata signature covers exactly that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

impl Header {
    /// Size of the encoded header in bytes
    pub const SIZE: usize = 4 + 8 + 8 + 4;

    /// Offset of the manifest within the payload
    pub fn manifest_offset(&self) -> u64 {
        Self::SIZE as u64
    }

    /// Total metadata size: header plus manifest, excluding the signature
    pub fn metadata_size(&self) -> u64 {
        Self::SIZE as u64 + self.manifest_size
    }

    /// Offset of the data-blob region within the payload
    pub fn data_offset(&self) -> u64 {
        self.metadata_size() + self.metadata_signature_size as u64
    }

    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let magic = reader.read_array::<4>()?;

        if *PAYLOAD_HEADER_MAGIC != magic {
            return Err(DecodeError::InvalidMagic(magic));
        }

        let version = match reader.read_u64()? {
            1 => Version::V1,
            2 => Version::V2,
            v => return Err(DecodeError::UnsupportedVersion(v)),
        };

        let manifest_size = reader.read_u64()?;
        let metadata_signature_size = reader.read_u32()?;

        if manifest_size == 0 {
            return Err(DecodeError::EmptyManifest);
        }

        Ok(Self {
            version,
            manifest_size,
            metadata_signature_size,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_array(*PAYLOAD_HEADER_MAGIC)?;
        writer.write_u64(self.version as u64)?;
        writer.write_u64(self.manifest_size)?;
        writer.write_u32(self.metadata_signature_size)?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Header must be {} bytes long", Header::SIZE)]
    NotEnoughBytes,
    #[error("Invalid magic: {0:02x?}")]
    InvalidMagic([u8; 4]),
    #[error("Unsupported major version: {0}")]
    UnsupportedVersion(u64),
    #[error("Manifest length is zero")]
    EmptyManifest,
    #[error("io")]
    Io(io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::NotEnoughBytes,
            _ => DecodeError::Io(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = Header {
            version: Version::V2,
            manifest_size: 1234,
            metadata_signature_size: 267,
        };

        let mut bytes = vec![];
        header.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Header::SIZE);
        assert_eq!(&bytes[..4], b"CrAU");

        let decoded = Header::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = vec![];
        Header {
            version: Version::V2,
            manifest_size: 10,
            metadata_signature_size: 0,
        }
        .encode(&mut bytes)
        .unwrap();
        bytes[0] = b'X';

        assert!(matches!(
            Header::decode(bytes.as_slice()),
            Err(DecodeError::InvalidMagic(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = vec![];
        bytes.extend_from_slice(PAYLOAD_HEADER_MAGIC);
        bytes.extend_from_slice(&9u64.to_be_bytes());
        bytes.extend_from_slice(&10u64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        assert!(matches!(
            Header::decode(bytes.as_slice()),
            Err(DecodeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_header() {
        let bytes = b"CrAU\0\0";
        assert!(matches!(
            Header::decode(&bytes[..]),
            Err(DecodeError::NotEnoughBytes)
        ));
    }
}
