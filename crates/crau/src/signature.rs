// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Signature blobs and their verification.
//!
//! Both the metadata signature and the payload signature are the same blob
//! shape: a counted list of RSA PKCS#1 v1.5 signatures over a SHA-256
//! digest, each padded to the key size with its unpadded length recorded.
//! Verification succeeds when any signature matches any accepted key.

use std::io::{self, Read, Write};

use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::ext::{ReadExt, WriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub data: Vec<u8>,
    pub unpadded_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signatures {
    pub signatures: Vec<Signature>,
}

impl Signatures {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = bytes;
        let count = reader.read_u32()? as usize;
        let mut signatures = Vec::with_capacity(count.min(16));

        for _ in 0..count {
            let unpadded_size = reader.read_u32()?;
            let length = reader.read_u32()? as usize;
            let data = reader.read_vec(length)?;

            if (unpadded_size as usize) > data.len() {
                return Err(DecodeError::BadUnpaddedSize {
                    unpadded: unpadded_size,
                    padded: data.len(),
                });
            }

            signatures.push(Signature { data, unpadded_size });
        }

        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.len()));
        }

        Ok(Self { signatures })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32(self.signatures.len() as u32)?;

        for signature in &self.signatures {
            writer.write_u32(signature.unpadded_size)?;
            writer.write_u32(signature.data.len() as u32)?;
            writer.write_all(&signature.data)?;
        }

        Ok(())
    }

    pub fn encode_vec(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.encode(&mut bytes).expect("vec write");
        bytes
    }

    /// Verify `digest` against any accepted key. Every signature is tried
    /// against every key; the first match wins.
    pub fn verify(&self, digest: &[u8], keys: &[RsaPublicKey]) -> Result<(), VerifyError> {
        if self.signatures.is_empty() {
            return Err(VerifyError::NoSignatures);
        }

        for signature in &self.signatures {
            let unpadded = &signature.data[..signature.unpadded_size as usize];

            for key in keys {
                let scheme = Pkcs1v15Sign::new::<Sha256>();
                if key.verify(scheme, digest, unpadded).is_ok() {
                    return Ok(());
                }
            }
        }

        Err(VerifyError::Mismatch)
    }
}

/// Sign `digest` with `key`, padding the signature to the key size so the
/// blob length is independent of the digest being signed.
pub fn sign_digest(digest: &[u8], key: &RsaPrivateKey) -> Result<Signatures, rsa::Error> {
    let scheme = Pkcs1v15Sign::new::<Sha256>();
    let mut data = key.sign(scheme, digest)?;

    let unpadded_size = data.len() as u32;
    data.resize(key.size(), 0);

    Ok(Signatures {
        signatures: vec![Signature { data, unpadded_size }],
    })
}

/// Byte length of a signature blob produced by [`sign_digest`] with `key`.
/// The framing records this length before the digest exists, so it must be
/// computable up front.
pub fn signature_blob_size(key: &RsaPrivateKey) -> u32 {
    // count + unpadded_size + data length + padded signature
    (4 + 4 + 4 + key.size()) as u32
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unpadded size {unpadded} exceeds signature of {padded} bytes")]
    BadUnpaddedSize { unpadded: u32, padded: usize },
    #[error("{0} trailing bytes after signatures")]
    TrailingBytes(usize),
    #[error("io")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("blob contains no signatures")]
    NoSignatures,
    #[error("no signature matches any accepted key")]
    Mismatch,
}

#[cfg(test)]
mod test {
    use rsa::RsaPrivateKey;
    use sha2::{Digest, Sha256};

    use super::*;

    fn test_key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 2048).expect("generate key")
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = test_key();
        let digest = Sha256::digest(b"payload bytes");

        let signatures = sign_digest(&digest, &key).unwrap();
        let encoded = signatures.encode_vec();
        assert_eq!(encoded.len() as u32, signature_blob_size(&key));

        let decoded = Signatures::decode(&encoded).unwrap();
        decoded.verify(&digest, &[key.to_public_key()]).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_digest() {
        let key = test_key();
        let digest = Sha256::digest(b"payload bytes");
        let signatures = sign_digest(&digest, &key).unwrap();

        let other = Sha256::digest(b"tampered");
        assert!(matches!(
            signatures.verify(&other, &[key.to_public_key()]),
            Err(VerifyError::Mismatch)
        ));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = test_key();
        let digest = Sha256::digest(b"payload bytes");
        let signatures = sign_digest(&digest, &key).unwrap();

        let imposter = test_key().to_public_key();
        assert!(matches!(
            signatures.verify(&digest, &[imposter]),
            Err(VerifyError::Mismatch)
        ));
    }

    #[test]
    fn empty_blob_rejected() {
        let signatures = Signatures::default();
        assert!(matches!(
            signatures.verify(&[0u8; 32], &[]),
            Err(VerifyError::NoSignatures)
        ));
    }
}
