// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The update descriptor handed over by the external downloader. The
//! engine never fetches anything itself; every expectation about the
//! payload arrives here before the first byte does.

use rsa::RsaPublicKey;

#[derive(Debug, Clone)]
pub struct UpdateDescriptor {
    /// Where the payload comes from; informational only inside the engine
    pub payload_url: String,
    pub payload_size: u64,
    /// SHA-256 over the entire payload stream
    pub payload_sha256: [u8; 32],
    /// Header + manifest size, cross-checked against the payload framing
    pub metadata_size: Option<u64>,
    /// Detached metadata signature for legacy payloads whose framing
    /// carries none
    pub metadata_signature: Option<Vec<u8>>,
    /// Keys accepted for metadata and payload signatures; empty means
    /// unsigned payloads are tolerated (test builds only)
    pub public_keys: Vec<RsaPublicKey>,
}

impl UpdateDescriptor {
    pub fn new(payload_url: impl ToString, payload_size: u64, payload_sha256: [u8; 32]) -> Self {
        Self {
            payload_url: payload_url.to_string(),
            payload_size,
            payload_sha256,
            metadata_size: None,
            metadata_signature: None,
            public_keys: vec![],
        }
    }

    pub fn with_public_keys(self, public_keys: Vec<RsaPublicKey>) -> Self {
        Self { public_keys, ..self }
    }

    /// Hex form of the expected payload hash, the checkpoint identity
    pub fn payload_hash_hex(&self) -> String {
        hex::encode(self.payload_sha256)
    }
}
