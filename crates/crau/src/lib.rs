// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reader and writer support for the `CrAU` update payload container.
//!
//! A payload is a single byte stream with fixed big-endian framing: the
//! `CrAU` magic, a major version, the manifest length, the metadata
//! signature length, the serialized manifest, the metadata signature blob,
//! the per-operation data blobs, and finally the payload signature blob.
//! [`read::StreamParser`] consumes that stream incrementally from
//! arbitrary-sized chunks; [`write::Writer`] produces it.

pub mod ext;
pub mod header;
pub mod manifest;
pub mod read;
pub mod signature;
pub mod write;

pub use self::header::Header;
pub use self::manifest::{Extent, InstallOperation, Manifest, OperationKind, PartitionUpdate};
pub use self::read::StreamParser;
pub use self::signature::Signatures;
pub use self::write::Writer;

/// Build-policy capability injected into the parser for the timestamp
/// downgrade check. The engine's hardware interface implements this.
pub trait BuildPolicy {
    /// Timestamp of the currently running build, seconds since the epoch
    fn build_timestamp(&self) -> i64;

    /// Whether this device accepts payloads older than the running build
    fn allow_downgrade(&self) -> bool;
}
