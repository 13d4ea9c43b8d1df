// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Progress reporting back to the front-end.

use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    Downloading,
    VerifyingMetadata,
    ApplyingOperations,
    WritingVerity,
    Finalizing,
}

/// `(bytes_received, total_bytes, stage)`; invoked from the engine's own
/// context, so implementations must not block
pub type ProgressCallback = Box<dyn FnMut(u64, u64, Stage)>;

/// A callback that ignores everything, for callers without a UI
pub fn sink() -> ProgressCallback {
    Box::new(|_, _, _| {})
}
