// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The hardware capability seam.
//!
//! Everything the engine needs to know about the running device comes in
//! through [`Hardware`], injected at construction. There is no
//! process-wide state; tests use [`FakeHardware`].

use std::sync::Arc;

pub trait Hardware {
    /// Whether this is a production-signed build; official builds require
    /// per-operation blob hashes
    fn is_official_build(&self) -> bool;

    /// Timestamp of the running build, seconds since the epoch
    fn build_timestamp(&self) -> i64;

    /// Whether payloads older than the running build are acceptable
    fn allow_downgrade(&self) -> bool;
}

/// Bridges [`Hardware`] into the parser's build-policy capability
pub struct BuildPolicyAdapter(pub Arc<dyn Hardware>);

impl crau::BuildPolicy for BuildPolicyAdapter {
    fn build_timestamp(&self) -> i64 {
        self.0.build_timestamp()
    }

    fn allow_downgrade(&self) -> bool {
        self.0.allow_downgrade()
    }
}

/// Settable hardware stand-in for tests
#[derive(Debug)]
pub struct FakeHardware {
    pub official_build: bool,
    pub build_timestamp: i64,
    pub allow_downgrade: bool,
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self {
            official_build: true,
            build_timestamp: 0,
            allow_downgrade: false,
        }
    }
}

impl FakeHardware {
    pub fn with_build_timestamp(build_timestamp: i64) -> Self {
        Self {
            build_timestamp,
            ..Default::default()
        }
    }
}

impl Hardware for FakeHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn build_timestamp(&self) -> i64 {
        self.build_timestamp
    }

    fn allow_downgrade(&self) -> bool {
        self.allow_downgrade
    }
}
