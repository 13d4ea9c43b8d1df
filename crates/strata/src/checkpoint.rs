// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The durable progress record.
//!
//! Progress lives in the preference store under fixed keys and only ever
//! advances inside a store transaction, after an operation has both
//! verified its blob hash and flushed its destination blocks. A resumed
//! run compares the stored payload hash with the incoming descriptor:
//! match means skip to the recorded operation, mismatch means start over.

use std::str::FromStr;

use strum::{Display, EnumString};
use thiserror::Error;

use prefs::Prefs;

pub const KEY_UPDATE_STATE: &str = "update-state";
pub const KEY_PAYLOAD_HASH: &str = "update-state-payload-hash";
pub const KEY_METADATA_SIZE: &str = "manifest-metadata-size";
pub const KEY_NEXT_OPERATION: &str = "update-state-next-operation";
pub const KEY_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum UpdateState {
    Idle,
    Downloading,
    Verifying,
    Finalizing,
    Reporting,
    Succeeded,
    Failed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Hex SHA-256 of the payload this progress belongs to
    pub payload_hash: String,
    pub metadata_size: i64,
    /// Next operation in global manifest order
    pub next_operation: i64,
    /// Running total of every consumed `data_length`
    pub next_data_offset: i64,
    pub state: UpdateState,
}

impl Checkpoint {
    pub fn start(payload_hash: String, metadata_size: i64) -> Self {
        Self {
            payload_hash,
            metadata_size,
            next_operation: 0,
            next_data_offset: 0,
            state: UpdateState::Downloading,
        }
    }

    /// Load the stored record, or None when no update is in flight
    pub fn load(prefs: &Prefs) -> Result<Option<Self>, Error> {
        let Some(payload_hash) = prefs.get_string(KEY_PAYLOAD_HASH)? else {
            return Ok(None);
        };

        let state = prefs
            .get_string(KEY_UPDATE_STATE)?
            .and_then(|value| UpdateState::from_str(&value).ok())
            .unwrap_or(UpdateState::Idle);

        Ok(Some(Self {
            payload_hash,
            metadata_size: prefs.get_int64(KEY_METADATA_SIZE)?.unwrap_or(0),
            next_operation: prefs.get_int64(KEY_NEXT_OPERATION)?.unwrap_or(0),
            next_data_offset: prefs.get_int64(KEY_NEXT_DATA_OFFSET)?.unwrap_or(0),
            state,
        }))
    }

    /// Persist every field atomically
    pub fn store(&self, prefs: &mut Prefs) -> Result<(), Error> {
        prefs.start_transaction()?;

        let result = self.store_keys(prefs);
        match result {
            Ok(()) => prefs.submit_transaction()?,
            Err(_) => prefs.cancel_transaction()?,
        }

        result
    }

    fn store_keys(&self, prefs: &mut Prefs) -> Result<(), Error> {
        prefs.set_string(KEY_PAYLOAD_HASH, &self.payload_hash)?;
        prefs.set_int64(KEY_METADATA_SIZE, self.metadata_size)?;
        prefs.set_int64(KEY_NEXT_OPERATION, self.next_operation)?;
        prefs.set_int64(KEY_NEXT_DATA_OFFSET, self.next_data_offset)?;
        prefs.set_string(KEY_UPDATE_STATE, &self.state.to_string())?;
        Ok(())
    }

    /// Drop the record entirely (terminal states, or a new payload)
    pub fn clear(prefs: &mut Prefs) -> Result<(), Error> {
        for key in [
            KEY_PAYLOAD_HASH,
            KEY_METADATA_SIZE,
            KEY_NEXT_OPERATION,
            KEY_NEXT_DATA_OFFSET,
            KEY_UPDATE_STATE,
        ] {
            prefs.delete(key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("prefs")]
    Prefs(#[from] prefs::Error),
}
