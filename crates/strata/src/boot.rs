// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The narrow boot-slot contract.
//!
//! The bootloader interface reduces to five idempotent operations over
//! integer slot IDs. The engine only calls them at commit time and after
//! the first successful boot of a new slot.

use std::fmt;

use thiserror::Error;

/// One of the parallel bootable partition sets, numbered from 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u32);

impl Slot {
    pub const A: Slot = Slot(0);
    pub const B: Slot = Slot(1);

    /// Conventional partition-name suffix: `_a`, `_b`, ...
    pub fn suffix(&self) -> String {
        let letter = (b'a' + (self.0 % 26) as u8) as char;
        format!("_{letter}")
    }

    /// The other slot in a two-slot layout
    pub fn other(&self) -> Slot {
        Slot(1 - self.0)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub trait BootControl {
    fn num_slots(&self) -> u32;

    fn current_slot(&self) -> Slot;

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool, Error>;

    /// Clear the bootable flag so the bootloader never picks `slot`
    fn mark_slot_unbootable(&mut self, slot: Slot) -> Result<(), Error>;

    /// Ask the bootloader to try `slot` on the next boot
    fn set_active_boot_slot(&mut self, slot: Slot) -> Result<(), Error>;

    /// Make the currently booted slot permanent
    fn mark_boot_successful(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("slot {0} does not exist")]
    NoSuchSlot(Slot),
    #[error("boot control transaction failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy)]
struct SlotFlags {
    bootable: bool,
    successful: bool,
}

/// In-memory boot control for tests: a slot table plus the active and
/// currently booted slot indices
#[derive(Debug)]
pub struct FakeBootControl {
    slots: Vec<SlotFlags>,
    current: Slot,
    active: Slot,
}

impl FakeBootControl {
    pub fn new(num_slots: u32) -> Self {
        Self {
            slots: vec![
                SlotFlags {
                    bootable: true,
                    successful: true
                };
                num_slots as usize
            ],
            current: Slot(0),
            active: Slot(0),
        }
    }

    /// Simulate a reboot into whatever slot is active
    pub fn reboot(&mut self) {
        self.current = self.active;
    }

    pub fn active_slot(&self) -> Slot {
        self.active
    }

    pub fn is_slot_successful(&self, slot: Slot) -> bool {
        self.slots[slot.0 as usize].successful
    }

    fn check(&self, slot: Slot) -> Result<(), Error> {
        if (slot.0 as usize) < self.slots.len() {
            Ok(())
        } else {
            Err(Error::NoSuchSlot(slot))
        }
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    fn current_slot(&self) -> Slot {
        self.current
    }

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool, Error> {
        self.check(slot)?;
        Ok(self.slots[slot.0 as usize].bootable)
    }

    fn mark_slot_unbootable(&mut self, slot: Slot) -> Result<(), Error> {
        self.check(slot)?;
        self.slots[slot.0 as usize] = SlotFlags {
            bootable: false,
            successful: false,
        };
        Ok(())
    }

    fn set_active_boot_slot(&mut self, slot: Slot) -> Result<(), Error> {
        self.check(slot)?;
        self.slots[slot.0 as usize].bootable = true;
        self.active = slot;
        Ok(())
    }

    fn mark_boot_successful(&mut self) -> Result<(), Error> {
        self.slots[self.current.0 as usize].successful = true;
        Ok(())
    }
}
