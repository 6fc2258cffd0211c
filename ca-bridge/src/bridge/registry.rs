//! Demux slot table.
//!
//! Slot indices are positional on the wire: the CAM server addresses a
//! demux by its index, so occupied slots are kept as a dense prefix by
//! [`DemuxRegistry::compact`].

use std::collections::BTreeMap;

use bytes::Bytes;
use log::{debug, trace};

use dvbapi_protocol::{psi, Parity, CONTROL_WORD_LEN};

use crate::bridge::ProfileKey;
use crate::error::BridgeError;
use crate::platform::{BankId, FilterHandle};

/// Program number of a free slot.
pub const FREE_PROGRAM: i32 = -1;

/// One tuning profile bound to a slot's program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    /// Hardware bank, if the tuning subsystem reported one.
    pub bank: Option<BankId>,
    /// Running filters by local filter index.
    pub filters: BTreeMap<u8, FilterHandle>,
    /// Even half followed by odd half.
    pub control_word: [u8; CONTROL_WORD_LEN],
}

impl Profile {
    pub fn new(bank: Option<BankId>) -> Self {
        Self {
            bank,
            ..Default::default()
        }
    }

    /// Store one parity half of the control word.
    pub fn set_control_word_half(&mut self, parity: Parity, key: &[u8; 8]) {
        let offset = parity.offset();
        self.control_word[offset..offset + 8].copy_from_slice(key);
    }
}

/// State of one hardware demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxSlot {
    pub program_number: i32,
    pub service_id: u64,
    pub profiles: BTreeMap<ProfileKey, Profile>,
    /// Last PMT section seen for `program_number`.
    pub cached_pmt: Option<Bytes>,
}

impl Default for DemuxSlot {
    fn default() -> Self {
        Self {
            program_number: FREE_PROGRAM,
            service_id: 0,
            profiles: BTreeMap::new(),
            cached_pmt: None,
        }
    }
}

impl DemuxSlot {
    pub fn is_free(&self) -> bool {
        self.program_number == FREE_PROGRAM
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Result of removing a profile from a slot.
#[derive(Debug)]
pub struct Unbound {
    pub profile: Profile,
    /// The slot became empty and was freed.
    pub slot_freed: bool,
}

/// Fixed-capacity table of demux slots.
#[derive(Debug)]
pub struct DemuxRegistry {
    slots: Vec<DemuxSlot>,
}

impl DemuxRegistry {
    /// Create a table with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![DemuxSlot::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free every slot.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(DemuxSlot::clear);
    }

    pub fn slot(&self, index: usize) -> Option<&DemuxSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut DemuxSlot> {
        self.slots.get_mut(index)
    }

    /// Error unless `index` addresses a slot of this table.
    pub fn check_slot(&self, index: usize) -> Result<(), BridgeError> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(BridgeError::SlotOutOfRange {
                slot: index,
                capacity: self.slots.len(),
            })
        }
    }

    pub fn find_slot_by_program(&self, program_number: i32) -> Option<usize> {
        if program_number == FREE_PROGRAM {
            return None;
        }
        self.slots
            .iter()
            .position(|s| s.program_number == program_number)
    }

    pub fn find_slot_by_profile(&self, key: &ProfileKey) -> Option<usize> {
        self.slots.iter().position(|s| s.profiles.contains_key(key))
    }

    /// Claim the first free slot for `program_number`.
    ///
    /// The table is sized to the hardware, so exhaustion is fatal.
    pub fn allocate_free_slot(
        &mut self,
        program_number: i32,
        service_id: u64,
    ) -> Result<usize, BridgeError> {
        if program_number == FREE_PROGRAM {
            return Err(BridgeError::Invariant(
                "cannot allocate a slot for the free program sentinel".to_string(),
            ));
        }
        if let Some(existing) = self.find_slot_by_program(program_number) {
            return Err(BridgeError::Invariant(format!(
                "program {} already occupies slot {}",
                program_number, existing
            )));
        }
        let index = self
            .slots
            .iter()
            .position(DemuxSlot::is_free)
            .ok_or(BridgeError::NoFreeSlot(self.slots.len()))?;

        let slot = &mut self.slots[index];
        slot.program_number = program_number;
        slot.service_id = service_id;
        debug!(
            "Allocated slot {} for program 0x{:04X}",
            index, program_number
        );
        Ok(index)
    }

    /// Move free slots to the tail, keeping occupied slots in order.
    ///
    /// Returns the `(from, to)` index moves that happened.
    pub fn compact(&mut self) -> Vec<(usize, usize)> {
        let mut moves = Vec::new();
        let mut next = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].is_free() {
                continue;
            }
            if index != next {
                self.slots.swap(index, next);
                moves.push((index, next));
            }
            next += 1;
        }
        if !moves.is_empty() {
            debug!("Compacted demux table: {:?}", moves);
        }
        moves
    }

    /// Whether occupied slots form a dense prefix.
    pub fn is_compact(&self) -> bool {
        let occupied = self.slots.iter().filter(|s| !s.is_free()).count();
        self.slots[..occupied].iter().all(|s| !s.is_free())
    }

    /// Bind `key` into an occupied slot.
    pub fn bind_profile(
        &mut self,
        index: usize,
        key: ProfileKey,
        bank: Option<BankId>,
    ) -> Result<(), BridgeError> {
        self.check_slot(index)?;
        if let Some(bound) = self.find_slot_by_profile(&key) {
            return Err(BridgeError::Invariant(format!(
                "profile {} already bound to slot {}",
                key, bound
            )));
        }
        let slot = &mut self.slots[index];
        if slot.is_free() {
            return Err(BridgeError::Invariant(format!(
                "binding {} into free slot {}",
                key, index
            )));
        }
        slot.profiles.insert(key, Profile::new(bank));
        trace!("Bound {} to slot {} (bank {:?})", key, index, bank);
        Ok(())
    }

    /// Remove `key` from a slot, freeing the slot if it was the last profile.
    ///
    /// The returned profile still owns its filter handles and bank; releasing
    /// them is up to the caller.
    pub fn unbind_profile(&mut self, index: usize, key: &ProfileKey) -> Result<Unbound, BridgeError> {
        self.check_slot(index)?;
        let slot = &mut self.slots[index];
        let profile = slot.profiles.remove(key).ok_or_else(|| {
            BridgeError::Invariant(format!("profile {} not bound to slot {}", key, index))
        })?;

        let slot_freed = slot.profiles.is_empty();
        if slot_freed {
            debug!(
                "Slot {} freed (program 0x{:04X})",
                index, slot.program_number
            );
            slot.clear();
        }
        Ok(Unbound {
            profile,
            slot_freed,
        })
    }

    /// Occupied slots in ascending index order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &DemuxSlot)> {
        self.slots.iter().enumerate().filter(|(_, s)| !s.is_free())
    }

    /// Whether any bound profile uses `bank`.
    pub fn bank_in_use(&self, bank: BankId) -> bool {
        self.slots
            .iter()
            .any(|s| s.profiles.values().any(|p| p.bank == Some(bank)))
    }

    /// Remove every profile and free every slot.
    pub fn drain(&mut self) -> Vec<(usize, ProfileKey, Profile)> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let profiles = std::mem::take(&mut slot.profiles);
            drained.extend(profiles.into_iter().map(|(k, p)| (index, k, p)));
            slot.clear();
        }
        drained
    }

    /// Check the table invariants that hold between operations.
    pub fn verify(&self) -> Result<(), BridgeError> {
        let mut programs = BTreeMap::new();
        let mut keys = BTreeMap::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_free() {
                if !slot.profiles.is_empty() || slot.service_id != 0 || slot.cached_pmt.is_some() {
                    return Err(BridgeError::Invariant(format!(
                        "free slot {} still holds state",
                        index
                    )));
                }
                continue;
            }
            if slot.profiles.is_empty() {
                return Err(BridgeError::Invariant(format!(
                    "slot {} occupied without profiles",
                    index
                )));
            }
            if let Some(other) = programs.insert(slot.program_number, index) {
                return Err(BridgeError::Invariant(format!(
                    "program 0x{:04X} in slots {} and {}",
                    slot.program_number, other, index
                )));
            }
            for key in slot.profiles.keys() {
                if let Some(other) = keys.insert(*key, index) {
                    return Err(BridgeError::Invariant(format!(
                        "profile {} in slots {} and {}",
                        key, other, index
                    )));
                }
            }
            if let Some(pmt) = &slot.cached_pmt {
                let cached = psi::pmt_program_number(pmt).map_err(|e| {
                    BridgeError::Invariant(format!("slot {} caches invalid PMT: {}", index, e))
                })?;
                if i32::from(cached) != slot.program_number {
                    return Err(BridgeError::Invariant(format!(
                        "slot {} caches PMT of program 0x{:04X}, holds 0x{:04X}",
                        index, cached, slot.program_number
                    )));
                }
            }
        }
        Ok(())
    }
}
