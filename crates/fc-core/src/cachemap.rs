//! Residency table: which source cache blocks live in which cache slots.

use crate::policy::ReplacementPolicy;
use fc_types::PolicyKind;
use std::collections::HashMap;

/// State of one cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Invalid,
    /// Admitted; its data is still being written to the cache device.
    Filling,
    /// Matches the source device.
    Valid,
    /// Newer than the source device.
    Dirty,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    block: u64,
    state: SlotState,
    /// Bumped on every admission, so a late completion for an earlier
    /// occupant of the slot is recognised and ignored.
    epoch: u64,
    /// Bumped on every write into the slot, so a flush that raced a write
    /// does not mark the newer data clean.
    generation: u64,
    /// Cache reads in flight against the slot. A pinned slot is never
    /// handed to another block.
    readers: u32,
    /// Released while pinned; goes back on the free list when the last
    /// reader unpins it.
    orphaned: bool,
}

/// Result of looking up a source cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Resident { slot: u64, dirty: bool },
    Filling,
    Absent,
}

/// A slot handed out by [`CacheMap::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub slot: u64,
    pub epoch: u64,
}

/// A dirty block selected for flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyEntry {
    pub block: u64,
    pub slot: u64,
    pub generation: u64,
}

pub struct CacheMap {
    slots: Vec<Slot>,
    index: HashMap<u64, u64>,
    free: Vec<u64>,
    dirty: u64,
    next_epoch: u64,
    policy: Box<dyn ReplacementPolicy>,
}

impl CacheMap {
    #[must_use]
    pub fn new(capacity: u64, policy: Box<dyn ReplacementPolicy>) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                block: 0,
                state: SlotState::Invalid,
                epoch: 0,
                generation: 0,
                readers: 0,
                orphaned: false,
            })
            .collect();
        Self {
            slots,
            index: HashMap::new(),
            free: (0..capacity).rev().collect(),
            dirty: 0,
            next_epoch: 1,
            policy,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    #[must_use]
    pub fn resident(&self) -> u64 {
        self.index.len() as u64
    }

    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        self.dirty
    }

    #[must_use]
    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    fn slot(&self, slot: u64) -> Option<&Slot> {
        self.slots.get(usize::try_from(slot).ok()?)
    }

    fn slot_mut(&mut self, slot: u64) -> Option<&mut Slot> {
        self.slots.get_mut(usize::try_from(slot).ok()?)
    }

    #[must_use]
    pub fn state_of(&self, block: u64) -> SlotState {
        self.index
            .get(&block)
            .and_then(|s| self.slot(*s))
            .map_or(SlotState::Invalid, |s| s.state)
    }

    /// Look up `block`, counting a hit with the policy when resident.
    pub fn lookup(&mut self, block: u64) -> Lookup {
        let Some(&slot) = self.index.get(&block) else {
            return Lookup::Absent;
        };
        match self.slot(slot).map(|s| s.state) {
            Some(SlotState::Valid) => {
                self.policy.on_hit(slot);
                Lookup::Resident { slot, dirty: false }
            }
            Some(SlotState::Dirty) => {
                self.policy.on_hit(slot);
                Lookup::Resident { slot, dirty: true }
            }
            Some(SlotState::Filling) => Lookup::Filling,
            Some(SlotState::Invalid) | None => Lookup::Absent,
        }
    }

    /// Like [`lookup`](Self::lookup), but a resident block's slot stays
    /// pinned to it until [`unpin_read`](Self::unpin_read).
    pub fn pin_for_read(&mut self, block: u64) -> Lookup {
        let found = self.lookup(block);
        if let Lookup::Resident { slot, .. } = found {
            if let Some(s) = self.slot_mut(slot) {
                s.readers += 1;
            }
        }
        found
    }

    pub fn unpin_read(&mut self, slot: u64) {
        let Some(s) = self.slot_mut(slot) else {
            return;
        };
        debug_assert!(s.readers > 0, "unpin of unpinned slot {slot}");
        s.readers = s.readers.saturating_sub(1);
        if s.readers == 0 && s.orphaned {
            s.orphaned = false;
            self.free.push(slot);
        }
    }

    /// Claim a slot for `block` in the `Filling` state, evicting a clean
    /// victim if no slot is free. `None` when the block is already present
    /// or every slot is busy or dirty.
    pub fn admit(&mut self, block: u64) -> Option<Admission> {
        if self.index.contains_key(&block) {
            return None;
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slots = &self.slots;
                let victim = self.policy.victim(&|s| {
                    usize::try_from(s)
                        .ok()
                        .and_then(|i| slots.get(i))
                        .is_some_and(|slot| slot.state == SlotState::Valid && slot.readers == 0)
                })?;
                let old = self.slot(victim)?.block;
                self.index.remove(&old);
                self.policy.on_remove(victim);
                victim
            }
        };
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let entry = self.slot_mut(slot)?;
        *entry = Slot {
            block,
            state: SlotState::Filling,
            epoch,
            generation: 0,
            readers: 0,
            orphaned: false,
        };
        self.index.insert(block, slot);
        self.policy.on_insert(slot);
        Some(Admission { slot, epoch })
    }

    /// Finish an admission. On success the slot becomes `state` (`Valid` or
    /// `Dirty`); on failure it is freed. Stale admissions are ignored.
    pub fn complete_fill(&mut self, block: u64, admission: Admission, ok: bool, state: SlotState) {
        let current = self
            .slot(admission.slot)
            .is_some_and(|s| s.block == block && s.epoch == admission.epoch && s.state == SlotState::Filling);
        if !current || self.index.get(&block) != Some(&admission.slot) {
            return;
        }
        if ok {
            if state == SlotState::Dirty {
                self.dirty += 1;
            }
            if let Some(s) = self.slot_mut(admission.slot) {
                s.state = state;
            }
        } else {
            self.release(block, admission.slot);
        }
    }

    /// Record a write into a resident block.
    pub fn note_write(&mut self, block: u64) {
        if let Some(&slot) = self.index.get(&block) {
            if let Some(s) = self.slot_mut(slot) {
                s.generation += 1;
            }
        }
    }

    /// Mark a resident block dirty. Returns false when it is not resident.
    pub fn mark_dirty(&mut self, block: u64) -> bool {
        let Some(&slot) = self.index.get(&block) else {
            return false;
        };
        let mut newly_dirty = false;
        if let Some(s) = self.slot_mut(slot) {
            match s.state {
                SlotState::Valid => {
                    s.state = SlotState::Dirty;
                    newly_dirty = true;
                }
                SlotState::Dirty => {}
                SlotState::Filling | SlotState::Invalid => return false,
            }
            s.generation += 1;
        }
        if newly_dirty {
            self.dirty += 1;
        }
        true
    }

    /// Mark a flushed block clean unless it was written since `entry` was
    /// taken.
    pub fn mark_clean(&mut self, entry: DirtyEntry) -> bool {
        let matches = self.slot(entry.slot).is_some_and(|s| {
            s.block == entry.block && s.state == SlotState::Dirty && s.generation == entry.generation
        });
        if !matches {
            return false;
        }
        if let Some(s) = self.slot_mut(entry.slot) {
            s.state = SlotState::Valid;
        }
        self.dirty -= 1;
        true
    }

    /// Drop `block` from the cache whatever its state.
    pub fn invalidate(&mut self, block: u64) {
        if let Some(&slot) = self.index.get(&block) {
            self.release(block, slot);
        }
    }

    fn release(&mut self, block: u64, slot: u64) {
        self.index.remove(&block);
        let Some(s) = self.slot_mut(slot) else {
            return;
        };
        let was_dirty = s.state == SlotState::Dirty;
        let pinned = s.readers > 0;
        s.state = SlotState::Invalid;
        s.orphaned = pinned;
        if was_dirty {
            self.dirty -= 1;
        }
        self.policy.on_remove(slot);
        if !pinned {
            self.free.push(slot);
        }
    }

    /// Up to `limit` dirty blocks, in slot order.
    #[must_use]
    pub fn dirty_blocks(&self, limit: usize) -> Vec<DirtyEntry> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Dirty)
            .take(limit)
            .map(|(i, s)| DirtyEntry {
                block: s.block,
                slot: i as u64,
                generation: s.generation,
            })
            .collect()
    }

    /// Install `policy`, seeded with every occupied slot, and return the one
    /// it replaces.
    pub fn swap_policy(
        &mut self,
        mut policy: Box<dyn ReplacementPolicy>,
    ) -> Box<dyn ReplacementPolicy> {
        let mut occupied: Vec<u64> = self.index.values().copied().collect();
        occupied.sort_unstable();
        for slot in occupied {
            policy.on_insert(slot);
        }
        std::mem::replace(&mut self.policy, policy)
    }
}

impl std::fmt::Debug for CacheMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMap")
            .field("capacity", &self.capacity())
            .field("resident", &self.resident())
            .field("dirty", &self.dirty)
            .field("policy", &self.policy.kind())
            .finish_non_exhaustive()
    }
}
