//! Replacement policies for cache slots.

use fc_error::{FcError, Result};
use fc_types::PolicyKind;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Chooses which resident slot to evict.
///
/// The residency map tells the policy about every slot it installs, touches
/// or frees; the policy only orders them.
pub trait ReplacementPolicy: Send {
    fn kind(&self) -> PolicyKind;
    fn on_insert(&mut self, slot: u64);
    fn on_hit(&mut self, slot: u64);
    fn on_remove(&mut self, slot: u64);
    /// Pick a tracked slot for which `evictable` holds.
    fn victim(&mut self, evictable: &dyn Fn(u64) -> bool) -> Option<u64>;
}

/// Build a policy for a cache with `capacity` slots.
pub fn build_policy(kind: PolicyKind, capacity: u64) -> Result<Box<dyn ReplacementPolicy>> {
    if capacity == 0 {
        return Err(FcError::InvalidArgument(
            "cache capacity must be at least one block".to_owned(),
        ));
    }
    Ok(match kind {
        PolicyKind::Fifo => Box::new(Fifo::default()),
        PolicyKind::Lru => Box::new(Lru::default()),
        PolicyKind::Rand => Box::new(Rand::new(capacity)),
    })
}

/// Evict in insertion order; hits do not reorder.
#[derive(Debug, Default)]
pub struct Fifo {
    queue: VecDeque<u64>,
}

impl ReplacementPolicy for Fifo {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn on_insert(&mut self, slot: u64) {
        self.queue.push_back(slot);
    }

    fn on_hit(&mut self, _slot: u64) {}

    fn on_remove(&mut self, slot: u64) {
        if let Some(pos) = self.queue.iter().position(|s| *s == slot) {
            self.queue.remove(pos);
        }
    }

    fn victim(&mut self, evictable: &dyn Fn(u64) -> bool) -> Option<u64> {
        self.queue.iter().copied().find(|s| evictable(*s))
    }
}

/// Evict the least recently touched slot.
#[derive(Debug, Default)]
pub struct Lru {
    tick: u64,
    by_tick: BTreeMap<u64, u64>,
    ticks: HashMap<u64, u64>,
}

impl Lru {
    fn touch(&mut self, slot: u64) {
        self.tick += 1;
        if let Some(old) = self.ticks.insert(slot, self.tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.tick, slot);
    }
}

impl ReplacementPolicy for Lru {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lru
    }

    fn on_insert(&mut self, slot: u64) {
        self.touch(slot);
    }

    fn on_hit(&mut self, slot: u64) {
        if self.ticks.contains_key(&slot) {
            self.touch(slot);
        }
    }

    fn on_remove(&mut self, slot: u64) {
        if let Some(tick) = self.ticks.remove(&slot) {
            self.by_tick.remove(&tick);
        }
    }

    fn victim(&mut self, evictable: &dyn Fn(u64) -> bool) -> Option<u64> {
        self.by_tick.values().copied().find(|s| evictable(*s))
    }
}

/// Evict a pseudo-random slot.
#[derive(Debug)]
pub struct Rand {
    slots: Vec<u64>,
    index: HashMap<u64, usize>,
    state: u64,
}

impl Rand {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            state: capacity ^ 0x9e37_79b9_7f4a_7c15,
        }
    }

    fn next(&mut self) -> u64 {
        // 64-bit LCG (Knuth MMIX constants).
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state >> 33
    }
}

impl ReplacementPolicy for Rand {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Rand
    }

    fn on_insert(&mut self, slot: u64) {
        if !self.index.contains_key(&slot) {
            self.index.insert(slot, self.slots.len());
            self.slots.push(slot);
        }
    }

    fn on_hit(&mut self, _slot: u64) {}

    fn on_remove(&mut self, slot: u64) {
        if let Some(pos) = self.index.remove(&slot) {
            self.slots.swap_remove(pos);
            if let Some(moved) = self.slots.get(pos) {
                self.index.insert(*moved, pos);
            }
        }
    }

    fn victim(&mut self, evictable: &dyn Fn(u64) -> bool) -> Option<u64> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        let start = usize::try_from(self.next()).unwrap_or(0) % len;
        (0..len)
            .map(|i| self.slots[(start + i) % len])
            .find(|s| evictable(*s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(policy: &mut dyn ReplacementPolicy, n: u64) {
        for slot in 0..n {
            policy.on_insert(slot);
        }
    }

    #[test]
    fn fifo_ignores_hits() {
        let mut p = build_policy(PolicyKind::Fifo, 4).expect("policy");
        fill(p.as_mut(), 4);
        p.on_hit(0);
        assert_eq!(p.victim(&|_| true), Some(0));
        assert_eq!(p.victim(&|s| s != 0), Some(1));
    }

    #[test]
    fn lru_prefers_least_recent() {
        let mut p = build_policy(PolicyKind::Lru, 4).expect("policy");
        fill(p.as_mut(), 4);
        p.on_hit(0);
        p.on_hit(1);
        assert_eq!(p.victim(&|_| true), Some(2));
        p.on_remove(2);
        assert_eq!(p.victim(&|_| true), Some(3));
    }

    #[test]
    fn rand_only_returns_tracked_evictable_slots() {
        let mut p = build_policy(PolicyKind::Rand, 8).expect("policy");
        fill(p.as_mut(), 8);
        p.on_remove(5);
        for _ in 0..64 {
            let v = p.victim(&|s| s % 2 == 1).expect("victim");
            assert!(v % 2 == 1 && v != 5);
        }
        assert_eq!(p.victim(&|_| false), None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(build_policy(PolicyKind::Lru, 0).is_err());
    }
}
