//! Upstream replica sets.
//!
//! An [`Upstream`] is one server address plus its health counters; an
//! [`UpstreamSet`] is the ordered, weighted collection serving reads or
//! writes for one logical backend. A [`ReplicaPair`] couples the read set
//! with the write set (often the very same set).
//!
//! Health is tracked with plain counters: consecutive failures past a
//! threshold take a member out of selection, any success revives it. When
//! every member is down, selection falls back to the full set so routing
//! degrades before it fails; only an empty set yields no address.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;

/// Consecutive failures after which a member is skipped by selection.
const DEFAULT_MAX_ERRORS: u32 = 3;

/// One server address with health bookkeeping.
#[derive(Debug)]
pub struct Upstream {
    addr: String,
    weight: u32,
    max_errors: u32,
    errors: AtomicU32,
    successes: AtomicU64,
}

impl Upstream {
    fn new(addr: String, weight: u32, max_errors: u32) -> Upstream {
        Upstream {
            addr,
            weight: weight.max(1),
            max_errors,
            errors: AtomicU32::new(0),
            successes: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Report a completed request. Any success revives the member.
    pub fn mark_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn mark_failure(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.errors.load(Ordering::Relaxed) < self.max_errors
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }
}

/// Ordered, weighted collection of upstreams with selection policies.
#[derive(Debug)]
pub struct UpstreamSet {
    members: Vec<Arc<Upstream>>,
    cursor: AtomicUsize,
    hasher: RandomState,
}

impl UpstreamSet {
    /// Build a set from `addr` or `addr:weight` descriptors, in
    /// configuration order (the first write member is the primary).
    pub fn from_addrs<S: AsRef<str>>(addrs: &[S]) -> UpstreamSet {
        let members = addrs
            .iter()
            .map(|a| {
                let spec = a.as_ref();
                // A trailing ":<int>" after "host:port" is a weight.
                let (addr, weight) = match spec.rsplit_once(':') {
                    Some((head, tail)) if head.contains(':') => match tail.parse::<u32>() {
                        Ok(w) => (head.to_string(), w),
                        Err(_) => (spec.to_string(), 1),
                    },
                    _ => (spec.to_string(), 1),
                };
                Arc::new(Upstream::new(addr, weight, DEFAULT_MAX_ERRORS))
            })
            .collect::<Vec<_>>();
        let start = if members.is_empty() {
            0
        } else {
            rand::random::<usize>() % members.len()
        };
        UpstreamSet {
            members,
            cursor: AtomicUsize::new(start),
            // Fixed seeds: the same routing key must map to the same member
            // across processes while the set is stable.
            hasher: RandomState::with_seeds(0x9e37, 0x79b9, 0x7f4a, 0x7c15),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn all_members(&self) -> &[Arc<Upstream>] {
        &self.members
    }

    /// Alive members, or the whole set when everything is down.
    fn candidates(&self) -> Vec<&Arc<Upstream>> {
        let alive: Vec<&Arc<Upstream>> =
            self.members.iter().filter(|m| m.is_alive()).collect();
        if alive.is_empty() {
            self.members.iter().collect()
        } else {
            alive
        }
    }

    /// Weighted rendezvous hash: the same key picks the same member for as
    /// long as the member stays selectable.
    pub fn pick_by_hash(&self, key: &str) -> Option<Arc<Upstream>> {
        self.candidates()
            .into_iter()
            .max_by_key(|m| {
                let h = self.hasher.hash_one((key, m.addr())) as u128;
                h * m.weight() as u128
            })
            .cloned()
    }

    /// Primary-preferring pick: the first selectable member in
    /// configuration order.
    pub fn pick_primary(&self) -> Option<Arc<Upstream>> {
        self.members
            .iter()
            .find(|m| m.is_alive())
            .or_else(|| self.members.first())
            .cloned()
    }

    /// Round-robin over selectable members.
    pub fn pick_round_robin(&self) -> Option<Arc<Upstream>> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(candidates[n % candidates.len()].clone())
    }
}

/// Read and write replica sets for one logical backend.
///
/// When no distinct write set is configured both halves are the same
/// `UpstreamSet` instance.
#[derive(Debug, Clone)]
pub struct ReplicaPair {
    read: Arc<UpstreamSet>,
    write: Arc<UpstreamSet>,
}

impl ReplicaPair {
    pub fn new(read: Arc<UpstreamSet>, write: Arc<UpstreamSet>) -> ReplicaPair {
        ReplicaPair { read, write }
    }

    /// Both roles served by the same set.
    pub fn single(set: Arc<UpstreamSet>) -> ReplicaPair {
        ReplicaPair {
            read: set.clone(),
            write: set,
        }
    }

    pub fn read(&self) -> &UpstreamSet {
        &self.read
    }

    pub fn write(&self) -> &UpstreamSet {
        &self.write
    }

    /// Union of read and write members, deduplicated by address. Script
    /// loads broadcast to exactly this list.
    pub fn union(&self) -> Vec<Arc<Upstream>> {
        let mut seen = Vec::new();
        let mut out: Vec<Arc<Upstream>> = Vec::new();
        for m in self.read.all_members().iter().chain(self.write.all_members()) {
            if !seen.contains(&m.addr().to_string()) {
                seen.push(m.addr().to_string());
                out.push(m.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_suffix_is_parsed() {
        let set = UpstreamSet::from_addrs(&["10.0.0.1:6379:5", "10.0.0.2:6379"]);
        assert_eq!(set.all_members()[0].addr(), "10.0.0.1:6379");
        assert_eq!(set.all_members()[0].weight(), 5);
        assert_eq!(set.all_members()[1].weight(), 1);
    }

    #[test]
    fn hash_pick_is_stable() {
        let set = UpstreamSet::from_addrs(&["a", "b", "c"]);
        let first = set.pick_by_hash("user@example.com").unwrap();
        for _ in 0..32 {
            let again = set.pick_by_hash("user@example.com").unwrap();
            assert_eq!(first.addr(), again.addr());
        }
    }

    #[test]
    fn hash_pick_spreads_keys() {
        let set = UpstreamSet::from_addrs(&["a", "b", "c", "d"]);
        let mut hit = std::collections::HashSet::new();
        for i in 0..256 {
            hit.insert(set.pick_by_hash(&format!("key-{i}")).unwrap().addr().to_string());
        }
        assert!(hit.len() > 1, "all keys mapped to one member");
    }

    #[test]
    fn round_robin_cycles_members() {
        let set = UpstreamSet::from_addrs(&["a", "b", "c"]);
        let mut hit = std::collections::HashSet::new();
        for _ in 0..3 {
            hit.insert(set.pick_round_robin().unwrap().addr().to_string());
        }
        assert_eq!(hit.len(), 3);
    }

    #[test]
    fn failures_take_member_out_until_success() {
        let set = UpstreamSet::from_addrs(&["a", "b"]);
        let a = set.all_members()[0].clone();
        for _ in 0..DEFAULT_MAX_ERRORS {
            a.mark_failure();
        }
        assert!(!a.is_alive());
        for _ in 0..8 {
            assert_eq!(set.pick_round_robin().unwrap().addr(), "b");
        }
        a.mark_success();
        assert!(a.is_alive());
    }

    #[test]
    fn all_down_falls_back_to_full_set() {
        let set = UpstreamSet::from_addrs(&["a", "b"]);
        for m in set.all_members() {
            for _ in 0..DEFAULT_MAX_ERRORS {
                m.mark_failure();
            }
        }
        assert!(set.pick_round_robin().is_some());
        assert!(set.pick_by_hash("k").is_some());
    }

    #[test]
    fn empty_set_yields_nothing() {
        let set = UpstreamSet::from_addrs::<&str>(&[]);
        assert!(set.pick_round_robin().is_none());
        assert!(set.pick_primary().is_none());
        assert!(set.pick_by_hash("k").is_none());
    }

    #[test]
    fn primary_prefers_configuration_order() {
        let set = UpstreamSet::from_addrs(&["master", "slave"]);
        assert_eq!(set.pick_primary().unwrap().addr(), "master");
        let m = set.all_members()[0].clone();
        for _ in 0..DEFAULT_MAX_ERRORS {
            m.mark_failure();
        }
        assert_eq!(set.pick_primary().unwrap().addr(), "slave");
    }

    #[test]
    fn union_deduplicates_addresses() {
        let read = Arc::new(UpstreamSet::from_addrs(&["a", "b"]));
        let write = Arc::new(UpstreamSet::from_addrs(&["b", "c"]));
        let pair = ReplicaPair::new(read, write);
        let union = pair.union();
        let addrs: Vec<&str> = union.iter().map(|m| m.addr()).collect();
        assert_eq!(addrs, vec!["a", "b", "c"]);
    }
}
