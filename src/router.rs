//! Upstream selection policy.
//!
//! One function decides which server a request goes to:
//! - a routing key pins the request to one member of the appropriate set by
//!   rendezvous hashing,
//! - a keyless write prefers the primary of the write set,
//! - a keyless read round-robins over the read set.

use std::sync::Arc;

use tracing::debug;

use crate::upstream::{ReplicaPair, Upstream};

/// Pick the upstream serving this request, or `None` when the relevant set
/// is empty. Callers log and abort the request on `None`; selection itself
/// never panics.
pub fn select(pair: &ReplicaPair, key: Option<&str>, is_write: bool) -> Option<Arc<Upstream>> {
    let set = if is_write { pair.write() } else { pair.read() };
    let picked = match key {
        Some(key) => set.pick_by_hash(key),
        None if is_write => set.pick_primary(),
        None => set.pick_round_robin(),
    };
    if let Some(up) = &picked {
        debug!(addr = up.addr(), is_write, keyed = key.is_some(), "selected upstream");
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamSet;

    fn pair(read: &[&str], write: &[&str]) -> ReplicaPair {
        ReplicaPair::new(
            Arc::new(UpstreamSet::from_addrs(read)),
            Arc::new(UpstreamSet::from_addrs(write)),
        )
    }

    #[test]
    fn keyed_selection_uses_the_right_set() {
        let pair = pair(&["r1", "r2"], &["w1"]);
        let read = select(&pair, Some("k"), false).unwrap();
        assert!(read.addr().starts_with('r'));
        let write = select(&pair, Some("k"), true).unwrap();
        assert_eq!(write.addr(), "w1");
    }

    #[test]
    fn keyless_write_prefers_primary() {
        let pair = pair(&["r1"], &["master", "replica"]);
        for _ in 0..8 {
            assert_eq!(select(&pair, None, true).unwrap().addr(), "master");
        }
    }

    #[test]
    fn keyless_read_round_robins() {
        let pair = pair(&["r1", "r2", "r3"], &["w1"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(select(&pair, None, false).unwrap().addr().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn empty_set_is_a_routing_failure() {
        let pair = pair(&[], &[]);
        assert!(select(&pair, None, false).is_none());
        assert!(select(&pair, Some("k"), true).is_none());
    }
}
