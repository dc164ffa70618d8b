//! Multi-path routing table.
//!
//! Each destination maps to a small set of candidate entries, at most one per
//! next hop. Selection picks the lowest metric among entries that have not
//! expired, breaking ties in favour of the highest sequence number.

use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use hashbrown::HashMap;

use crate::time::Timestamp;
use crate::types::{Address, InterfaceId, RoutingTableEntry};

/// Ordering used for route selection: `Less` means `a` is preferred.
fn preference(a: &RoutingTableEntry, b: &RoutingTableEntry) -> Ordering {
    a.metric
        .total_cmp(&b.metric)
        .then_with(|| b.seq_no.cmp(&a.seq_no))
}

/// Candidate routes keyed by destination.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<Address, Vec<RoutingTableEntry>>,
    max_per_destination: usize,
}

impl RoutingTable {
    pub fn new(max_per_destination: usize) -> Self {
        Self {
            routes: HashMap::new(),
            max_per_destination: max_per_destination.max(1),
        }
    }

    /// Insert a candidate, replacing any entry with the same (destination, next hop).
    ///
    /// When the destination is at capacity the least preferred entry is
    /// evicted. Returns false if `entry` itself was the least preferred and
    /// was not stored.
    pub fn upsert(&mut self, entry: RoutingTableEntry) -> bool {
        let candidates = self.routes.entry(entry.destination).or_default();
        if let Some(existing) = candidates
            .iter_mut()
            .find(|e| e.next_hop == entry.next_hop)
        {
            *existing = entry;
            return true;
        }
        if candidates.len() < self.max_per_destination {
            candidates.push(entry);
            return true;
        }

        // Least preferred, earliest expiry on ties.
        let worst = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| preference(a, b).then_with(|| b.lifetime.cmp(&a.lifetime)))
            .map(|(i, _)| i);
        match worst {
            Some(i) if preference(&entry, &candidates[i]) == Ordering::Less => {
                candidates[i] = entry;
                true
            }
            _ => false,
        }
    }

    /// Best non-expired entry for `destination`.
    pub fn best_route(&self, destination: Address, now: Timestamp) -> Option<RoutingTableEntry> {
        self.best_route_where(destination, now, |_| true)
    }

    /// Best non-expired entry for `destination` among those accepted by `filter`.
    pub fn best_route_where(
        &self,
        destination: Address,
        now: Timestamp,
        filter: impl Fn(&RoutingTableEntry) -> bool,
    ) -> Option<RoutingTableEntry> {
        self.routes
            .get(&destination)?
            .iter()
            .filter(|e| e.is_valid(now) && filter(e))
            .min_by(|a, b| preference(a, b))
            .copied()
    }

    /// Non-expired candidates for `destination`, in no particular order.
    pub fn valid_entries(
        &self,
        destination: Address,
        now: Timestamp,
    ) -> impl Iterator<Item = &RoutingTableEntry> + '_ {
        self.routes
            .get(&destination)
            .into_iter()
            .flatten()
            .filter(move |e| e.is_valid(now))
    }

    /// Remove every entry with `lifetime <= now`. Returns how many were removed.
    pub fn prune(&mut self, now: Timestamp) -> usize {
        self.retain(|e| e.is_valid(now))
    }

    /// Remove every entry whose next hop is `next_hop`.
    pub fn remove_via(&mut self, next_hop: Address) -> usize {
        self.retain(|e| e.next_hop != next_hop)
    }

    /// Remove every entry using `iface`.
    pub fn remove_interface(&mut self, iface: InterfaceId) -> usize {
        self.retain(|e| e.interface != iface)
    }

    fn retain(&mut self, keep: impl Fn(&RoutingTableEntry) -> bool) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, candidates| {
            let before = candidates.len();
            candidates.retain(|e| keep(e));
            removed += before - candidates.len();
            !candidates.is_empty()
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All stored entries sorted by destination, then preference.
    pub fn sorted_entries(&self) -> Vec<RoutingTableEntry> {
        let mut all: Vec<RoutingTableEntry> = self.routes.values().flatten().copied().collect();
        all.sort_by(|a, b| a.destination.cmp(&b.destination).then_with(|| preference(a, b)));
        all
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<16}{:<16}{:<10}{:<8}{:<10}{}",
            "Destination", "NextHop", "Interface", "SeqNo", "Metric", "Lifetime"
        )?;
        for e in self.sorted_entries() {
            writeln!(
                f,
                "{:<16}{:<16}{:<10}{:<8}{:<10.3}{}",
                e.destination, e.next_hop, e.interface, e.seq_no, e.metric, e.lifetime
            )?;
        }
        Ok(())
    }
}
