//! Rank routing and relay-side aggregation over a realized [`Topology`]
//! (spec.md §4.4).

use std::collections::HashMap;

use crate::interval::Interval;
use crate::mi::aggregate::{self, AggregatedRecord};
use crate::transport::message::RankTarget;
use crate::transport::topology::{NodeId, Topology};

/// Maps a rank to the relay (or, for a one-tier deployment, the front-end)
/// it is routed through. Built once when the topology is realized.
#[derive(Debug, Clone, Default)]
pub struct RankMap {
    entries: Vec<(Interval, NodeId)>,
}

impl RankMap {
    /// Builds the rank map by assigning `ranks_per_backend` contiguous
    /// ranks to each leaf in topology order, addressed through that leaf's
    /// parent relay.
    pub fn build(topology: &Topology, ranks_per_backend: i64) -> Self {
        let mut entries = Vec::new();
        let mut next_rank = 0i64;
        for leaf in topology.leaves() {
            let parent = topology.parent_of(leaf).cloned().unwrap_or_else(|| topology.root.clone());
            let lo = next_rank;
            let hi = next_rank + ranks_per_backend - 1;
            entries.push((Interval::range_closed(lo, hi), parent));
            next_rank = hi + 1;
        }
        RankMap { entries }
    }

    pub fn relay_for(&self, rank: i64) -> Option<&NodeId> {
        self.entries.iter().find(|(i, _)| i.contains(rank)).map(|(_, n)| n)
    }

    /// The minimal set of distinct relay subscriptions covering `target`.
    pub fn subscriptions_for(&self, target: &RankTarget) -> Vec<NodeId> {
        match target {
            RankTarget::Broadcast => {
                let mut relays: Vec<NodeId> = self.entries.iter().map(|(_, n)| n.clone()).collect();
                relays.sort();
                relays.dedup();
                relays
            }
            RankTarget::Frontend => Vec::new(),
            RankTarget::Ranks(interval) => {
                let mut relays: Vec<NodeId> = self
                    .entries
                    .iter()
                    .filter(|(i, _)| !i.intersect(interval).is_empty())
                    .map(|(_, n)| n.clone())
                    .collect();
                relays.sort();
                relays.dedup();
                relays
            }
        }
    }
}

/// Accumulates one relay's incoming `out` batches across its children for
/// the current barrier, merging same-shape aggregated records pairwise
/// and forwarding the (usually much smaller) result toward the root.
#[derive(Debug, Default)]
pub struct AggregationBarrier {
    reported: HashMap<NodeId, Vec<AggregatedRecord>>,
}

impl AggregationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one child's contribution for the current barrier. A second
    /// call for the same child before a flush replaces its prior
    /// contribution (a child should report at most once per barrier).
    pub fn record(&mut self, child: NodeId, batch: Vec<AggregatedRecord>) {
        self.reported.insert(child, batch);
    }

    /// Whether every child in `expected` has reported for this barrier.
    pub fn complete(&self, expected: &[NodeId]) -> bool {
        expected.iter().all(|c| self.reported.contains_key(c))
    }

    pub fn pending_children(&self) -> usize {
        self.reported.len()
    }

    /// Merges all contributions received so far and clears the barrier,
    /// whether triggered by completion or by timeout. Shape mismatches
    /// degrade to forwarding both inputs unmerged (spec.md §7).
    pub fn flush(&mut self) -> Vec<AggregatedRecord> {
        let mut merged: Vec<AggregatedRecord> = Vec::new();
        for batch in self.reported.values_mut().map(std::mem::take) {
            merged = aggregate::combine_lists(merged, batch);
        }
        self.reported.clear();
        merged
    }
}

/// Suppresses records whose subtype set intersects a configured filter
/// set, applied by a back-end before a record enters aggregation.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    blocked: std::collections::HashSet<String>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subtypes: impl IntoIterator<Item = String>) {
        self.blocked.extend(subtypes);
    }

    pub fn remove(&mut self, subtypes: &[String]) {
        for s in subtypes {
            self.blocked.remove(s);
        }
    }

    pub fn blocks(&self, subtypes: &[String]) -> bool {
        subtypes.iter().any(|s| self.blocked.contains(s))
    }
}

/// Tracks startup-barrier progress: a back-end is live only once it has
/// received `hello`; the front-end admits user commands only once every
/// expected back-end has joined.
#[derive(Debug, Clone)]
pub struct JoinTracker {
    expected: usize,
    joined: std::collections::HashSet<i64>,
}

impl JoinTracker {
    pub fn new(expected: usize) -> Self {
        JoinTracker { expected, joined: std::collections::HashSet::new() }
    }

    pub fn mark_joined(&mut self, rank: i64) {
        self.joined.insert(rank);
    }

    pub fn is_complete(&self) -> bool {
        self.joined.len() >= self.expected
    }

    pub fn joined_count(&self) -> usize {
        self.joined.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::record::{Record, RecordType, Value};

    fn topo() -> Topology {
        let hosts: Vec<String> = (0..4).map(|i| format!("host{i}")).collect();
        Topology::build("fe", &hosts, 2).unwrap()
    }

    fn stopped(line: &str) -> Record {
        Record {
            record_type: RecordType::AsyncExec,
            subtypes: vec!["stopped".into()],
            token: None,
            fields: vec![("line".into(), Value::Str(line.into()))],
            text: None,
        }
    }

    #[test]
    fn rank_map_routes_broadcast_to_every_relay() {
        let topo = topo();
        let map = RankMap::build(&topo, 1);
        let subs = map.subscriptions_for(&RankTarget::Broadcast);
        assert_eq!(subs.len(), topo.relay_count());
    }

    #[test]
    fn rank_map_narrows_to_minimal_relay_set() {
        let topo = topo();
        let map = RankMap::build(&topo, 1);
        // Ranks 0-1 live under the first relay only.
        let subs = map.subscriptions_for(&RankTarget::Ranks(Interval::range_closed(0, 1)));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn frontend_target_has_no_relay_subscriptions() {
        let topo = topo();
        let map = RankMap::build(&topo, 1);
        assert!(map.subscriptions_for(&RankTarget::Frontend).is_empty());
    }

    #[test]
    fn barrier_merges_once_every_expected_child_reports() {
        let children = vec![NodeId::new("c0", 0), NodeId::new("c1", 0)];
        let mut barrier = AggregationBarrier::new();
        assert!(!barrier.complete(&children));

        barrier.record(children[0].clone(), vec![AggregatedRecord::new(stopped("10"), 0)]);
        assert!(!barrier.complete(&children));

        barrier.record(children[1].clone(), vec![AggregatedRecord::new(stopped("10"), 1)]);
        assert!(barrier.complete(&children));

        let merged = barrier.flush();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ids().count(), 2);
        assert_eq!(barrier.pending_children(), 0);
    }

    #[test]
    fn filter_set_blocks_intersecting_subtypes() {
        let mut filters = FilterSet::new();
        filters.add(["breakpoint-hit".to_string()]);
        assert!(filters.blocks(&["breakpoint-hit".to_string()]));
        assert!(!filters.blocks(&["stopped".to_string()]));
        filters.remove(&["breakpoint-hit".to_string()]);
        assert!(!filters.blocks(&["breakpoint-hit".to_string()]));
    }

    #[test]
    fn join_tracker_completes_at_expected_count() {
        let mut tracker = JoinTracker::new(3);
        tracker.mark_joined(0);
        tracker.mark_joined(1);
        assert!(!tracker.is_complete());
        tracker.mark_joined(2);
        assert!(tracker.is_complete());
    }
}
