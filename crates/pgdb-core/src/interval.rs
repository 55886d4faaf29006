//! Compressed disjoint-interval representation of rank sets.
//!
//! Ranks are addressed as a sorted sequence of disjoint, maximally-coalesced
//! closed intervals `[lo, hi]` rather than as materialized lists, so that a
//! command or record addressed at tens of thousands of ranks costs O(number
//! of contiguous runs) rather than O(number of ranks).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A set of non-negative integers stored as sorted, disjoint, coalesced
/// closed intervals.
#[derive(Debug, Clone, Default, Eq, Serialize, Deserialize)]
pub struct Interval {
    intervals: Vec<(i64, i64)>,
}

impl Interval {
    /// The empty interval.
    pub fn empty() -> Self {
        Self { intervals: Vec::new() }
    }

    /// A single contiguous range `[lo, hi]`.
    pub fn range_closed(lo: i64, hi: i64) -> Self {
        if hi < lo {
            return Self::empty();
        }
        Self { intervals: vec![(lo, hi)] }
    }

    /// A single rank.
    pub fn single(rank: i64) -> Self {
        Self::range_closed(rank, rank)
    }

    /// Build from a list of disjoint `(lo, hi)` tuples. Coalesces touching or
    /// adjacent intervals (`[a,b]` and `[b+1,c]` combine to `[a,c]`).
    ///
    /// Sorts first unless `sorted` is true, in which case the caller asserts
    /// the input is already sorted by `lo`.
    pub fn build(mut intervals: Vec<(i64, i64)>, sorted: bool) -> Self {
        if intervals.is_empty() {
            return Self::empty();
        }
        if !sorted {
            intervals.sort_by_key(|t| t.0);
        }
        let mut out = Vec::with_capacity(intervals.len());
        let mut cur = intervals[0];
        for &next in &intervals[1..] {
            if next.0 == cur.1 + 1 || next.0 <= cur.1 {
                cur = (cur.0, cur.1.max(next.1));
            } else {
                out.push(cur);
                cur = next;
            }
        }
        out.push(cur);
        Self { intervals: out }
    }

    /// Build from a list of individual integers (need not be sorted or
    /// unique).
    pub fn from_list(mut list: Vec<i64>, sorted: bool) -> Self {
        if list.is_empty() {
            return Self::empty();
        }
        if !sorted {
            list.sort_unstable();
        }
        let mut out = Vec::new();
        let mut cur_min = list[0];
        let mut cur_max = list[0];
        for &i in &list[1..] {
            if i == cur_max || i == cur_max + 1 {
                cur_max = cur_max.max(i);
            } else {
                out.push((cur_min, cur_max));
                cur_min = i;
                cur_max = i;
            }
        }
        out.push((cur_min, cur_max));
        Self { intervals: out }
    }

    /// Whether `i` is a member of this interval. O(log n) binary search.
    pub fn contains(&self, i: i64) -> bool {
        self.binary_search_intervals(i).is_some()
    }

    fn binary_search_intervals(&self, i: i64) -> Option<usize> {
        let mut low = 0usize;
        let mut high = self.intervals.len();
        while low < high {
            let mid = (low + high) / 2;
            let (lo, hi) = self.intervals[mid];
            if i < lo {
                high = mid;
            } else if i > hi {
                low = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Lazily enumerate every integer represented by this interval, in
    /// ascending order.
    pub fn members(&self) -> Members<'_> {
        Members { intervals: &self.intervals, idx: 0, cur: self.intervals.first().map(|t| t.0) }
    }

    /// The underlying coalesced `(lo, hi)` tuples, in ascending order.
    pub fn ranges(&self) -> &[(i64, i64)] {
        &self.intervals
    }

    /// The smallest value in the interval, if non-empty.
    pub fn smallest(&self) -> Option<i64> {
        self.intervals.first().map(|t| t.0)
    }

    /// The largest value in the interval, if non-empty.
    pub fn largest(&self) -> Option<i64> {
        self.intervals.last().map(|t| t.1)
    }

    /// Whether this interval represents no integers.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The number of integers represented (not the number of runs).
    pub fn count(&self) -> u64 {
        self.intervals.iter().map(|(lo, hi)| (hi - lo + 1) as u64).sum()
    }

    /// The number of disjoint runs.
    pub fn run_count(&self) -> usize {
        self.intervals.len()
    }

    /// The single interval spanning from this interval's smallest to its
    /// largest value, filling any gaps.
    pub fn range(&self) -> Self {
        match (self.smallest(), self.largest()) {
            (Some(lo), Some(hi)) => Self::range_closed(lo, hi),
            _ => Self::empty(),
        }
    }

    fn interval_intersect(a: (i64, i64), b: (i64, i64)) -> Option<(i64, i64)> {
        if a.0 <= b.1 && b.0 <= a.1 {
            Some((a.0.max(b.0), a.1.min(b.1)))
        } else {
            None
        }
    }

    fn interval_difference(a: (i64, i64), b: (i64, i64)) -> Option<Vec<(i64, i64)>> {
        if a.0 <= b.1 && b.0 <= a.1 {
            if a.0 < b.0 {
                if a.1 <= b.1 {
                    Some(vec![(a.0, b.0 - 1)])
                } else {
                    Some(vec![(a.0, b.0 - 1), (b.1 + 1, a.1)])
                }
            } else if b.0 < a.0 {
                if a.1 <= b.1 { None } else { Some(vec![(b.1 + 1, a.1)]) }
            } else if b.1 < a.1 {
                Some(vec![(b.1 + 1, a.1)])
            } else {
                None
            }
        } else {
            Some(vec![a])
        }
    }

    /// Set union. O(n) merge sweep of both operand arrays.
    pub fn union(&self, other: &Interval) -> Interval {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut all: Vec<(i64, i64)> =
            Vec::with_capacity(self.intervals.len() + other.intervals.len());
        all.extend_from_slice(&self.intervals);
        all.extend_from_slice(&other.intervals);
        Interval::build(all, false)
    }

    /// Set intersection. O(n) merge sweep.
    pub fn intersect(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        let mut k = 0usize;
        let mut out = Vec::new();
        for &interval in &self.intervals {
            while k < other.intervals.len() {
                let cand = other.intervals[k];
                if let Some(hit) = Self::interval_intersect(interval, cand) {
                    out.push(hit);
                    if cand.1 <= interval.1 { k += 1 } else { break }
                } else if cand.1 < interval.0 {
                    k += 1;
                } else {
                    break;
                }
            }
        }
        Interval::build(out, true)
    }

    /// List members of `list` that are also in this interval. O(k log n).
    pub fn intersect_list(&self, list: &[i64]) -> Vec<i64> {
        list.iter().copied().filter(|i| self.contains(*i)).collect()
    }

    /// Set difference `self - other`. O(n) merge sweep.
    pub fn difference(&self, other: &Interval) -> Interval {
        if other.is_empty() {
            return self.clone();
        }
        let mut k = 0usize;
        let mut out = Vec::new();
        for &interval in &self.intervals {
            let mut appended = false;
            while k < other.intervals.len() {
                if Self::interval_intersect(interval, other.intervals[k]).is_some() {
                    appended = true;
                    if let Some(diff) = Self::interval_difference(interval, other.intervals[k]) {
                        out.extend(diff);
                        if other.intervals[k].1 <= interval.1 { k += 1 } else { break }
                    } else {
                        k += 1;
                    }
                } else if other.intervals[k].0 > interval.1 {
                    if !appended {
                        out.push(interval);
                        appended = true;
                    }
                    k += 1;
                    break;
                } else {
                    k += 1;
                }
            }
            if k >= other.intervals.len() && !appended {
                out.push(interval);
            }
        }
        Interval::build(out, true)
    }

    /// Symmetric difference: `(self ∪ other) − (self ∩ other)`.
    pub fn symmetric_difference(&self, other: &Interval) -> Interval {
        self.union(other).difference(&self.intersect(other))
    }
}

/// Lazy forward iterator over the members of an [`Interval`].
pub struct Members<'a> {
    intervals: &'a [(i64, i64)],
    idx: usize,
    cur: Option<i64>,
}

impl Iterator for Members<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let cur = self.cur?;
        let (_, hi) = self.intervals[self.idx];
        let next = cur + 1;
        if next > hi {
            self.idx += 1;
            self.cur = self.intervals.get(self.idx).map(|t| t.0);
        } else {
            self.cur = Some(next);
        }
        Some(cur)
    }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.intervals == other.intervals
    }
}

impl std::hash::Hash for Interval {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Order-independent fold: XOR each run's hash together so that two
        // intervals built from differently-ordered inputs, but equal after
        // coalescing, still hash equal.
        use std::hash::Hasher;
        let mut acc: u64 = 0;
        for run in &self.intervals {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            run.hash(&mut h);
            acc ^= h.finish();
        }
        state.write_u64(acc);
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .intervals
            .iter()
            .map(|(lo, hi)| if lo == hi { lo.to_string() } else { format!("{lo}-{hi}") })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromIterator<i64> for Interval {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Interval::from_list(iter.into_iter().collect(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_from_list_coalesces() {
        let iv = Interval::from_list(vec![1, 2, 3, 5, 6, 9], false);
        assert_eq!(iv.ranges(), &[(1, 3), (5, 6), (9, 9)]);
    }

    #[test]
    fn contains_matches_membership() {
        let iv = Interval::from_list(vec![1, 2, 3, 5, 6, 9], false);
        for i in 0..12 {
            let expect = [1, 2, 3, 5, 6, 9].contains(&i);
            assert_eq!(iv.contains(i), expect, "i={i}");
        }
    }

    #[test]
    fn union_matches_scenario_3() {
        let a = Interval::from_list(vec![1, 2, 3, 5, 6, 9], false);
        let b = Interval::from_list(vec![4, 7, 8], false);
        assert_eq!(a.union(&b).ranges(), &[(1, 9)]);
    }

    #[test]
    fn intersect_and_difference_match_scenario_3() {
        let a = Interval::from_list(vec![1, 2, 3, 5, 6, 9], false);
        let b = Interval::from_list(vec![2, 6, 9], false);
        assert_eq!(a.intersect(&b).ranges(), &[(2, 2), (6, 6), (9, 9)]);
        assert_eq!(a.difference(&b).ranges(), &[(1, 1), (3, 3), (5, 5)]);
    }

    #[test]
    fn union_commutative_and_counting_identity() {
        let a = Interval::from_list(vec![1, 2, 3, 10], false);
        let b = Interval::from_list(vec![2, 3, 4, 20], false);
        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.intersect(&b), b.intersect(&a));
        assert_eq!(a.count() + b.count(), a.union(&b).count() + a.intersect(&b).count());
        assert_eq!(a.symmetric_difference(&b), a.union(&b).difference(&a.intersect(&b)));
    }

    #[test]
    fn difference_self_minus_subset_disjoint_from_subset() {
        let a = Interval::from_list(vec![1, 2, 3, 4, 5], false);
        let b = Interval::from_list(vec![2, 3], false);
        let diff = a.difference(&b);
        assert!(diff.intersect(&b).is_empty());
    }

    #[test]
    fn empty_operand_returns_other() {
        let a = Interval::from_list(vec![1, 2, 3], false);
        let e = Interval::empty();
        assert_eq!(a.union(&e), a);
        assert_eq!(e.union(&a), a);
        assert!(a.intersect(&e).is_empty());
    }

    #[test]
    fn members_round_trip() {
        let original = vec![0, 1, 2, 5, 6, 7, 100];
        let iv = Interval::from_list(original.clone(), false);
        let rebuilt: Vec<i64> = iv.members().collect();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn hash_is_order_independent() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let a = Interval::build(vec![(5, 6), (1, 3)], false);
        let b = Interval::build(vec![(1, 3), (5, 6)], false);
        assert_eq!(a, b);
        let mut ha = DefaultHasher::new();
        a.hash(&mut ha);
        let mut hb = DefaultHasher::new();
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn display_formats_runs() {
        let iv = Interval::from_list(vec![1, 2, 3, 5], false);
        assert_eq!(iv.to_string(), "1-3,5");
    }
}
