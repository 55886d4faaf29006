//! Aggregated-record representation: a single record shape shared by a set
//! of ranks, with per-field values stored as a majority `default` plus a
//! sparse `overrides` map for the minority (spec.md §4.3).
//!
//! The substitution tree mirrors the record's own field tree, replacing
//! every primitive leaf (a string, or a list of strings) with a key into a
//! [`Substitution`] table. Non-primitive containers (tuples, and lists that
//! hold non-string elements) are walked recursively rather than substituted
//! wholesale, so two records differing only in a nested leaf still share
//! the rest of their structure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::mi::record::{Record, RecordType, ShapeKey, Value};

/// One substitution's stored history: the value held by most ranks, and
/// the (usually empty, or small) set of ranks holding something else.
type Entry = (Value, HashMap<i64, Value>);

/// A table of substitutions shared by all ranks contributing to an
/// aggregated record, plus the rank set those substitutions cover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Substitution {
    substitutions: HashMap<u64, Entry>,
    next_key: u64,
    ids: Interval,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_key(&mut self) -> u64 {
        let k = self.next_key;
        self.next_key += 1;
        k
    }

    /// Records `value` as the (sole, so-far default) substitution for
    /// `vid` and returns the key referring to it.
    pub fn add_substitution(&mut self, value: Value, vid: i64) -> u64 {
        let key = self.next_key();
        self.substitutions.insert(key, (value, HashMap::new()));
        self.add_id(vid);
        key
    }

    pub fn add_id(&mut self, vid: i64) {
        if !self.ids.contains(vid) {
            self.ids = self.ids.union(&Interval::single(vid));
        }
    }

    pub fn ids(&self) -> &Interval {
        &self.ids
    }

    pub fn num_substitutions(&self) -> usize {
        self.substitutions.len()
    }

    /// The value a given key takes on for a given rank: its override if one
    /// is recorded, otherwise the default.
    pub fn get_substitution(&self, key: u64, vid: i64) -> Value {
        let (default, overrides) = self.substitutions.get(&key).expect("unknown substitution key");
        overrides.get(&vid).cloned().unwrap_or_else(|| default.clone())
    }

    fn substitutions_for_vid(&self, vid: i64) -> Vec<(u64, Value)> {
        let mut keys: Vec<&u64> = self.substitutions.keys().collect();
        keys.sort_unstable();
        keys.into_iter().map(|&k| (k, self.get_substitution(k, vid))).collect()
    }

    /// Groups the rank set by identical substitution assignments: ranks
    /// whose values agree on every key end up in the same group.
    pub fn substitution_classes(&self) -> Vec<Vec<i64>> {
        let mut classes: HashMap<Vec<(u64, Value)>, Vec<i64>> = HashMap::new();
        for vid in self.ids.members() {
            classes.entry(self.substitutions_for_vid(vid)).or_default().push(vid);
        }
        classes.into_values().collect()
    }

    /// Merges the substitution at `my_key` in `self` with the one at
    /// `other_key` in `other`, picking whichever value is held by more
    /// ranks as the new default and demoting the rest to overrides.
    fn merge_substitution(&self, other: &Substitution, my_key: u64, other_key: u64) -> Entry {
        let (my_default, my_dict) = self.substitutions.get(&my_key).expect("unknown key");
        let (other_default, other_dict) = other.substitutions.get(&other_key).expect("unknown key");

        let num_my_ids = self.ids.count() as i64;
        let num_other_ids = other.ids.count() as i64;
        let my_default_count = num_my_ids - my_dict.len() as i64;
        let other_default_count = num_other_ids - other_dict.len() as i64;

        let mut counts: HashMap<&Value, usize> = HashMap::new();
        for v in my_dict.values() {
            *counts.entry(v).or_insert(0) += 1;
        }
        for v in other_dict.values() {
            *counts.entry(v).or_insert(0) += 1;
        }

        if counts.is_empty() {
            // Neither side has any overrides; the only question is which
            // default wins.
            if my_default == other_default {
                return (my_default.clone(), my_dict.clone());
            } else if my_default_count >= other_default_count {
                let mut new_dict = my_dict.clone();
                for vid in other.ids.members() {
                    new_dict.insert(vid, other_default.clone());
                }
                return (my_default.clone(), new_dict);
            } else {
                let mut new_dict = my_dict.clone();
                for vid in self.ids.members() {
                    new_dict.insert(vid, my_default.clone());
                }
                return (other_default.clone(), new_dict);
            }
        }

        let (max_value, max_count) = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(v, c)| ((*v).clone(), *c as i64))
            .expect("counts checked non-empty above");

        let replace_with_max = |my_dict: &HashMap<i64, Value>, other_dict: &HashMap<i64, Value>| {
            let mut new_dict = HashMap::new();
            for (k, v) in my_dict {
                if *v != max_value {
                    new_dict.insert(*k, v.clone());
                }
            }
            for (k, v) in other_dict {
                if *v != max_value {
                    new_dict.insert(*k, v.clone());
                }
            }
            for vid in self.ids.members() {
                if !my_dict.contains_key(&vid) {
                    new_dict.insert(vid, my_default.clone());
                }
            }
            for vid in other.ids.members() {
                if !other_dict.contains_key(&vid) {
                    new_dict.insert(vid, other_default.clone());
                }
            }
            new_dict
        };

        let union_dicts = |my_dict: &HashMap<i64, Value>, other_dict: &HashMap<i64, Value>| {
            let mut new_dict = my_dict.clone();
            new_dict.extend(other_dict.clone());
            new_dict
        };

        let (new_default, mut new_dict) = if my_default == other_default {
            if max_count > my_default_count + other_default_count {
                (max_value.clone(), replace_with_max(my_dict, other_dict))
            } else {
                (my_default.clone(), union_dicts(my_dict, other_dict))
            }
        } else if my_default_count > other_default_count {
            if max_count > my_default_count {
                (max_value.clone(), replace_with_max(my_dict, other_dict))
            } else {
                let mut new_dict = union_dicts(my_dict, other_dict);
                for vid in other.ids.members() {
                    if !other_dict.contains_key(&vid) {
                        new_dict.insert(vid, other_default.clone());
                    }
                }
                (my_default.clone(), new_dict)
            }
        } else if max_count > other_default_count {
            (max_value.clone(), replace_with_max(my_dict, other_dict))
        } else {
            let mut new_dict = union_dicts(my_dict, other_dict);
            for vid in self.ids.members() {
                if !my_dict.contains_key(&vid) {
                    new_dict.insert(vid, my_default.clone());
                }
            }
            (other_default.clone(), new_dict)
        };

        new_dict.retain(|_, v| *v != new_default);
        (new_default, new_dict)
    }

    /// Folds `other`'s substitutions into `self`, assuming the two tables
    /// were built over records of identical shape so their keys were
    /// assigned in the same order.
    pub fn combine(&mut self, other: &Substitution) {
        let mut merged = HashMap::with_capacity(self.substitutions.len());
        for &key in self.substitutions.keys() {
            merged.insert(key, self.merge_substitution(other, key, key));
        }
        self.substitutions = merged;
        self.ids = self.ids.union(&other.ids);
    }
}

/// Mirrors [`Value`]'s shape but replaces every primitive leaf with a
/// substitution key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Shadow {
    Key(u64),
    Tuple(Vec<(String, Shadow)>),
    List(Vec<Shadow>),
}

fn do_substitution(vid: i64, value: Value, subst: &mut Substitution) -> Shadow {
    if value.is_primitive() {
        return Shadow::Key(subst.add_substitution(value, vid));
    }
    match value {
        Value::Tuple(fields) => {
            Shadow::Tuple(fields.into_iter().map(|(n, v)| (n, do_substitution(vid, v, subst))).collect())
        }
        Value::List(items) => {
            Shadow::List(items.into_iter().map(|v| do_substitution(vid, v, subst)).collect())
        }
        Value::Str(_) => unreachable!("strings are always primitive"),
    }
}

fn undo_substitution(vid: i64, shadow: &Shadow, subst: &Substitution) -> Value {
    match shadow {
        Shadow::Key(k) => subst.get_substitution(*k, vid),
        Shadow::Tuple(fields) => {
            Value::Tuple(fields.iter().map(|(n, v)| (n.clone(), undo_substitution(vid, v, subst))).collect())
        }
        Shadow::List(items) => Value::List(items.iter().map(|v| undo_substitution(vid, v, subst)).collect()),
    }
}

/// An aggregated record: the shape shared by one or more ranks (type,
/// subtypes, token) plus a substitution tree covering their field data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub record_type: RecordType,
    pub subtypes: Vec<String>,
    pub token: Option<u64>,
    /// The ordered top-level field names this record was built from —
    /// the third component of its [`ShapeKey`], carried alongside the
    /// substitution tree since the tree's leaves no longer remember names
    /// once they're replaced by substitution keys.
    field_names: Vec<String>,
    data: Shadow,
    substitutions: Substitution,
}

impl AggregatedRecord {
    /// Builds an aggregate from a single rank's record.
    pub fn new(record: Record, vid: i64) -> Self {
        let field_names = record.shape_key().field_names;
        let Record { record_type, subtypes, token, fields, text } = record;
        let mut substitutions = Substitution::new();
        let data = match record_type {
            RecordType::Result
            | RecordType::AsyncExec
            | RecordType::AsyncStatus
            | RecordType::AsyncNotify => do_substitution(vid, Value::Tuple(fields), &mut substitutions),
            RecordType::StreamConsole | RecordType::StreamTarget | RecordType::StreamLog => {
                do_substitution(vid, Value::Str(text.unwrap_or_default()), &mut substitutions)
            }
            RecordType::Unknown => Shadow::Tuple(Vec::new()),
        };
        if substitutions.num_substitutions() == 0 {
            substitutions.add_id(vid);
        }
        AggregatedRecord { record_type, subtypes, token, field_names, data, substitutions }
    }

    pub fn ids(&self) -> &Interval {
        self.substitutions.ids()
    }

    pub fn substitution_classes(&self) -> Vec<Vec<i64>> {
        self.substitutions.substitution_classes()
    }

    /// This aggregate's shape key: type, subtypes, and ordered field names
    /// (spec.md §4.3).
    pub fn shape_key(&self) -> ShapeKey {
        ShapeKey { record_type: self.record_type, subtypes: self.subtypes.clone(), field_names: self.field_names.clone() }
    }

    /// Whether this aggregate and `other` describe the same record shape
    /// and so can be merged (spec.md §4.3/§7: shape mismatch is a hard
    /// error, never a silent coercion; two records with different
    /// field-name sets never merge even when their leaf counts coincide).
    pub fn compatible_with(&self, other: &AggregatedRecord) -> bool {
        self.shape_key() == other.shape_key()
    }

    /// Merges `other` into `self` in place. Returns `Err` without mutating
    /// `self` if the two aggregates are not of compatible shape.
    pub fn merge(&mut self, other: &AggregatedRecord) -> Result<(), ShapeMismatch> {
        if !self.compatible_with(other) {
            return Err(ShapeMismatch {
                expected: (self.record_type, self.subtypes.clone()),
                found: (other.record_type, other.subtypes.clone()),
            });
        }
        self.substitutions.combine(&other.substitutions);
        Ok(())
    }

    /// Reconstructs the concrete record as seen by rank `vid`.
    pub fn record_for(&self, vid: i64) -> Record {
        let value = undo_substitution(vid, &self.data, &self.substitutions);
        match self.record_type {
            RecordType::Result
            | RecordType::AsyncExec
            | RecordType::AsyncStatus
            | RecordType::AsyncNotify => {
                let fields = match value {
                    Value::Tuple(fields) => fields,
                    _ => Vec::new(),
                };
                Record {
                    record_type: self.record_type,
                    subtypes: self.subtypes.clone(),
                    token: self.token,
                    fields,
                    text: None,
                }
            }
            RecordType::StreamConsole | RecordType::StreamTarget | RecordType::StreamLog => Record {
                record_type: self.record_type,
                subtypes: self.subtypes.clone(),
                token: self.token,
                fields: Vec::new(),
                text: value.as_str().map(|s| s.to_string()),
            },
            RecordType::Unknown => Record::unknown(""),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShapeMismatch {
    pub expected: (RecordType, Vec<String>),
    pub found: (RecordType, Vec<String>),
}

impl std::fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot merge aggregated records of shape {:?} and {:?}", self.expected, self.found)
    }
}
impl std::error::Error for ShapeMismatch {}

/// Merges two lists of aggregated records of matching shape, leaving
/// entries with no match in the other list untouched. Mirrors how a relay
/// combines the aggregates it receives from each of its children.
pub fn combine_lists(
    mut left: Vec<AggregatedRecord>,
    right: Vec<AggregatedRecord>,
) -> Vec<AggregatedRecord> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    for r in right {
        if let Some(pos) = left.iter().position(|l| l.compatible_with(&r)) {
            let mut l = left.remove(pos);
            l.merge(&r).expect("compatible_with already checked shape");
            out.push(l);
        } else {
            out.push(r);
        }
    }
    out.extend(left);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::record::Record;

    fn stopped_at(line: &str, thread: &str) -> Record {
        Record {
            record_type: RecordType::AsyncExec,
            subtypes: vec!["stopped".into()],
            token: None,
            fields: vec![
                ("reason".into(), Value::Str("breakpoint-hit".into())),
                ("thread-id".into(), Value::Str(thread.into())),
                (
                    "frame".into(),
                    Value::Tuple(vec![
                        ("func".into(), Value::Str("main".into())),
                        ("line".into(), Value::Str(line.into())),
                    ]),
                ),
            ],
            text: None,
        }
    }

    #[test]
    fn uniform_stop_across_all_ranks_has_no_overrides() {
        let mut agg = AggregatedRecord::new(stopped_at("10", "1"), 0);
        for vid in 1..8 {
            let other = AggregatedRecord::new(stopped_at("10", "1"), vid);
            agg.merge(&other).unwrap();
        }
        assert_eq!(agg.ids().count(), 8);
        assert_eq!(agg.substitution_classes().len(), 1);
        for vid in 0..8 {
            let rec = agg.record_for(vid);
            assert_eq!(rec.frame().unwrap().iter().find(|(n, _)| n == "line").unwrap().1.as_str(), Some("10"));
        }
    }

    #[test]
    fn minority_line_becomes_an_override_not_a_new_default() {
        let mut agg = AggregatedRecord::new(stopped_at("10", "1"), 0);
        for vid in 1..7 {
            let other = AggregatedRecord::new(stopped_at("10", "1"), vid);
            agg.merge(&other).unwrap();
        }
        let odd = AggregatedRecord::new(stopped_at("42", "1"), 7);
        agg.merge(&odd).unwrap();

        assert_eq!(agg.ids().count(), 8);
        let majority = agg.record_for(3);
        assert_eq!(
            majority.frame().unwrap().iter().find(|(n, _)| n == "line").unwrap().1.as_str(),
            Some("10")
        );
        let minority = agg.record_for(7);
        assert_eq!(
            minority.frame().unwrap().iter().find(|(n, _)| n == "line").unwrap().1.as_str(),
            Some("42")
        );
        // Two substitution classes: the seven-rank majority and the lone odd rank.
        let classes = agg.substitution_classes();
        assert_eq!(classes.len(), 2);
        assert!(classes.iter().any(|c| c.len() == 7));
        assert!(classes.iter().any(|c| c.len() == 1));
    }

    #[test]
    fn incompatible_shapes_refuse_to_merge() {
        let mut agg = AggregatedRecord::new(stopped_at("10", "1"), 0);
        let different = AggregatedRecord::new(Record::unknown("garbage"), 1);
        assert!(agg.merge(&different).is_err());
    }

    #[test]
    fn same_type_subtypes_and_leaf_count_but_different_field_names_refuse_to_merge() {
        let a = Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: None,
            fields: vec![("x".into(), Value::Str("1".into())), ("y".into(), Value::Str("2".into()))],
            text: None,
        };
        let b = Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: None,
            fields: vec![("p".into(), Value::Str("1".into())), ("q".into(), Value::Str("2".into()))],
            text: None,
        };
        let mut agg_a = AggregatedRecord::new(a, 0);
        let agg_b = AggregatedRecord::new(b, 1);
        assert!(!agg_a.compatible_with(&agg_b));
        assert!(agg_a.merge(&agg_b).is_err());
    }

    #[test]
    fn a_new_value_held_by_a_strict_majority_displaces_the_old_default() {
        // Rank 0 alone starts as the default; once five more ranks agree on
        // a different value, the merge should flip the default to match
        // the numerical majority rather than keeping the original.
        let mut agg = AggregatedRecord::new(stopped_at("10", "1"), 0);
        for vid in 1..6 {
            let other = AggregatedRecord::new(stopped_at("20", "1"), vid);
            agg.merge(&other).unwrap();
        }
        let rec = agg.record_for(3);
        assert_eq!(
            rec.frame().unwrap().iter().find(|(n, _)| n == "line").unwrap().1.as_str(),
            Some("20")
        );
    }

    #[test]
    fn combine_lists_merges_matching_shapes_and_keeps_the_rest() {
        let a = vec![AggregatedRecord::new(stopped_at("10", "1"), 0)];
        let b = vec![
            AggregatedRecord::new(stopped_at("10", "1"), 1),
            AggregatedRecord::new(Record::unknown("x"), 2),
        ];
        let combined = combine_lists(a, b);
        assert_eq!(combined.len(), 2);
        let merged_stop = combined.iter().find(|r| r.record_type == RecordType::AsyncExec).unwrap();
        assert_eq!(merged_stop.ids().count(), 2);
    }
}
