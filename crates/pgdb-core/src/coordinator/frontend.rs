//! Front-end state machine: shell command resolution, rank-spec parsing,
//! equivalence-class printing, and bounded batch history (spec.md §4.5, §6).

use std::collections::VecDeque;
use std::fmt;

use crate::interval::Interval;
use crate::mi::AggregatedRecord;
use crate::transport::overlay::JoinTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendPhase {
    Init,
    Running,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankSpecError(pub String);

impl fmt::Display for RankSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rank spec: {}", self.0)
    }
}
impl std::error::Error for RankSpecError {}

/// Parses a `proc`/`block` spec: `all`, `-1` (also "all ranks"), or a
/// comma-separated list of integers and `a-b` ranges (spec.md §6).
pub fn parse_rank_spec(spec: &str, world_size: i64) -> Result<Interval, RankSpecError> {
    let spec = spec.trim();
    if spec == "all" || spec == "-1" {
        return Ok(Interval::range_closed(0, world_size.saturating_sub(1)));
    }
    let mut ranges: Vec<(i64, i64)> = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(RankSpecError(format!("empty entry in '{spec}'")));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: i64 = lo.trim().parse().map_err(|_| RankSpecError(format!("bad range '{part}'")))?;
            let hi: i64 = hi.trim().parse().map_err(|_| RankSpecError(format!("bad range '{part}'")))?;
            if lo > hi {
                return Err(RankSpecError(format!("range '{part}' has lo > hi")));
            }
            ranges.push((lo, hi));
        } else {
            let v: i64 = part.parse().map_err(|_| RankSpecError(format!("bad rank '{part}'")))?;
            ranges.push((v, v));
        }
    }
    Ok(Interval::build(ranges, false))
}

/// The result of resolving one line of shell input: an optional rank-spec
/// narrowing (from a `proc <spec>` prefix) and the remaining command text.
pub fn split_proc_prefix(line: &str) -> (Option<&str>, &str) {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("proc ") {
        match rest.split_once(' ') {
            Some((spec, command)) => (Some(spec.trim()), command.trim()),
            None => (Some(rest.trim()), ""),
        }
    } else {
        (None, trimmed)
    }
}

/// One batch of aggregated records received from the transport loop,
/// retained so `expand [n]` can replay it.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub batch: Vec<AggregatedRecord>,
}

/// A bounded ring of received batches.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        History { entries: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, batch: Vec<AggregatedRecord>) -> usize {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { batch });
        self.entries.len() - 1
    }

    pub fn get(&self, n: usize) -> Option<&HistoryEntry> {
        self.entries.get(n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One printable line: a record rendered from the equivalence class's
/// representative rank, tagged with the full interval of ranks that share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintedLine {
    pub ranks: Interval,
    pub text: String,
}

fn render_record(rec: &crate::mi::record::Record) -> String {
    if let Some(text) = &rec.text {
        return text.clone();
    }
    let subtypes = rec.subtypes.join(",");
    let fields: Vec<String> =
        rec.fields.iter().map(|(k, v)| format!("{k}={}", render_value(v))).collect();
    format!("{:?}[{subtypes}] {}", rec.record_type, fields.join(" "))
}

fn render_value(v: &crate::mi::record::Value) -> String {
    match v {
        crate::mi::record::Value::Str(s) => s.clone(),
        crate::mi::record::Value::Tuple(t) => {
            format!("{{{}}}", t.iter().map(|(k, v)| format!("{k}={}", render_value(v))).collect::<Vec<_>>().join(","))
        }
        crate::mi::record::Value::List(l) => {
            format!("[{}]", l.iter().map(render_value).collect::<Vec<_>>().join(","))
        }
    }
}

/// Picks the largest equivalence class in a batch (by rank count) and
/// renders its representative, per spec.md §4.5 Running-phase handling of
/// an incoming batch.
pub fn largest_class(batch: &[AggregatedRecord]) -> Option<PrintedLine> {
    let winner = batch.iter().max_by_key(|r| r.ids().count())?;
    let vid = winner.ids().smallest()?;
    Some(PrintedLine { ranks: winner.ids().clone(), text: render_record(&winner.record_for(vid)) })
}

/// Renders every equivalence class in a batch, used by `expand [n]`.
pub fn expand_classes(batch: &[AggregatedRecord]) -> Vec<PrintedLine> {
    batch
        .iter()
        .filter_map(|r| {
            let vid = r.ids().smallest()?;
            Some(PrintedLine { ranks: r.ids().clone(), text: render_record(&r.record_for(vid)) })
        })
        .collect()
}

/// Front-end session state: the rank target a bare command defaults to, the
/// bounded batch history, and startup join tracking.
pub struct Frontend {
    pub phase: FrontendPhase,
    pub world_size: i64,
    pub default_target: Interval,
    /// Ranks temporarily excluded from bare (unprefixed) command dispatch
    /// by the shell's `block`/`unblock` verbs.
    pub blocked: Interval,
    pub history: History,
    pub join_tracker: JoinTracker,
}

impl Frontend {
    pub fn new(world_size: i64, history_length: usize) -> Self {
        Frontend {
            phase: FrontendPhase::Init,
            world_size,
            default_target: Interval::range_closed(0, world_size.saturating_sub(1)),
            blocked: Interval::empty(),
            history: History::new(history_length),
            join_tracker: JoinTracker::new(world_size.max(0) as usize),
        }
    }

    pub fn block(&mut self, ranks: &Interval) {
        self.blocked = self.blocked.union(ranks);
    }

    pub fn unblock(&mut self, ranks: &Interval) {
        self.blocked = self.blocked.difference(ranks);
    }

    /// Resolves one line of shell input into the target interval a command
    /// should be dispatched to and the remaining command text. A bare
    /// (unprefixed) command excludes blocked ranks; an explicit `proc`
    /// prefix overrides blocking entirely.
    pub fn resolve_target(&self, line: &str) -> Result<(Interval, &str), RankSpecError> {
        let (spec, rest) = split_proc_prefix(line);
        match spec {
            Some(spec) => Ok((parse_rank_spec(spec, self.world_size)?, rest)),
            None => Ok((self.default_target.difference(&self.blocked), rest)),
        }
    }

    /// Handles one incoming aggregated batch: prints the largest class and
    /// archives the whole batch in history. Returns the printed line, if
    /// the batch was non-empty.
    pub fn on_batch(&mut self, batch: Vec<AggregatedRecord>) -> Option<PrintedLine> {
        let printed = largest_class(&batch);
        self.history.push(batch);
        printed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::record::{Record, RecordType, Value};

    fn stopped(rank: i64) -> AggregatedRecord {
        let record = Record {
            record_type: RecordType::AsyncExec,
            subtypes: vec!["stopped".into()],
            token: None,
            fields: vec![("reason".into(), Value::Str("breakpoint-hit".into()))],
            text: None,
        };
        AggregatedRecord::new(record, rank)
    }

    #[test]
    fn parse_rank_spec_handles_all_list_and_ranges() {
        assert_eq!(parse_rank_spec("all", 8).unwrap(), Interval::range_closed(0, 7));
        assert_eq!(parse_rank_spec("-1", 8).unwrap(), Interval::range_closed(0, 7));
        assert_eq!(parse_rank_spec("1,3,5-7", 8).unwrap(), Interval::build(vec![(1, 1), (3, 3), (5, 7)], false));
    }

    #[test]
    fn parse_rank_spec_rejects_inverted_ranges() {
        assert!(parse_rank_spec("5-1", 8).is_err());
    }

    #[test]
    fn split_proc_prefix_extracts_spec_and_remainder() {
        assert_eq!(split_proc_prefix("proc 1-4 continue"), (Some("1-4"), "continue"));
        assert_eq!(split_proc_prefix("continue"), (None, "continue"));
    }

    #[test]
    fn history_overwrites_oldest_entry_once_full() {
        let mut history = History::new(2);
        history.push(vec![stopped(0)]);
        history.push(vec![stopped(1)]);
        history.push(vec![stopped(2)]);
        assert_eq!(history.len(), 2);
        assert!(history.get(0).unwrap().batch[0].ids().contains(1));
    }

    #[test]
    fn on_batch_prints_the_larger_equivalence_class() {
        let mut fe = Frontend::new(4, 8);
        let mut small = stopped(0);
        small.merge(stopped(1)).unwrap();
        let big_single = stopped(2);
        let printed = fe.on_batch(vec![small, big_single]).unwrap();
        assert!(printed.ranks.contains(0) && printed.ranks.contains(1));
        assert_eq!(fe.history.len(), 1);
    }
}
