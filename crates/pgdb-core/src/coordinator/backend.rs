//! Back-end state machine: one per rank, a single cooperative loop driven
//! by its binary's event loop (spec.md §4.5, §5).

use std::collections::HashMap;
use std::fmt;

use crate::mi::record::Record;
use crate::mi::{self, AggregatedRecord};
use crate::transport::overlay::FilterSet;

use super::varobj::{VarObj, VarObjTable, VarprintError, VarprintLimits, VarprintSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Init,
    /// Absorbing the debugger's startup chatter before it reaches a prompt.
    Startup,
    Running,
    Shutdown,
}

/// A continuation registered against a token this back-end issued to GDB;
/// dispatched when the matching reply record arrives (spec.md §9).
enum Continuation {
    /// Awaiting the `var-create` reply that starts a fresh varprint DFS.
    VarCreate { target_name: String },
    /// Awaiting a `var-list-children` reply mid-DFS.
    ListChildren { session: VarprintSession },
    /// Awaiting a `var-update` reply before resuming a varprint request.
    VarUpdate { target_name: String },
}

/// The outcome of feeding one MI record through a back-end: records to
/// forward upward as aggregated output, and/or a varprint result.
#[derive(Debug, Default)]
pub struct BackendStep {
    pub out_batch: Vec<AggregatedRecord>,
    pub varprint_result: Option<(String, Result<VarObj, String>)>,
    /// A follow-up GDB command a continuation needs issued immediately
    /// (e.g. `var-list-children` right after `var-create`), correlated by
    /// the token already registered for its reply.
    pub pending_command: Option<(u64, String)>,
}

pub struct Backend {
    pub phase: BackendPhase,
    pub rank: i64,
    varobjs: VarObjTable,
    continuations: HashMap<u64, Continuation>,
    next_token: u64,
    pub filters: FilterSet,
    pub limits: VarprintLimits,
}

impl Backend {
    pub fn new(rank: i64) -> Self {
        Backend {
            phase: BackendPhase::Init,
            rank,
            varobjs: VarObjTable::new(),
            continuations: HashMap::new(),
            next_token: 1,
            filters: FilterSet::new(),
            limits: VarprintLimits::default(),
        }
    }

    fn issue_token(&mut self) -> u64 {
        let t = self.next_token;
        self.next_token += 1;
        t
    }

    /// Parses one line of raw debugger output and, unless it is suppressed
    /// by the filter set or consumed by a registered continuation, wraps it
    /// as a single-rank aggregated record ready to go upward.
    pub fn ingest_line(&mut self, line: &str) -> BackendStep {
        let mut step = BackendStep::default();
        let Some(record) = mi::parse_line(line) else {
            return step;
        };
        if let Some(token) = record.token {
            if let Some(continuation) = self.continuations.remove(&token) {
                self.apply_continuation(continuation, &record, &mut step);
                return step;
            }
        }
        if self.filters.blocks(&record.subtypes) {
            return step;
        }
        step.out_batch.push(AggregatedRecord::new(record, self.rank));
        step
    }

    fn apply_continuation(&mut self, continuation: Continuation, record: &Record, step: &mut BackendStep) {
        match continuation {
            Continuation::VarCreate { target_name } => self.on_var_created(target_name, record, step),
            Continuation::ListChildren { session } => self.on_list_children(session, record, step),
            Continuation::VarUpdate { target_name } => self.on_var_updated(target_name, record, step),
        }
    }

    /// Begins a varprint request for `dotted_name` per spec.md §4.5 step 1:
    /// issues `var-update` first so any pending changelist is applied before
    /// the DFS (if any) runs against current data.
    pub fn varprint_request(&mut self, dotted_name: &str) -> (u64, String) {
        let token = self.issue_token();
        self.continuations.insert(token, Continuation::VarUpdate { target_name: dotted_name.to_string() });
        (token, "-var-update 1 *".to_string())
    }

    /// Applies one `var-update` changelist entry: out-of-scope or
    /// type-changed variables are deleted; otherwise value/display-hint/
    /// dynamic-flag changes are applied in place (spec.md §4.5 step 1).
    pub fn apply_var_update_change(&mut self, change: &[(String, crate::mi::record::Value)]) {
        use crate::mi::record::Value;
        let find = |key: &str| change.iter().find(|(k, _)| k == key).map(|(_, v)| v);
        let Some(name) = find("name").and_then(Value::as_str) else { return };
        let name = name.to_string();
        if let Some(scope) = find("in_scope").and_then(Value::as_str) {
            if scope == "false" || scope == "invalid" {
                self.varobjs.remove(&name);
                return;
            }
        }
        if find("type_changed").and_then(Value::as_str) == Some("true") {
            self.varobjs.remove(&name);
            return;
        }
        if let Some(obj) = self.varobjs.get_mut(&name) {
            if let Some(v) = find("value").and_then(Value::as_str) {
                obj.value = Some(v.to_string());
            }
            if let Some(v) = find("displayhint").and_then(Value::as_str) {
                obj.display_hint = super::varobj::DisplayHint::from_str(v);
            }
            if let Some(v) = find("dynamic").and_then(Value::as_str) {
                obj.is_dynamic = v == "1" || v == "true";
            }
        }
    }

    /// Starts a varprint request for `dotted_name`: returns the GDB command
    /// text to issue and the token to register it under, or `None` if the
    /// table already has a fully-listed object to answer with immediately
    /// (the caller should treat that as the varprint result).
    pub fn start_varprint(&mut self, dotted_name: &str) -> VarprintOutcome {
        if let Some(obj) = self.varobjs.get(dotted_name) {
            if obj.listed && !obj.more_children {
                return VarprintOutcome::Immediate(obj.clone());
            }
            let limits = VarprintLimits { max_children: usize::MAX, ..self.limits };
            let mut session = VarprintSession::new(dotted_name, dotted_name, limits);
            let list_target = session.pending_list_target().unwrap_or(dotted_name).to_string();
            let token = self.issue_token();
            self.continuations.insert(token, Continuation::ListChildren { session });
            return VarprintOutcome::Command {
                token,
                text: format!("-var-list-children 1 \"{list_target}\""),
            };
        }
        if let Some(ancestor) = self.varobjs.lowest_ancestor(dotted_name) {
            let name = ancestor.name.clone();
            let session = VarprintSession::new(name.clone(), dotted_name, self.limits);
            let token = self.issue_token();
            self.continuations.insert(token, Continuation::ListChildren { session });
            return VarprintOutcome::Command { token, text: format!("-var-list-children 1 \"{name}\"") };
        }
        let base = dotted_name.split('.').next().unwrap_or(dotted_name);
        let token = self.issue_token();
        self.continuations.insert(token, Continuation::VarCreate { target_name: dotted_name.to_string() });
        VarprintOutcome::Command { token, text: format!("-var-create {base} * {base}") }
    }

    fn on_var_created(&mut self, target_name: String, record: &Record, step: &mut BackendStep) {
        let Some(obj) = VarObj::from_record_fields(&record.fields) else {
            step.varprint_result = Some((target_name, Err("bad variable name".into())));
            return;
        };
        let name = obj.name.clone();
        let num_child = obj.num_child;
        let is_dynamic = obj.is_dynamic;
        self.varobjs.insert(&name, obj);
        if num_child == 0 && !is_dynamic {
            let result = self.varobjs.get(&name).cloned();
            step.varprint_result = Some((
                target_name,
                result.ok_or_else(|| "variable disappeared immediately after creation".to_string()),
            ));
            return;
        }
        let session = VarprintSession::new(name.clone(), target_name.clone(), self.limits);
        let token = self.issue_token();
        self.continuations.insert(token, Continuation::ListChildren { session });
        step.pending_command = Some((token, format!("-var-list-children 1 \"{name}\"")));
    }

    fn on_list_children(&mut self, mut session: VarprintSession, record: &Record, step: &mut BackendStep) {
        match session.advance(&mut self.varobjs, record) {
            Ok(true) => {
                let target = session.target_name.clone();
                let result = self
                    .varobjs
                    .get(&target)
                    .cloned()
                    .ok_or_else(|| "variable does not exist".to_string());
                step.varprint_result = Some((target, result));
            }
            Ok(false) => {
                let list_target = session.pending_list_target().unwrap_or(&session.target_name).to_string();
                let token = self.issue_token();
                self.continuations.insert(token, Continuation::ListChildren { session });
                step.pending_command = Some((token, format!("-var-list-children 1 \"{list_target}\"")));
            }
            Err(VarprintError(msg)) => {
                step.varprint_result = Some((session.target_name, Err(msg)));
            }
        }
    }

    fn on_var_updated(&mut self, target_name: String, record: &Record, step: &mut BackendStep) {
        if let Some(changelist) = record.field("changelist").and_then(|v| v.as_list()) {
            for change in changelist.to_vec() {
                if let Some(fields) = change.as_tuple() {
                    self.apply_var_update_change(fields);
                }
            }
        }
        match self.start_varprint(&target_name) {
            VarprintOutcome::Immediate(obj) => step.varprint_result = Some((target_name, Ok(obj))),
            VarprintOutcome::Command { token, text } => step.pending_command = Some((token, text)),
        }
    }

    pub fn varobjs(&self) -> &VarObjTable {
        &self.varobjs
    }
}

/// What a back-end should do next after [`Backend::start_varprint`].
pub enum VarprintOutcome {
    /// The table already has a complete answer; no GDB round-trip needed.
    Immediate(VarObj),
    /// Issue `text` to GDB and correlate the reply with `token`.
    Command { token: u64, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError(pub String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "back-end error: {}", self.0)
    }
}
impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_line_wraps_a_plain_record_for_its_own_rank() {
        let mut be = Backend::new(3);
        let step = be.ingest_line(r#"*stopped,reason="breakpoint-hit",bkptno="1""#);
        assert_eq!(step.out_batch.len(), 1);
        assert!(step.out_batch[0].ids().contains(3));
    }

    #[test]
    fn filtered_subtype_produces_no_output() {
        let mut be = Backend::new(0);
        be.filters.add(["breakpoint-hit".to_string()]);
        let step = be.ingest_line(r#"*stopped,reason="breakpoint-hit""#);
        assert!(step.out_batch.is_empty());
    }

    #[test]
    fn start_varprint_for_unknown_name_issues_var_create() {
        let mut be = Backend::new(0);
        match be.start_varprint("x") {
            VarprintOutcome::Command { text, .. } => assert!(text.contains("-var-create")),
            VarprintOutcome::Immediate(_) => panic!("expected a command"),
        }
    }

    #[test]
    fn a_leaf_variable_resolves_without_listing_children() {
        let mut be = Backend::new(0);
        let token = match be.start_varprint("x") {
            VarprintOutcome::Command { token, .. } => token,
            VarprintOutcome::Immediate(_) => panic!("expected a command"),
        };
        let reply = Record {
            record_type: crate::mi::record::RecordType::Result,
            subtypes: vec!["done".into()],
            token: Some(token),
            fields: vec![
                ("name".into(), crate::mi::record::Value::Str("x".into())),
                ("type".into(), crate::mi::record::Value::Str("int".into())),
                ("value".into(), crate::mi::record::Value::Str("5".into())),
                ("numchild".into(), crate::mi::record::Value::Str("0".into())),
            ],
            text: None,
        };
        let step = be.ingest_line(&format!(
            "{}^done,name=\"x\",type=\"int\",value=\"5\",numchild=\"0\"",
            token
        ));
        let _ = reply;
        assert!(step.varprint_result.is_some());
        let (name, result) = step.varprint_result.unwrap();
        assert_eq!(name, "x");
        assert_eq!(result.unwrap().value.as_deref(), Some("5"));
    }
}
