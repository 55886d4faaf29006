//! Variable objects and the bounded depth-first search that populates them
//! (spec.md §3 "Variable object", §4.5 "Varprint protocol").

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mi::record::Record;

/// How GDB wants a dynamic value's children rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayHint {
    String,
    Array,
    Map,
    None,
}

impl DisplayHint {
    pub fn from_str(s: &str) -> DisplayHint {
        match s {
            "string" => DisplayHint::String,
            "array" => DisplayHint::Array,
            "map" => DisplayHint::Map,
            _ => DisplayHint::None,
        }
    }
}

const PSEUDOCHILDREN: [&str; 3] = ["public", "protected", "private"];

/// A lazy, dotted-path view of a debugger value. Children are kept in an
/// ordered map so insertion order (GDB's reporting order) survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarObj {
    pub name: String,
    pub vartype: Option<String>,
    pub value: Option<String>,
    pub display_hint: DisplayHint,
    pub is_dynamic: bool,
    pub num_child: u64,
    pub children: Vec<(String, VarObj)>,
    pub listed: bool,
    pub more_children: bool,
}

impl VarObj {
    pub fn new(name: impl Into<String>, vartype: Option<String>) -> Self {
        VarObj {
            name: name.into(),
            vartype,
            value: None,
            display_hint: DisplayHint::None,
            is_dynamic: false,
            num_child: 0,
            children: Vec::new(),
            listed: false,
            more_children: false,
        }
    }

    /// The final dotted segment of this object's name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn is_pseudochild(&self) -> bool {
        PSEUDOCHILDREN.contains(&self.short_name())
    }

    /// Looks up a direct child by its short name, transparently descending
    /// through `public`/`protected`/`private` pseudo-children (spec.md §3).
    pub fn get_child(&self, short_name: &str) -> Option<&VarObj> {
        if let Some((_, child)) = self.children.iter().find(|(n, _)| n == short_name) {
            return Some(child);
        }
        for pseudo in PSEUDOCHILDREN {
            if let Some((_, p)) = self.children.iter().find(|(n, _)| n == pseudo) {
                if let Some((_, child)) = p.children.iter().find(|(n, _)| n == short_name) {
                    return Some(child);
                }
            }
        }
        None
    }

    fn get_child_mut(&mut self, short_name: &str) -> Option<&mut VarObj> {
        if self.children.iter().any(|(n, _)| n == short_name) {
            return self.children.iter_mut().find(|(n, _)| n == short_name).map(|(_, c)| c);
        }
        for pseudo in PSEUDOCHILDREN {
            if self.children.iter().any(|(n, _)| n == pseudo) {
                let p = &mut self.children.iter_mut().find(|(n, _)| n == pseudo).unwrap().1;
                if p.children.iter().any(|(n, _)| n == short_name) {
                    return p.children.iter_mut().find(|(n, _)| n == short_name).map(|(_, c)| c);
                }
            }
        }
        None
    }

    fn set_child(&mut self, short_name: String, child: VarObj) {
        if let Some(existing) = self.children.iter_mut().find(|(n, _)| *n == short_name) {
            existing.1 = child;
        } else {
            self.children.push((short_name, child));
        }
    }

    fn remove_child(&mut self, short_name: &str) {
        self.children.retain(|(n, _)| n != short_name);
    }

    /// Builds a variable object from a GDB `var-create`/child-listing
    /// result record's fields (`name`, `type`, `value`, `numchild`, …).
    pub fn from_record_fields(fields: &[(String, crate::mi::record::Value)]) -> Option<VarObj> {
        let find = |key: &str| fields.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.as_str());
        let name = find("name")?.to_string();
        let num_child: u64 = find("numchild").and_then(|s| s.parse().ok()).unwrap_or(0);
        let mut v = VarObj::new(name, find("type").map(str::to_string));
        v.value = find("value").map(str::to_string);
        v.display_hint = find("displayhint").map(DisplayHint::from_str).unwrap_or(DisplayHint::None);
        v.is_dynamic = find("dynamic").map(|s| s == "1" || s == "true").unwrap_or(false);
        v.num_child = num_child;
        Some(v)
    }
}

/// The per-rank table of top-level variable objects, keyed by the base
/// name a session created. Children are kept nested inside their parent.
#[derive(Debug, Clone, Default)]
pub struct VarObjTable {
    roots: HashMap<String, VarObj>,
}

impl VarObjTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dotted_name: &str) -> Option<&VarObj> {
        let mut parts = dotted_name.split('.');
        let mut cur = self.roots.get(parts.next()?)?;
        for part in parts {
            cur = cur.get_child(part)?;
        }
        Some(cur)
    }

    pub fn get_mut(&mut self, dotted_name: &str) -> Option<&mut VarObj> {
        let mut parts = dotted_name.split('.');
        let mut cur = self.roots.get_mut(parts.next()?)?;
        for part in parts {
            cur = cur.get_child_mut(part)?;
        }
        Some(cur)
    }

    /// The deepest variable object this table already has on `dotted_name`'s
    /// path, even if `dotted_name` itself is not yet known.
    pub fn lowest_ancestor(&self, dotted_name: &str) -> Option<&VarObj> {
        let mut parts = dotted_name.split('.');
        let mut cur = self.roots.get(parts.next()?)?;
        for part in parts {
            match cur.get_child(part) {
                Some(child) => cur = child,
                None => return Some(cur),
            }
        }
        Some(cur)
    }

    /// Inserts a newly created variable object at `dotted_name`, attaching
    /// it to its parent (which must already be present for non-root names).
    pub fn insert(&mut self, dotted_name: &str, obj: VarObj) -> bool {
        match dotted_name.rsplit_once('.') {
            None => {
                self.roots.insert(dotted_name.to_string(), obj);
                true
            }
            Some((parent_name, short)) => match self.get_mut(parent_name) {
                Some(parent) => {
                    parent.set_child(short.to_string(), obj);
                    true
                }
                None => false,
            },
        }
    }

    pub fn remove(&mut self, dotted_name: &str) -> bool {
        match dotted_name.rsplit_once('.') {
            None => self.roots.remove(dotted_name).is_some(),
            Some((parent_name, short)) => match self.get_mut(parent_name) {
                Some(parent) => {
                    parent.remove_child(short);
                    true
                }
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarprintError(pub String);

impl fmt::Display for VarprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "varprint protocol error: {}", self.0)
    }
}
impl std::error::Error for VarprintError {}

/// Depth/children/sibling caps bounding a varprint DFS (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct VarprintLimits {
    pub max_depth: usize,
    pub max_children: usize,
    pub max_siblings: usize,
}

impl Default for VarprintLimits {
    fn default() -> Self {
        VarprintLimits { max_depth: 5, max_children: 60, max_siblings: 128 }
    }
}

/// One entry of a varprint request's DFS stack: the name of the variable
/// object still awaiting a `var-list-children` reply, and its depth
/// relative to the request's root.
#[derive(Debug, Clone)]
struct Frame {
    name: String,
    depth: usize,
}

/// The state of one in-flight varprint request, identified by the token
/// its next GDB command was issued under. Lives in the per-rank
/// record-handler table until the DFS completes.
#[derive(Debug, Clone)]
pub struct VarprintSession {
    pub target_name: String,
    pub branch_depth: usize,
    limits: VarprintLimits,
    stack: Vec<Frame>,
}

impl VarprintSession {
    /// Starts a session whose first frame is `root_name` (either the
    /// requested name itself, freshly created in GDB, or the closest known
    /// ancestor already in the table).
    pub fn new(root_name: impl Into<String>, target_name: impl Into<String>, limits: VarprintLimits) -> Self {
        let target_name = target_name.into();
        let branch_depth = limits.max_depth + target_name.matches('.').count() + 1;
        VarprintSession {
            target_name,
            branch_depth,
            limits,
            stack: vec![Frame { name: root_name.into(), depth: 0 }],
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }

    /// The variable object whose children the next `var-list-children`
    /// command should request.
    pub fn pending_list_target(&self) -> Option<&str> {
        self.stack.last().map(|f| f.name.as_str())
    }

    fn same_branch(&self, name: &str) -> bool {
        let strip = |n: &str| -> Vec<&str> { n.split('.').filter(|p| !PSEUDOCHILDREN.contains(p)).collect() };
        let a = strip(name);
        let b = strip(&self.target_name);
        a.iter().zip(b.iter()).all(|(x, y)| x == y)
    }

    /// Applies one `var-list-children` reply: attaches each reported child
    /// to the parent popped off the stack, pushing back any child that
    /// qualifies for further expansion under the bounded-DFS rules.
    ///
    /// Returns `Ok(true)` once the whole search is exhausted (the caller
    /// should then read the finished object back out of the table),
    /// `Ok(false)` if another `var-list-children` round is needed.
    pub fn advance(&mut self, table: &mut VarObjTable, record: &Record) -> Result<bool, VarprintError> {
        let frame = self.stack.pop().ok_or_else(|| VarprintError("DFS stack underflow".into()))?;
        if let Some(parent) = table.get_mut(&frame.name) {
            parent.listed = true;
        }
        if record.field("has_more").is_none() {
            return Err(VarprintError("var-list-children reply missing has_more".into()));
        }
        let children = record.field("children").and_then(|v| v.as_list()).map(<[_]>::to_vec).unwrap_or_default();
        let total = children.len();
        if total > self.limits.max_children {
            if let Some(parent) = table.get_mut(&frame.name) {
                parent.more_children = true;
            }
        }
        // A wide fan-out still gets every child attached (up to
        // max_children); only its own further expansion is suppressed.
        let too_many_siblings = total > self.limits.max_siblings;

        for child_value in children.into_iter().take(self.limits.max_children) {
            let fields = match child_value.as_tuple() {
                Some(t) => t,
                None => continue,
            };
            let child = match VarObj::from_record_fields(fields) {
                Some(c) => c,
                None => continue,
            };
            let child_name = child.name.clone();
            let num_child = child.num_child;
            let is_dynamic = child.is_dynamic;
            let is_pseudo = child.is_pseudochild();
            let is_null_pointer = child
                .vartype
                .as_deref()
                .map(|t| t.ends_with('*'))
                .unwrap_or(false)
                && child.value.as_deref().and_then(parse_pointer_value).map(|v| v == 0).unwrap_or(false);

            if !table.insert(&child_name, child) {
                continue;
            }

            if (num_child > 0 || is_dynamic) && !is_null_pointer && !too_many_siblings {
                let within_depth = frame.depth <= self.limits.max_depth
                    || (self.same_branch(&child_name) && frame.depth <= self.branch_depth)
                    || is_pseudo;
                if within_depth {
                    self.stack.push(Frame { name: child_name, depth: frame.depth + 1 });
                }
            }
        }
        Ok(self.stack.is_empty())
    }
}

fn parse_pointer_value(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::record::{RecordType, Value};

    fn list_children_record(has_more: &str, children: Vec<(&str, &str, u64)>) -> Record {
        let list: Vec<Value> = children
            .into_iter()
            .map(|(name, vartype, numchild)| {
                Value::Tuple(vec![
                    ("name".into(), Value::Str(name.into())),
                    ("type".into(), Value::Str(vartype.into())),
                    ("numchild".into(), Value::Str(numchild.to_string())),
                ])
            })
            .collect();
        Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: Some(1),
            fields: vec![("has_more".into(), Value::Str(has_more.into())), ("children".into(), Value::List(list))],
            text: None,
        }
    }

    #[test]
    fn varobj_table_inserts_and_resolves_nested_children() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct foo".into())));
        table.insert("v.x", VarObj::new("v.x", Some("int".into())));
        assert!(table.get("v.x").is_some());
        assert!(table.get("v.y").is_none());
    }

    #[test]
    fn pseudo_children_are_transparently_resolved() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct foo".into())));
        table.insert("v.public", VarObj::new("v.public", None));
        table.insert("v.public.x", VarObj::new("v.public.x", Some("int".into())));
        let v = table.get("v").unwrap();
        assert!(v.get_child("x").is_some());
    }

    #[test]
    fn dfs_caps_children_at_the_configured_max_and_flags_more_children() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct big".into())));
        let limits = VarprintLimits { max_children: 60, ..VarprintLimits::default() };
        let mut session = VarprintSession::new("v", "v", limits);

        let children: Vec<(&str, &str, u64)> =
            (0..200).map(|i| (Box::leak(format!("v.f{i}").into_boxed_str()) as &str, "int", 0)).collect();
        let record = list_children_record("1", children);
        let done = session.advance(&mut table, &record).unwrap();
        assert!(done);

        let v = table.get("v").unwrap();
        assert_eq!(v.children.len(), 60);
        assert!(v.more_children);
    }

    #[test]
    fn dfs_descends_into_children_that_declare_their_own_children() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct foo".into())));
        let mut session = VarprintSession::new("v", "v", VarprintLimits::default());

        let record = list_children_record("0", vec![("v.inner", "struct bar", 2)]);
        let done = session.advance(&mut table, &record).unwrap();
        assert!(!done);
        assert_eq!(session.pending_list_target(), Some("v.inner"));

        let record2 = list_children_record("0", vec![("v.inner.a", "int", 0), ("v.inner.b", "int", 0)]);
        let done2 = session.advance(&mut table, &record2).unwrap();
        assert!(done2);

        let v = table.get("v").unwrap();
        let inner = v.get_child("inner").unwrap();
        assert_eq!(inner.children.len(), 2);
    }

    #[test]
    fn missing_has_more_field_is_a_protocol_error() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct foo".into())));
        let mut session = VarprintSession::new("v", "v", VarprintLimits::default());
        let bad = Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: Some(1),
            fields: vec![],
            text: None,
        };
        assert!(session.advance(&mut table, &bad).is_err());
    }

    #[test]
    fn null_pointer_children_are_not_expanded() {
        let mut table = VarObjTable::new();
        table.insert("v", VarObj::new("v", Some("struct foo".into())));
        let mut session = VarprintSession::new("v", "v", VarprintLimits::default());
        let mut children_val = Value::Tuple(vec![
            ("name".into(), Value::Str("v.ptr".into())),
            ("type".into(), Value::Str("struct bar *".into())),
            ("numchild".into(), Value::Str("1".into())),
            ("value".into(), Value::Str("0x0".into())),
        ]);
        // from_record_fields reads `value` too; extend the helper record directly.
        if let Value::Tuple(fields) = &mut children_val {
            fields.push(("value".into(), Value::Str("0x0".into())));
        }
        let record = Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: Some(1),
            fields: vec![
                ("has_more".into(), Value::Str("0".into())),
                ("children".into(), Value::List(vec![children_val])),
            ],
            text: None,
        };
        let done = session.advance(&mut table, &record).unwrap();
        assert!(done);
        let v = table.get("v").unwrap();
        assert!(v.get_child("ptr").is_some());
    }
}
