//! Typed GDB/MI records produced by [`crate::mi::parser`].
//!
//! A [`Record`] is immutable once built and is the unit [`crate::mi::aggregate`]
//! operates on. Equality and hashing are defined over `(record_type, subtypes,
//! token, fields)` as required by spec so records can classify incoming
//! output by shape.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// The primary type of a parsed MI line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Result,
    AsyncExec,
    AsyncStatus,
    AsyncNotify,
    StreamConsole,
    StreamTarget,
    StreamLog,
    /// A line that could not be parsed, or whose payload did not match the
    /// expected primitive shape for a named field. Carries the original text.
    Unknown,
}

/// A generic MI value: a quoted C-escaped string, an ordered name=value
/// tuple, or a list of values. Repeated names inside a tuple collapse to a
/// [`Value::List`] per the MI grammar (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Tuple(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn tuple_field<'a>(&'a self, name: &str) -> Option<&'a Value> {
        self.as_tuple()?.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Whether this is a primitive for substitution purposes: a string, or a
    /// list whose elements are all strings.
    pub fn is_primitive(&self) -> bool {
        match self {
            Value::Str(_) => true,
            Value::List(items) => items.iter().all(|v| matches!(v, Value::Str(_))),
            Value::Tuple(_) => false,
        }
    }
}

/// Named fields a typed domain object carries. A tuple value under one of
/// these field names is an atomic substitution leaf rather than a container
/// to be walked field-by-field (spec.md §4.3: "a typed domain object (frame,
/// breakpoint, thread) treated atomically").
pub const DOMAIN_OBJECT_FIELD_NAMES: &[&str] =
    &["frame", "bkpt", "new_frame", "breakpoint", "thread"];

pub fn is_domain_object_field(name: &str) -> bool {
    DOMAIN_OBJECT_FIELD_NAMES.contains(&name)
}

/// A single parsed logical line of debugger machine-interface output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    /// Result classes (`done`, `error`, ...) and async reasons (`stopped`,
    /// `breakpoint-created`, ...) stored sorted and deduplicated, so this
    /// behaves as a canonical set for shape comparison.
    pub subtypes: Vec<String>,
    /// Decimal token correlating this line with the command that produced
    /// it, if present.
    pub token: Option<u64>,
    /// Ordered name=value fields (the `results` of a result record, or the
    /// `output` of an async record). Empty for stream records.
    pub fields: Vec<(String, Value)>,
    /// Verbatim content for stream records, or the original line for
    /// [`RecordType::Unknown`].
    pub text: Option<String>,
}

impl Record {
    pub fn unknown(original_line: impl Into<String>) -> Self {
        Record {
            record_type: RecordType::Unknown,
            subtypes: Vec::new(),
            token: None,
            fields: Vec::new(),
            text: Some(original_line.into()),
        }
    }

    pub fn has_subtype(&self, s: &str) -> bool {
        self.subtypes.iter().any(|t| t == s)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// The shape key used to decide merge compatibility: type, subtype set,
    /// and the ordered list of field names (spec.md §4.3).
    pub fn shape_key(&self) -> ShapeKey {
        ShapeKey {
            record_type: self.record_type,
            subtypes: self.subtypes.clone(),
            field_names: self.fields.iter().map(|(n, _)| n.clone()).collect(),
        }
    }

    // --- typed accessors for the fields relevant to common shapes ---

    pub fn thread_id(&self) -> Option<&str> {
        self.str_field("thread-id")
    }

    pub fn breakpoint_id(&self) -> Option<&str> {
        self.str_field("bkptno")
    }

    pub fn frame(&self) -> Option<&[(String, Value)]> {
        self.field("frame").and_then(Value::as_tuple)
    }

    pub fn stopped_threads(&self) -> Option<&Value> {
        self.field("stopped-threads")
    }

    pub fn core(&self) -> Option<&str> {
        self.str_field("core")
    }

    pub fn signal_name(&self) -> Option<&str> {
        self.str_field("signal-name")
    }

    /// The result class (`done`, `running`, `connected`, `error`, `exit`),
    /// if this is a result record.
    pub fn result_class(&self) -> Option<&str> {
        if self.record_type != RecordType::Result {
            return None;
        }
        const CLASSES: &[&str] = &["done", "running", "connected", "error", "exit"];
        self.subtypes.iter().find(|s| CLASSES.contains(&s.as_str())).map(|s| s.as_str())
    }

    /// The async reason (`stopped`, `thread-created`, ...), if this is an
    /// async record with a recognized reason subtype. When a `*stopped`
    /// record carries a specific reason (`breakpoint-hit`, ...) that reason
    /// is reported in preference to the bare `stopped` class.
    pub fn async_reason(&self) -> Option<&str> {
        match self.record_type {
            RecordType::AsyncExec | RecordType::AsyncStatus | RecordType::AsyncNotify => {
                self.subtypes.last().map(|s| s.as_str())
            }
            _ => None,
        }
    }
}

/// The tuple that decides whether two records may be merged by the
/// aggregator: `(type, frozen(subtypes), frozen(field-names))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeKey {
    pub record_type: RecordType,
    pub subtypes: Vec<String>,
    pub field_names: Vec<String>,
}

impl ShapeKey {
    /// A stable numeric fingerprint, useful for routing without storing the
    /// full key.
    pub fn fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        h.finish()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.record_type == other.record_type
            && self.subtypes == other.subtypes
            && self.token == other.token
            && self.fields == other.fields
    }
}
impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.record_type.hash(state);
        self.subtypes.hash(state);
        self.token.hash(state);
        self.fields.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_key_ignores_token_and_values() {
        let mut a = Record {
            record_type: RecordType::Result,
            subtypes: vec!["done".into()],
            token: Some(1),
            fields: vec![("bkpt".into(), Value::Str("x".into()))],
            text: None,
        };
        let mut b = a.clone();
        b.token = Some(2);
        b.fields[0].1 = Value::Str("y".into());
        assert_eq!(a.shape_key(), b.shape_key());
        a.fields.push(("extra".into(), Value::Str("z".into())));
        assert_ne!(a.shape_key(), b.shape_key());
    }

    #[test]
    fn value_primitive_classification() {
        assert!(Value::Str("x".into()).is_primitive());
        assert!(Value::List(vec![Value::Str("a".into()), Value::Str("b".into())]).is_primitive());
        assert!(!Value::List(vec![Value::Tuple(vec![])]).is_primitive());
        assert!(!Value::Tuple(vec![]).is_primitive());
    }
}
