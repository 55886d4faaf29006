//! Lexes and parses a single logical line of GDB/MI output into a typed
//! [`Record`]. The parser never raises: anything it cannot make sense of
//! becomes [`RecordType::Unknown`] carrying the original text, per spec.

use super::record::{Record, RecordType, Value};

const TERMINATOR: &str = "(gdb)";

/// Parse a full chunk of debugger output (one or more `\n`-delimited
/// logical lines) into a sequence of records. The terminator token is
/// discarded; it does not produce a record.
pub fn parse_stream(src: &str) -> Vec<Record> {
    src.lines().filter(|l| !l.trim().is_empty()).filter_map(|l| parse_line(l.trim())).collect()
}

/// Parse a single logical line. Returns `None` only for the terminator
/// line; any other unparseable input yields `Some(Record::unknown(..))`.
pub fn parse_line(line: &str) -> Option<Record> {
    if line == TERMINATOR {
        return None;
    }
    Some(try_parse_line(line).unwrap_or_else(|_| Record::unknown(line)))
}

struct ParseError;

fn try_parse_line(line: &str) -> Result<Record, ParseError> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    let token_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    let token = if i > token_start {
        Some(chars[token_start..i].iter().collect::<String>().parse::<u64>().map_err(|_| ParseError)?)
    } else {
        None
    };
    if i >= chars.len() {
        return Err(ParseError);
    }
    let symbol = chars[i];
    i += 1;
    let rest: String = chars[i..].iter().collect();

    match symbol {
        '^' => parse_result_record(token, &rest),
        '*' => parse_async_record(RecordType::AsyncExec, token, &rest),
        '+' => parse_async_record(RecordType::AsyncStatus, token, &rest),
        '=' => parse_async_record(RecordType::AsyncNotify, token, &rest),
        '~' => parse_stream_record(RecordType::StreamConsole, &rest),
        '@' => parse_stream_record(RecordType::StreamTarget, &rest),
        '&' => parse_stream_record(RecordType::StreamLog, &rest),
        _ => Err(ParseError),
    }
}

const RESULT_CLASSES: &[&str] = &["done", "running", "connected", "error", "exit"];

fn parse_result_record(token: Option<u64>, src: &str) -> Result<Record, ParseError> {
    let (class, after) = take_identifier(src);
    if class.is_empty() || !RESULT_CLASSES.contains(&class) {
        return Err(ParseError);
    }
    let fields = if let Some(rest) = after.strip_prefix(',') {
        parse_result_list(rest)?
    } else if after.is_empty() {
        Vec::new()
    } else {
        return Err(ParseError);
    };
    Ok(Record {
        record_type: RecordType::Result,
        subtypes: vec![class.to_string()],
        token,
        fields,
        text: None,
    })
}

fn parse_async_record(
    record_type: RecordType,
    token: Option<u64>,
    src: &str,
) -> Result<Record, ParseError> {
    let (class, after) = take_identifier(src);
    let fields = if let Some(rest) = after.strip_prefix(',') {
        // Historical oddity: `=traceframe-changed,end` carries a bare `end`
        // marker rather than a result list.
        if rest == "end" { Vec::new() } else { parse_result_list(rest)? }
    } else if after.is_empty() {
        Vec::new()
    } else {
        return Err(ParseError);
    };
    let mut subtypes = if class.is_empty() { Vec::new() } else { vec![class.to_string()] };
    if record_type == RecordType::AsyncExec && class == "stopped" {
        if let Some(reason) = fields.iter().find(|(n, _)| n == "reason").and_then(|(_, v)| v.as_str()) {
            if let Some(mapped) = exec_stopped_reason(reason) {
                subtypes.push(mapped.to_string());
            }
        }
    }
    Ok(Record { record_type, subtypes, token, fields, text: None })
}

/// Maps a `*stopped` record's `reason=` value onto its specific subtype,
/// mirroring `gdbmi_identifier.py`'s `exec_stopped_iders` table.
fn exec_stopped_reason(reason: &str) -> Option<&'static str> {
    const TABLE: &[(&str, &str)] = &[
        ("breakpoint-hit", "breakpoint-hit"),
        ("watchpoint-trigger", "watchpoint-trigger"),
        ("access-watchpoint-trigger", "access-watchpoint-trigger"),
        ("read-watchpoint-trigger", "read-watchpoint-trigger"),
        ("watchpoint-scope", "watchpoint-scope"),
        ("end-stepping-range", "step-done"),
        ("exit-signalled", "exit-signal"),
        ("exited", "exited"),
        ("exited-normally", "normal-exit"),
        ("signal-received", "signal-received"),
        ("location-reached", "location-reached"),
        ("function-finished", "function-finished"),
    ];
    TABLE.iter().find(|(k, _)| *k == reason).map(|(_, v)| *v)
}

fn parse_stream_record(record_type: RecordType, src: &str) -> Result<Record, ParseError> {
    let (s, after) = parse_const(src)?;
    if !after.is_empty() {
        return Err(ParseError);
    }
    Ok(Record { record_type, subtypes: Vec::new(), token: None, fields: Vec::new(), text: Some(s) })
}

/// Takes a leading identifier (`[a-zA-Z0-9_-]*`), returning it and the rest.
fn take_identifier(src: &str) -> (&str, &str) {
    let end = src
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        .map(|(idx, _)| idx)
        .unwrap_or(src.len());
    (&src[..end], &src[end..])
}

/// Parses a `name=value` list delimited by top-level commas into an ordered
/// vector, collapsing repeated names into a [`Value::List`].
fn parse_result_list(src: &str) -> Result<Vec<(String, Value)>, ParseError> {
    let mut out: Vec<(String, Value)> = Vec::new();
    let mut rest = src;
    loop {
        if rest.is_empty() {
            break;
        }
        let eq = find_top_level(rest, '=').ok_or(ParseError)?;
        let name = &rest[..eq];
        if name.is_empty() {
            return Err(ParseError);
        }
        let value_src = &rest[eq + 1..];
        let (value_text, remainder) = split_top_level_entry(value_src)?;
        let value = parse_value(value_text)?;
        insert_result(&mut out, name, value);
        rest = remainder;
    }
    Ok(out)
}

/// Splits off one value's text from the start of `src`, up to (not
/// including) the next top-level comma, returning the remaining text after
/// that comma (or the empty string if this was the last entry).
fn split_top_level_entry(src: &str) -> Result<(&str, &str), ParseError> {
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut prev_escape = false;
    for (idx, c) in src.char_indices() {
        match c {
            '{' | '[' if !in_quote => depth += 1,
            '}' | ']' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err(ParseError);
                }
            }
            '"' if !prev_escape => in_quote = !in_quote,
            ',' if depth == 0 && !in_quote => {
                return Ok((&src[..idx], &src[idx + 1..]));
            }
            _ => {}
        }
        prev_escape = c == '\\' && !prev_escape;
    }
    if depth != 0 || in_quote {
        return Err(ParseError);
    }
    Ok((src, ""))
}

/// Finds the first unquoted, depth-0 occurrence of `target` in `src`.
fn find_top_level(src: &str, target: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut prev_escape = false;
    for (idx, c) in src.char_indices() {
        if c == target && depth == 0 && !in_quote {
            return Some(idx);
        }
        match c {
            '{' | '[' if !in_quote => depth += 1,
            '}' | ']' if !in_quote => depth -= 1,
            '"' if !prev_escape => in_quote = !in_quote,
            _ => {}
        }
        prev_escape = c == '\\' && !prev_escape;
    }
    None
}

fn insert_result(out: &mut Vec<(String, Value)>, name: &str, value: Value) {
    if let Some(existing) = out.iter_mut().find(|(n, _)| n == name) {
        match &mut existing.1 {
            Value::List(items) => items.push(value),
            other => {
                let prev = std::mem::replace(other, Value::Str(String::new()));
                *other = Value::List(vec![prev, value]);
            }
        }
    } else {
        out.push((name.to_string(), value));
    }
}

fn parse_value(src: &str) -> Result<Value, ParseError> {
    match src.chars().next() {
        Some('{') => parse_tuple(src),
        Some('[') => parse_list(src),
        Some('"') => parse_const(src).map(|(s, rest)| {
            debug_assert!(rest.is_empty());
            Value::Str(s)
        }),
        _ => Err(ParseError),
    }
}

fn parse_tuple(src: &str) -> Result<Value, ParseError> {
    if src == "{}" {
        return Ok(Value::Tuple(Vec::new()));
    }
    if !src.starts_with('{') || !src.ends_with('}') {
        return Err(ParseError);
    }
    let inner = &src[1..src.len() - 1];
    Ok(Value::Tuple(parse_result_list(inner)?))
}

fn parse_list(src: &str) -> Result<Value, ParseError> {
    if src == "[]" {
        return Ok(Value::List(Vec::new()));
    }
    if !src.starts_with('[') || !src.ends_with(']') {
        return Err(ParseError);
    }
    let inner = &src[1..src.len() - 1];
    // A `[...]` body is parsed as a list of values; the first unquoted `=`
    // at depth 0 reclassifies the whole body as a result list. We switch
    // state in place rather than rescanning from the top.
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut prev_escape = false;
    for (idx, c) in inner.char_indices() {
        match c {
            '{' | '[' if !in_quote => depth += 1,
            '}' | ']' if !in_quote => depth -= 1,
            '"' if !prev_escape => in_quote = !in_quote,
            '=' if depth == 0 && !in_quote => {
                let _ = idx;
                return Ok(Value::Tuple(parse_result_list(inner)?));
            }
            _ => {}
        }
        prev_escape = c == '\\' && !prev_escape;
    }
    if depth != 0 || in_quote {
        return Err(ParseError);
    }
    let mut values = Vec::new();
    let mut rest = inner;
    while !rest.is_empty() {
        let (entry, remainder) = split_top_level_entry(rest)?;
        values.push(parse_value(entry)?);
        rest = remainder;
    }
    Ok(Value::List(values))
}

/// Parses a `"..."` string, stripping the surrounding quotes and keeping
/// the content verbatim (no C-escape interpretation beyond recognizing that
/// `\"` does not terminate the string). Returns the string and whatever
/// text follows the closing quote.
fn parse_const(src: &str) -> Result<(String, &str), ParseError> {
    let mut chars = src.char_indices();
    match chars.next() {
        Some((_, '"')) => {}
        _ => return Err(ParseError),
    }
    let mut prev_escape = false;
    for (idx, c) in chars {
        if c == '"' && !prev_escape {
            return Ok((src[1..idx].to_string(), &src[idx + 1..]));
        }
        prev_escape = c == '\\' && !prev_escape;
    }
    Err(ParseError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_4_breakpoint_hit_result() {
        let line = r#"^done,bkpt={number="1",type="breakpoint",enabled="y",addr="0x400500",func="main",file="a.c",line="10"}"#;
        let rec = parse_line(line).unwrap();
        assert_eq!(rec.record_type, RecordType::Result);
        assert_eq!(rec.result_class(), Some("done"));
        let bkpt = rec.field("bkpt").unwrap().as_tuple().unwrap();
        let get = |n: &str| bkpt.iter().find(|(k, _)| k == n).unwrap().1.as_str().unwrap();
        assert_eq!(get("number"), "1");
        assert_eq!(get("line"), "10");
    }

    #[test]
    fn idempotent_reparse_is_equal() {
        let line = r#"*stopped,reason="breakpoint-hit",bkptno="1",thread-id="1",stopped-threads="all",core="0""#;
        let rec1 = parse_line(line).unwrap();
        let rec2 = parse_line(line).unwrap();
        assert_eq!(rec1, rec2);
        assert_eq!(rec1.async_reason(), Some("breakpoint-hit"));
        assert_eq!(rec1.breakpoint_id(), Some("1"));
        assert_eq!(rec1.thread_id(), Some("1"));
        assert_eq!(rec1.core(), Some("0"));
    }

    #[test]
    fn two_independent_parses_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let line = r#"^done,bkpt={number="1",line="10"}"#;
        let a = parse_line(line).unwrap();
        let b = parse_line(line).unwrap();
        let mut ha = DefaultHasher::new();
        a.hash(&mut ha);
        let mut hb = DefaultHasher::new();
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn stream_records_keep_text_verbatim() {
        let rec = parse_line(r#"~"Starting program\n""#).unwrap();
        assert_eq!(rec.record_type, RecordType::StreamConsole);
        assert_eq!(rec.text.as_deref(), Some("Starting program\\n"));
    }

    #[test]
    fn escaped_quote_does_not_terminate_string() {
        let rec = parse_line(r#"~"she said \"hi\"""#).unwrap();
        assert_eq!(rec.text.as_deref(), Some(r#"she said \"hi\""#));
    }

    #[test]
    fn repeated_names_collapse_to_list() {
        let rec = parse_line(r#"=bp-group,p="a",p="b",p="c""#).unwrap();
        let v = rec.field("p").unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn unbalanced_braces_become_unknown() {
        let line = r#"^done,bkpt={number="1""#;
        let rec = parse_line(line).unwrap();
        assert_eq!(rec.record_type, RecordType::Unknown);
        assert_eq!(rec.text.as_deref(), Some(line));
    }

    #[test]
    fn unterminated_string_becomes_unknown() {
        let line = r#"~"no closing quote"#;
        let rec = parse_line(line).unwrap();
        assert_eq!(rec.record_type, RecordType::Unknown);
    }

    #[test]
    fn stray_tokens_become_unknown_without_panicking() {
        let line = "this is not mi output at all";
        let rec = parse_line(line).unwrap();
        assert_eq!(rec.record_type, RecordType::Unknown);
    }

    #[test]
    fn terminator_line_produces_no_record() {
        assert!(parse_line("(gdb)").is_none());
    }

    #[test]
    fn parse_stream_splits_multiple_lines() {
        let src = "^done\n(gdb)\n*stopped,reason=\"exited-normally\"\n";
        let recs = parse_stream(src);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].record_type, RecordType::Result);
        assert_eq!(recs[1].record_type, RecordType::AsyncExec);
    }

    #[test]
    fn token_correlates_with_command() {
        let rec = parse_line(r#"42^done"#).unwrap();
        assert_eq!(rec.token, Some(42));
    }

    #[test]
    fn nested_list_of_tuples_parses() {
        let line = r#"^done,threads=[{id="1",state="stopped"},{id="2",state="running"}]"#;
        let rec = parse_line(line).unwrap();
        let threads = rec.field("threads").unwrap().as_list().unwrap();
        assert_eq!(threads.len(), 2);
    }
}
