//! Canonical query strings for filter + pagination requests.
//!
//! Only non-empty filter values are emitted, in the filter's declared field
//! order, followed by `offset` and then `limit`. Absent pagination values are
//! left out so the server's own defaults apply.

use crate::core::types::{AlertFilter, EventFilter, RuleFilter};

/// A filter that can render itself as ordered query pairs.
pub trait QueryFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)>;
}

impl QueryFilter for EventFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_str(&mut pairs, "severity", &self.severity);
        push_str(&mut pairs, "category", &self.category);
        push_str(&mut pairs, "source", &self.source);
        pairs
    }
}

impl QueryFilter for AlertFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_str(&mut pairs, "status", &self.status);
        // rule ids start at 1; zero is treated as unset
        if let Some(rule_id) = self.rule_id.filter(|id| *id != 0) {
            pairs.push(("rule_id", rule_id.to_string()));
        }
        push_str(&mut pairs, "assigned_to", &self.assigned_to);
        pairs
    }
}

impl QueryFilter for RuleFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self.is_active {
            Some(active) => vec![("is_active", active.to_string())],
            None => Vec::new(),
        }
    }
}

/// Encode without a leading `?`.
pub fn encode<F: QueryFilter + ?Sized>(filter: &F, offset: Option<u64>, limit: Option<u64>) -> String {
    let mut pairs = filter.query_pairs();
    if let Some(offset) = offset {
        pairs.push(("offset", offset.to_string()));
    }
    if let Some(limit) = limit {
        pairs.push(("limit", limit.to_string()));
    }
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", form_escape(k), form_escape(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `""` for an empty query, `"?..."` otherwise.
pub fn with_prefix<F: QueryFilter + ?Sized>(
    filter: &F,
    offset: Option<u64>,
    limit: Option<u64>,
) -> String {
    let query = encode(filter, offset, limit);
    if query.is_empty() {
        query
    } else {
        format!("?{}", query)
    }
}

fn push_str(pairs: &mut Vec<(&'static str, String)>, key: &'static str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        pairs.push((key, v.to_string()));
    }
}

// application/x-www-form-urlencoded, byte for byte what URLSearchParams emits
fn form_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'*' | b'-' | b'.' | b'_' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
