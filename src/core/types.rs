use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::SyncError;

/// A server record with a stable identity.
pub trait Record: Clone + Send + 'static {
    type Id: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    fn record_id(&self) -> Self::Id;
}

/// Raw security event as produced by the ingestion side. Never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub category: String,
    pub severity: String,
    pub description: String,
}

impl Record for SecurityEvent {
    type Id = String;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub severity_filter: Option<String>,
    pub category_filter: Option<String>,
    pub source_filter: Option<String>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// Display-only preview of the server matcher. Severity and category
    /// compare case-insensitively, source is a case-insensitive substring.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(sev) = non_empty(&self.severity_filter) {
            if !event.severity.eq_ignore_ascii_case(sev) {
                return false;
            }
        }
        if let Some(cat) = non_empty(&self.category_filter) {
            if !event.category.eq_ignore_ascii_case(cat) {
                return false;
            }
        }
        if let Some(src) = non_empty(&self.source_filter) {
            if !event
                .source
                .to_lowercase()
                .contains(&src.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Which rules would catch one event.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuleMatch {
    pub event_id: String,
    pub severity: String,
    pub category: String,
    pub source: String,
    pub rule_ids: Vec<i64>,
    pub rule_names: Vec<String>,
}

/// Run every active rule's matcher over `events`, one entry per event.
pub fn preview_matches(rules: &[AlertRule], events: &[SecurityEvent]) -> Vec<RuleMatch> {
    events
        .iter()
        .map(|event| {
            let hits: Vec<&AlertRule> = rules
                .iter()
                .filter(|rule| rule.is_active && rule.matches(event))
                .collect();
            RuleMatch {
                event_id: event.id.clone(),
                severity: event.severity.clone(),
                category: event.category.clone(),
                source: event.source.clone(),
                rule_ids: hits.iter().map(|rule| rule.id).collect(),
                rule_names: hits.iter().map(|rule| rule.name.clone()).collect(),
            }
        })
        .collect()
}

impl Record for AlertRule {
    type Id = i64;

    fn record_id(&self) -> i64 {
        self.id
    }
}

/// Body for rule create and rule update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertRuleCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity_filter: Option<String>,
    #[serde(default)]
    pub category_filter: Option<String>,
    #[serde(default)]
    pub source_filter: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl AlertRuleCreate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            severity_filter: None,
            category_filter: None,
            source_filter: None,
            is_active: true,
        }
    }

    /// Create body: trimmed, blank optional fields become absent.
    pub fn normalized(self) -> Self {
        let mut rule = self.trimmed();
        for field in [
            &mut rule.description,
            &mut rule.severity_filter,
            &mut rule.category_filter,
            &mut rule.source_filter,
        ] {
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
        rule
    }

    /// Update body: trimmed only. The server leaves absent fields untouched,
    /// so an empty string is the way to clear a filter.
    pub fn trimmed(mut self) -> Self {
        self.name = self.name.trim().to_string();
        for field in [
            &mut self.description,
            &mut self.severity_filter,
            &mut self.category_filter,
            &mut self.source_filter,
        ] {
            if let Some(value) = field {
                *value = value.trim().to_string();
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation("rule name must not be empty".into()));
        }
        Ok(())
    }
}

impl From<&AlertRule> for AlertRuleCreate {
    fn from(rule: &AlertRule) -> Self {
        Self {
            name: rule.name.clone(),
            description: rule.description.clone(),
            severity_filter: rule.severity_filter.clone(),
            category_filter: rule.category_filter.clone(),
            source_filter: rule.source_filter.clone(),
            is_active: rule.is_active,
        }
    }
}

fn default_active() -> bool {
    true
}

/// Alert status as reported by the server. Unknown values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    FalsePositive,
    Other(String),
}

impl AlertStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
            AlertStatus::Other(s) => s.as_str(),
        }
    }

    /// Terminal states get no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive)
    }

    pub fn all() -> [AlertStatus; 4] {
        [
            AlertStatus::Open,
            AlertStatus::Investigating,
            AlertStatus::Resolved,
            AlertStatus::FalsePositive,
        ]
    }
}

impl From<String> for AlertStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "open" => AlertStatus::Open,
            "investigating" => AlertStatus::Investigating,
            "resolved" => AlertStatus::Resolved,
            "false_positive" => AlertStatus::FalsePositive,
            _ => AlertStatus::Other(value),
        }
    }
}

impl From<&str> for AlertStatus {
    fn from(value: &str) -> Self {
        AlertStatus::from(value.to_string())
    }
}

impl From<AlertStatus> for String {
    fn from(value: AlertStatus) -> Self {
        match value {
            AlertStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub event_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub event_source: String,
    pub event_category: String,
    pub event_severity: String,
    pub event_description: String,
    pub status: AlertStatus,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Record for Alert {
    type Id = i64;

    fn record_id(&self) -> i64 {
        self.id
    }
}

/// Partial alert update. Absent fields are left unchanged by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AlertStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AlertUpdate {
    pub fn status(status: impl Into<AlertStatus>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.assigned_to.is_none() && self.notes.is_none()
    }
}

/// One server page of a filtered collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl<T> Page<T> {
    /// Checks the pagination invariants against the request that produced the page.
    pub fn validate(&self, offset: u64, limit: u64) -> Result<(), SyncError> {
        let len = self.items.len() as u64;
        if len > limit {
            return Err(SyncError::InvalidPage(format!(
                "{} items exceed limit {}",
                len, limit
            )));
        }
        if len > 0 && offset + len > self.total {
            return Err(SyncError::InvalidPage(format!(
                "offset {} + {} items exceeds total {}",
                offset, len, self.total
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummarySnapshot {
    pub total: u64,
    #[serde(default)]
    pub by_severity: BTreeMap<String, u64>,
    #[serde(default)]
    pub by_category: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
}

impl SummarySnapshot {
    pub fn high_and_critical(&self) -> u64 {
        self.by_severity.get("high").copied().unwrap_or(0)
            + self.by_severity.get("critical").copied().unwrap_or(0)
    }

    pub fn category_count(&self) -> usize {
        self.by_category.len()
    }
}

/// ATT&CK technique as served by `/api/mitre`. Descriptions arrive truncated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MitreTechnique {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `T1059`-style identifier; empty when the server has none.
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// ATT&CK tactic with the techniques in its kill-chain phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MitreTactic {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub techniques: Vec<MitreTechnique>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MitreTactics {
    pub tactics: Vec<MitreTactic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheCleared {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub severity: Option<String>,
    pub category: Option<String>,
    pub source: Option<String>,
}

impl EventFilter {
    pub fn severity(value: impl Into<String>) -> Self {
        Self {
            severity: Some(value.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<String>,
    pub rule_id: Option<i64>,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    pub is_active: Option<bool>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(severity: &str, category: &str, source: &str) -> SecurityEvent {
        SecurityEvent {
            id: "ev-1".into(),
            timestamp: Utc::now(),
            source: source.into(),
            category: category.into(),
            severity: severity.into(),
            description: "test".into(),
        }
    }

    fn rule() -> AlertRule {
        AlertRule {
            id: 1,
            name: "high network".into(),
            description: None,
            severity_filter: Some("HIGH".into()),
            category_filter: Some("network".into()),
            source_filter: Some("fire".into()),
            is_active: true,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rule_filters_are_a_conjunction() {
        let r = rule();
        assert!(r.matches(&event("high", "Network", "Firewall-01")));
        assert!(!r.matches(&event("low", "network", "Firewall-01")));
        assert!(!r.matches(&event("high", "endpoint", "Firewall-01")));
        assert!(!r.matches(&event("high", "network", "EDR")));
    }

    #[test]
    fn absent_rule_filters_match_anything() {
        let mut r = rule();
        r.severity_filter = None;
        r.category_filter = Some(String::new());
        r.source_filter = None;
        assert!(r.matches(&event("low", "endpoint", "EDR")));
    }

    #[test]
    fn status_round_trips_unknown_values() {
        let parsed: AlertStatus = serde_json::from_str("\"escalated\"").unwrap();
        assert_eq!(parsed, AlertStatus::Other("escalated".into()));
        assert!(!parsed.is_terminal());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"escalated\"");
        assert!(AlertStatus::from("false_positive").is_terminal());
        assert!(AlertStatus::Resolved.is_terminal());
        assert!(!AlertStatus::Investigating.is_terminal());
    }

    #[test]
    fn alert_update_omits_absent_fields() {
        let body = serde_json::to_value(AlertUpdate::status("resolved")).unwrap();
        assert_eq!(body, serde_json::json!({ "status": "resolved" }));
    }

    #[test]
    fn rule_create_normalizes_blank_fields() {
        let mut create = AlertRuleCreate::new("  brute force ");
        create.severity_filter = Some("  ".into());
        create.source_filter = Some("ssh".into());
        let create = create.normalized();
        assert_eq!(create.name, "brute force");
        assert_eq!(create.severity_filter, None);
        assert_eq!(create.source_filter.as_deref(), Some("ssh"));
        assert!(create.validate().is_ok());
        assert!(AlertRuleCreate::new(" ").validate().is_err());
    }

    #[test]
    fn rule_update_keeps_empty_filters_to_clear_them() {
        let mut update = AlertRuleCreate::new(" brute force");
        update.severity_filter = Some(" ".into());
        update.source_filter = Some(" sshd ".into());
        let update = update.trimmed();
        assert_eq!(update.name, "brute force");
        assert_eq!(update.severity_filter.as_deref(), Some(""));
        assert_eq!(update.source_filter.as_deref(), Some("sshd"));
        assert_eq!(update.category_filter, None);
    }

    #[test]
    fn preview_lists_active_rules_per_event() {
        let high = rule();
        let mut anything = rule();
        anything.id = 2;
        anything.name = "anything".into();
        anything.severity_filter = None;
        anything.category_filter = None;
        anything.source_filter = None;
        let mut disabled = anything.clone();
        disabled.id = 3;
        disabled.is_active = false;

        let mut quiet = event("low", "endpoint", "EDR");
        quiet.id = "ev-2".into();
        let events = [event("high", "network", "firewall-01"), quiet];
        let preview = preview_matches(&[high, anything, disabled], &events);

        assert_eq!(preview.len(), 2);
        assert_eq!(preview[0].event_id, "ev-1");
        assert_eq!(preview[0].rule_ids, vec![1, 2]);
        assert_eq!(preview[0].rule_names, vec!["high network", "anything"]);
        assert_eq!(preview[1].rule_ids, vec![2]);
    }

    #[test]
    fn page_validation_rejects_overrun() {
        let page = Page {
            items: vec![1, 2, 3],
            total: 4,
            offset: 2,
            limit: 3,
        };
        assert!(page.validate(2, 3).is_err());
        assert!(page.validate(1, 3).is_ok());
        assert!(page.validate(1, 2).is_err());
        let drifted: Page<u8> = Page {
            items: vec![],
            total: 3,
            offset: 50,
            limit: 25,
        };
        assert!(drifted.validate(50, 25).is_ok());
    }

    #[test]
    fn summary_helpers_count_missing_keys_as_zero() {
        let mut snap = SummarySnapshot::default();
        snap.by_severity.insert("high".into(), 12);
        snap.by_category.insert("network".into(), 5);
        snap.by_category.insert("endpoint".into(), 7);
        assert_eq!(snap.high_and_critical(), 12);
        assert_eq!(snap.category_count(), 2);
    }
}
