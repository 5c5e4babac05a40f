//! Typed bindings for the dashboard HTTP API.
//!
//! Each binding is a cheap handle over a shared [`Transport`] and doubles as
//! the page source, summary source or record writer the views consume.

use std::sync::Arc;

use reqwest::Method;
use tracing::info;

use crate::core::editor::RecordWriter;
use crate::core::error::SyncError;
use crate::core::query::with_prefix;
use crate::core::summary::SummarySource;
use crate::core::transport::Transport;
use crate::core::types::{
    Alert, AlertFilter, AlertRule, AlertRuleCreate, AlertUpdate, CacheCleared, EventFilter,
    MitreTactic, MitreTactics, MitreTechnique, Page, RuleFilter, SecurityEvent, SummarySnapshot,
};
use crate::core::view::PageSource;

#[derive(Clone)]
pub struct EventsApi {
    transport: Arc<Transport>,
}

impl EventsApi {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, SyncError> {
        let path = format!("/api/events/{}", with_prefix(filter, None, None));
        self.transport.get(&path).await
    }

    pub async fn fetch_events_paged(
        &self,
        filter: &EventFilter,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Page<SecurityEvent>, SyncError> {
        let path = format!("/api/events/paged{}", with_prefix(filter, offset, limit));
        self.transport.get(&path).await
    }

    pub async fn fetch_summary(&self, filter: &EventFilter) -> Result<SummarySnapshot, SyncError> {
        let path = format!("/api/events/summary{}", with_prefix(filter, None, None));
        self.transport.get(&path).await
    }
}

impl PageSource for EventsApi {
    type Filter = EventFilter;
    type Item = SecurityEvent;

    async fn fetch_page(
        &self,
        filter: &EventFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Page<SecurityEvent>, SyncError> {
        self.fetch_events_paged(filter, Some(offset), Some(limit))
            .await
    }
}

impl SummarySource for EventsApi {
    type Filter = EventFilter;

    async fn fetch_summary(&self, filter: &EventFilter) -> Result<SummarySnapshot, SyncError> {
        EventsApi::fetch_summary(self, filter).await
    }
}

#[derive(Clone)]
pub struct AlertsApi {
    transport: Arc<Transport>,
}

impl AlertsApi {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub async fn fetch_alerts(
        &self,
        filter: &AlertFilter,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Page<Alert>, SyncError> {
        let path = format!("/api/alerts/{}", with_prefix(filter, offset, limit));
        self.transport.get(&path).await
    }

    pub async fn get_alert(&self, id: i64) -> Result<Alert, SyncError> {
        self.transport.get(&format!("/api/alerts/{}", id)).await
    }

    pub async fn update_alert(&self, id: i64, update: &AlertUpdate) -> Result<Alert, SyncError> {
        let alert: Alert = self
            .transport
            .request(Method::PATCH, &format!("/api/alerts/{}", id), Some(update))
            .await?;
        info!("alert {} is now {}", alert.id, alert.status);
        Ok(alert)
    }
}

impl PageSource for AlertsApi {
    type Filter = AlertFilter;
    type Item = Alert;

    async fn fetch_page(
        &self,
        filter: &AlertFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Alert>, SyncError> {
        self.fetch_alerts(filter, Some(offset), Some(limit)).await
    }
}

impl RecordWriter<Alert> for AlertsApi {
    type Patch = AlertUpdate;

    async fn write(&self, id: &i64, patch: &AlertUpdate) -> Result<Alert, SyncError> {
        self.update_alert(*id, patch).await
    }
}

#[derive(Clone)]
pub struct RulesApi {
    transport: Arc<Transport>,
}

impl RulesApi {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>, SyncError> {
        let path = format!("/api/alerts/rules/{}", with_prefix(filter, None, None));
        self.transport.get(&path).await
    }

    pub async fn get_rule(&self, id: i64) -> Result<AlertRule, SyncError> {
        self.transport
            .get(&format!("/api/alerts/rules/{}", id))
            .await
    }

    /// Rejects a blank name before anything is sent.
    pub async fn create_rule(&self, rule: AlertRuleCreate) -> Result<AlertRule, SyncError> {
        let rule = rule.normalized();
        rule.validate()?;
        let created: AlertRule = self
            .transport
            .request(Method::POST, "/api/alerts/rules/", Some(&rule))
            .await?;
        info!("created rule {} ({})", created.id, created.name);
        Ok(created)
    }

    /// `null` fields are left unchanged by the server; send `""` to clear a filter.
    pub async fn update_rule(&self, id: i64, rule: AlertRuleCreate) -> Result<AlertRule, SyncError> {
        let rule = rule.trimmed();
        rule.validate()?;
        self.transport
            .request(
                Method::PATCH,
                &format!("/api/alerts/rules/{}", id),
                Some(&rule),
            )
            .await
    }

    pub async fn delete_rule(&self, id: i64) -> Result<(), SyncError> {
        self.transport
            .request_empty(
                Method::DELETE,
                &format!("/api/alerts/rules/{}", id),
                None::<&()>,
            )
            .await?;
        info!("deleted rule {}", id);
        Ok(())
    }
}

impl PageSource for RulesApi {
    type Filter = RuleFilter;
    type Item = AlertRule;

    /// The rules endpoint is not paginated; the window is cut locally.
    async fn fetch_page(
        &self,
        filter: &RuleFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Page<AlertRule>, SyncError> {
        let rules = self.list_rules(filter).await?;
        Ok(slice_page(rules, offset, limit))
    }
}

impl RecordWriter<AlertRule> for RulesApi {
    type Patch = AlertRuleCreate;

    async fn write(&self, id: &i64, patch: &AlertRuleCreate) -> Result<AlertRule, SyncError> {
        self.update_rule(*id, patch.clone()).await
    }
}

/// ATT&CK reference data. The server fetches and caches it upstream.
#[derive(Clone)]
pub struct MitreApi {
    transport: Arc<Transport>,
}

impl MitreApi {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Tactics in kill-chain order, each with its techniques.
    pub async fn tactics(&self) -> Result<Vec<MitreTactic>, SyncError> {
        let body: MitreTactics = self.transport.get("/api/mitre/tactics").await?;
        Ok(body.tactics)
    }

    pub async fn techniques(&self) -> Result<Vec<MitreTechnique>, SyncError> {
        self.transport.get("/api/mitre/techniques").await
    }

    /// The next tactics or techniques call refetches upstream.
    pub async fn clear_cache(&self) -> Result<(), SyncError> {
        let reply: CacheCleared = self
            .transport
            .request(Method::POST, "/api/mitre/cache/clear", None::<&()>)
            .await?;
        info!("mitre cache cleared: {} {}", reply.status, reply.message);
        Ok(())
    }
}

/// Window `[offset, offset + limit)` of an unpaginated listing.
pub fn slice_page<T>(all: Vec<T>, offset: u64, limit: u64) -> Page<T> {
    let total = all.len() as u64;
    let items = all
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    Page {
        items,
        total,
        offset,
        limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_page_cuts_window_and_keeps_total() {
        let page = slice_page((0..7).collect::<Vec<u32>>(), 5, 5);
        assert_eq!(page.items, vec![5, 6]);
        assert_eq!(page.total, 7);
        assert!(page.validate(5, 5).is_ok());

        let past_end = slice_page(vec![1, 2], 10, 5);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 2);
    }
}
