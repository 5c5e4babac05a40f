use std::fmt;

use chrono::Local;

use crate::core::types::EventFilter;

const SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];
const MAX_LOGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Events,
    Alerts,
}

impl fmt::Display for Pane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pane::Events => write!(f, "events"),
            Pane::Alerts => write!(f, "alerts"),
        }
    }
}

/// Local UI state; everything fetched lives in the views.
pub struct App {
    pub focus: Pane,
    pub severity: Option<&'static str>,
    pub logs: Vec<String>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            focus: Pane::Events,
            severity: None,
            logs: vec!["[SYSTEM] dashboard started".to_string()],
        }
    }

    pub fn switch_focus(&mut self) {
        self.focus = match self.focus {
            Pane::Events => Pane::Alerts,
            Pane::Alerts => Pane::Events,
        };
        self.log(format!("focus: {}", self.focus));
    }

    /// any -> low -> medium -> high -> critical -> any. Returns the new events filter.
    pub fn cycle_severity(&mut self) -> EventFilter {
        self.severity = match self.severity {
            None => Some(SEVERITIES[0]),
            Some(current) => SEVERITIES
                .iter()
                .position(|s| *s == current)
                .and_then(|i| SEVERITIES.get(i + 1))
                .copied(),
        };
        self.log(format!(
            "severity filter: {}",
            self.severity.unwrap_or("any")
        ));
        EventFilter {
            severity: self.severity.map(str::to_string),
            ..EventFilter::default()
        }
    }

    pub fn log(&mut self, msg: impl Into<String>) {
        self.logs
            .push(format!("[{}] {}", Local::now().format("%H:%M:%S"), msg.into()));
        if self.logs.len() > MAX_LOGS {
            self.logs.remove(0);
        }
    }
}

/// Offset of the page after the one at `offset`, if there is one.
pub fn next_page(offset: u64, limit: u64, total: u64) -> Option<u64> {
    let next = offset + limit;
    (next < total).then_some(next)
}

/// Offset of the page before the one at `offset`, if there is one.
pub fn prev_page(offset: u64, limit: u64) -> Option<u64> {
    (offset > 0).then(|| offset.saturating_sub(limit))
}

/// "21-25 of 40", or "0 of 0" for an empty collection.
pub fn page_label(offset: u64, len: usize, total: u64) -> String {
    if len == 0 {
        return format!("0 of {}", total);
    }
    format!("{}-{} of {}", offset + 1, offset + len as u64, total)
}
