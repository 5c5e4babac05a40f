use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::core::error::SyncError;
use crate::core::types::{AlertFilter, AlertRuleCreate, AlertStatus, AlertUpdate, EventFilter};

#[derive(Parser, Debug)]
#[command(
    name = "socwatch",
    version,
    about = "SOC dashboard client for security events, alerts and alert rules"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (TOML). Default: config/socwatch.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// API origin, overrides the config file
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Bearer token (falls back to SOCWATCH_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Machine API key (falls back to SOCWATCH_API_KEY)
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Increase verbosity (debug, trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log file path
    #[arg(long, global = true, default_value = "data/socwatch.log")]
    pub log_file: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List one page of security events
    Events {
        #[command(flatten)]
        filter: EventFilterArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Show the event summary, optionally refreshing it until Ctrl-C
    Summary {
        #[command(flatten)]
        filter: EventFilterArgs,
        /// Keep polling and print every refreshed snapshot
        #[arg(long)]
        watch: bool,
    },
    /// List one page of alerts
    Alerts {
        #[command(flatten)]
        filter: AlertFilterArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Change status, assignee or notes of an alert
    UpdateAlert {
        id: i64,
        /// open | investigating | resolved | false_positive
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        assign: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List alert rules
    Rules {
        /// Only active (true) or inactive (false) rules
        #[arg(long)]
        active: Option<bool>,
    },
    /// Create an alert rule
    CreateRule {
        #[command(flatten)]
        fields: RuleFields,
        /// Create the rule disabled
        #[arg(long)]
        inactive: bool,
    },
    /// Replace the fields of an alert rule
    UpdateRule {
        id: i64,
        #[command(flatten)]
        fields: RuleFields,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Delete an alert rule
    DeleteRule { id: i64 },
    /// Show which active rules would catch each event of a page
    PreviewRules {
        #[command(flatten)]
        filter: EventFilterArgs,
        #[command(flatten)]
        page: PageArgs,
    },
    /// MITRE ATT&CK tactics (or techniques) known to the server
    Mitre {
        /// Flat technique list instead of tactics
        #[arg(long)]
        techniques: bool,
        /// Drop the server's cached ATT&CK data first
        #[arg(long)]
        clear_cache: bool,
    },
    /// Terminal dashboard with summary, events and alerts
    Dashboard,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EventFilterArgs {
    #[arg(long)]
    pub severity: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
}

impl From<EventFilterArgs> for EventFilter {
    fn from(args: EventFilterArgs) -> Self {
        EventFilter {
            severity: args.severity,
            category: args.category,
            source: args.source,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct AlertFilterArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub rule_id: Option<i64>,
    #[arg(long)]
    pub assigned_to: Option<String>,
}

impl From<AlertFilterArgs> for AlertFilter {
    fn from(args: AlertFilterArgs) -> Self {
        AlertFilter {
            status: args.status,
            rule_id: args.rule_id,
            assigned_to: args.assigned_to,
        }
    }
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct PageArgs {
    #[arg(long)]
    pub offset: Option<u64>,
    /// Page size (1-500); defaults to the configured size
    #[arg(long)]
    pub limit: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RuleFields {
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Match events of this severity ("" clears it on update)
    #[arg(long)]
    pub severity: Option<String>,
    /// Match events of this category ("" clears it on update)
    #[arg(long)]
    pub category: Option<String>,
    /// Match events whose source contains this text ("" clears it on update)
    #[arg(long)]
    pub source: Option<String>,
}

impl RuleFields {
    /// Overlay the given fields on `base`; unspecified ones keep their value.
    pub fn merge_into(self, mut base: AlertRuleCreate) -> AlertRuleCreate {
        if let Some(name) = self.name {
            base.name = name;
        }
        if self.description.is_some() {
            base.description = self.description;
        }
        if self.severity.is_some() {
            base.severity_filter = self.severity;
        }
        if self.category.is_some() {
            base.category_filter = self.category;
        }
        if self.source.is_some() {
            base.source_filter = self.source;
        }
        base
    }
}

/// Build the PATCH body; `--status` must be one of the known lifecycle states.
pub fn alert_update(
    status: Option<String>,
    assign: Option<String>,
    notes: Option<String>,
) -> Result<AlertUpdate, SyncError> {
    let status = status.map(AlertStatus::from);
    if let Some(AlertStatus::Other(raw)) = &status {
        let all = AlertStatus::all();
        let known: Vec<&str> = all.iter().map(AlertStatus::as_str).collect();
        return Err(SyncError::Validation(format!(
            "unknown status '{}', expected one of: {}",
            raw,
            known.join(", ")
        )));
    }
    Ok(AlertUpdate {
        status,
        assigned_to: assign,
        notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "socwatch",
            "events",
            "--severity",
            "high",
            "--limit",
            "10",
            "--base-url",
            "http://soc.local",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("http://soc.local"));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Events { filter, page } => {
                assert_eq!(EventFilter::from(filter), EventFilter::severity("high"));
                assert_eq!(page.limit, Some(10));
                assert_eq!(page.offset, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rule_fields_only_override_given_values() {
        let mut base = AlertRuleCreate::new("ssh brute force");
        base.source_filter = Some("sshd".into());
        let fields = RuleFields {
            severity: Some("critical".into()),
            ..RuleFields::default()
        };
        let merged = fields.merge_into(base);
        assert_eq!(merged.name, "ssh brute force");
        assert_eq!(merged.severity_filter.as_deref(), Some("critical"));
        assert_eq!(merged.source_filter.as_deref(), Some("sshd"));
    }

    #[test]
    fn update_alert_flags_build_partial_update() {
        let update = alert_update(Some("resolved".into()), None, None).unwrap();
        assert_eq!(update, AlertUpdate::status("resolved"));
        assert!(alert_update(None, None, None).unwrap().is_empty());
    }

    #[test]
    fn update_alert_rejects_unknown_status() {
        let err = alert_update(Some("closed".into()), None, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: unknown status 'closed', expected one of: open, investigating, resolved, false_positive"
        );
    }

    #[test]
    fn parses_preview_and_mitre_commands() {
        let cli = Cli::try_parse_from(["socwatch", "preview-rules", "--severity", "high", "--limit", "5"])
            .unwrap();
        match cli.command {
            Command::PreviewRules { filter, page } => {
                assert_eq!(filter.severity.as_deref(), Some("high"));
                assert_eq!(page.limit, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["socwatch", "mitre", "--techniques", "--clear-cache"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Mitre {
                techniques: true,
                clear_cache: true
            }
        ));
    }
}
