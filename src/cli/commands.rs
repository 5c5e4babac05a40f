use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::watch;

use crate::cli::flags::{alert_update, Cli, Command, PageArgs};
use crate::config::{load_config, AppConfig, API_KEY_ENV, TOKEN_ENV};
use crate::core::api::{AlertsApi, EventsApi, MitreApi, RulesApi};
use crate::core::editor::OptimisticEditor;
use crate::core::error::SyncError;
use crate::core::summary::{spawn_polling, SummaryView};
use crate::core::transport::{CredentialProvider, Credentials, SharedCredentials, Transport};
use crate::core::types::{preview_matches, AlertFilter, AlertRuleCreate, EventFilter, RuleFilter};
use crate::core::view::{validate_limit, CollectionView};
use crate::ui::terminal::run_dashboard;

/// Resolved configuration plus the transport every command shares.
pub struct Session {
    pub config: AppConfig,
    pub transport: Arc<Transport>,
}

impl Session {
    pub fn events(&self) -> EventsApi {
        EventsApi::new(self.transport.clone())
    }

    pub fn alerts(&self) -> AlertsApi {
        AlertsApi::new(self.transport.clone())
    }

    pub fn rules(&self) -> RulesApi {
        RulesApi::new(self.transport.clone())
    }

    pub fn mitre(&self) -> MitreApi {
        MitreApi::new(self.transport.clone())
    }

    /// Apply the configured request deadline, if any.
    pub async fn deadline<T>(
        &self,
        call: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        with_deadline(self.config.request_timeout(), call).await
    }
}

pub async fn with_deadline<T>(
    deadline: Option<Duration>,
    call: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| SyncError::Timeout)?,
        None => call.await,
    }
}

pub fn build_session(cli: &Cli) -> Result<Session> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = &cli.base_url {
        config.base_url = url.clone();
    }
    config.validate()?;

    let credentials = SharedCredentials::new(resolve_credentials(
        cli.token.clone(),
        cli.api_key.clone(),
    ));
    if credentials.credentials().is_anonymous() {
        tracing::warn!("no token or API key configured; requests are unauthenticated");
    }
    let transport = Transport::new(
        config.base_url.clone(),
        &config.user_agent,
        Arc::new(credentials),
    )?;
    Ok(Session {
        config,
        transport: Arc::new(transport),
    })
}

/// Flags win over the environment.
pub fn resolve_credentials(token: Option<String>, api_key: Option<String>) -> Credentials {
    Credentials::new(
        token.or_else(|| env::var(TOKEN_ENV).ok()),
        api_key.or_else(|| env::var(API_KEY_ENV).ok()),
    )
}

pub async fn run(cli: Cli) -> Result<()> {
    let session = build_session(&cli)?;
    tracing::info!("using API at {}", session.config.base_url);

    match cli.command {
        Command::Events { filter, page } => list_events(&session, filter.into(), page).await,
        Command::Summary { filter, watch } => {
            if watch {
                watch_summary(&session, filter.into()).await
            } else {
                let snapshot = session
                    .deadline(session.events().fetch_summary(&filter.into()))
                    .await?;
                print_json(&snapshot)
            }
        }
        Command::Alerts { filter, page } => list_alerts(&session, filter.into(), page).await,
        Command::UpdateAlert {
            id,
            status,
            assign,
            notes,
        } => {
            let update = alert_update(status, assign, notes)?;
            if update.is_empty() {
                return Err(anyhow!(
                    "nothing to update; pass --status, --assign or --notes"
                ));
            }
            let api = session.alerts();
            let view = Arc::new(CollectionView::new(
                "alerts",
                api.clone(),
                AlertFilter::default(),
                session.config.alerts_page_size,
            )?);
            session.deadline(view.refresh()).await?;
            let editor = OptimisticEditor::new(view, api);
            let alert = session.deadline(editor.edit(id, update)).await?;
            print_json(&alert)
        }
        Command::Rules { active } => {
            let rules = session
                .deadline(session.rules().list_rules(&RuleFilter { is_active: active }))
                .await?;
            print_json(&rules)
        }
        Command::CreateRule { fields, inactive } => {
            let mut rule = fields.merge_into(AlertRuleCreate::new(""));
            rule.is_active = !inactive;
            let created = session.deadline(session.rules().create_rule(rule)).await?;
            print_json(&created)
        }
        Command::UpdateRule { id, fields, active } => {
            let api = session.rules();
            let current = session.deadline(api.get_rule(id)).await?;
            let mut rule = fields.merge_into(AlertRuleCreate::from(&current));
            if let Some(active) = active {
                rule.is_active = active;
            }
            let rule = rule.trimmed();
            let view = Arc::new(CollectionView::new(
                "rules",
                api.clone(),
                RuleFilter::default(),
                session.config.rules_page_size,
            )?);
            session.deadline(view.refresh()).await?;
            let editor = OptimisticEditor::new(view, api);
            let updated = session.deadline(editor.edit(id, rule)).await?;
            print_json(&updated)
        }
        Command::DeleteRule { id } => {
            session.deadline(session.rules().delete_rule(id)).await?;
            println!("deleted rule {}", id);
            Ok(())
        }
        Command::PreviewRules { filter, page } => {
            preview_rules(&session, filter.into(), page).await
        }
        Command::Mitre {
            techniques,
            clear_cache,
        } => {
            let api = session.mitre();
            if clear_cache {
                session.deadline(api.clear_cache()).await?;
            }
            if techniques {
                print_json(&session.deadline(api.techniques()).await?)
            } else {
                print_json(&session.deadline(api.tactics()).await?)
            }
        }
        Command::Dashboard => {
            run_dashboard(&session).await?;
            Ok(())
        }
    }
}

async fn list_events(session: &Session, filter: EventFilter, page: PageArgs) -> Result<()> {
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(session.config.events_page_size);
    validate_limit(limit)?;
    let result = session
        .deadline(
            session
                .events()
                .fetch_events_paged(&filter, Some(offset), Some(limit)),
        )
        .await?;
    result.validate(offset, limit)?;
    print_json(&result)
}

async fn list_alerts(session: &Session, filter: AlertFilter, page: PageArgs) -> Result<()> {
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(session.config.alerts_page_size);
    validate_limit(limit)?;
    let result = session
        .deadline(session.alerts().fetch_alerts(&filter, Some(offset), Some(limit)))
        .await?;
    result.validate(offset, limit)?;
    print_json(&result)
}

async fn preview_rules(session: &Session, filter: EventFilter, page: PageArgs) -> Result<()> {
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(session.config.events_page_size);
    validate_limit(limit)?;
    let events_api = session.events();
    let rules_api = session.rules();
    let (events, rules) = tokio::try_join!(
        session.deadline(events_api.fetch_events_paged(&filter, Some(offset), Some(limit))),
        session.deadline(rules_api.list_rules(&RuleFilter {
            is_active: Some(true)
        })),
    )?;
    events.validate(offset, limit)?;
    print_json(&preview_matches(&rules, &events.items))
}

async fn watch_summary(session: &Session, filter: EventFilter) -> Result<()> {
    let view = Arc::new(SummaryView::new(session.events(), filter.clone()));
    let mut updates = view.subscribe();
    let (_scope_tx, scope_rx) = watch::channel(filter);
    let poller = spawn_polling(view.clone(), scope_rx, session.config.summary_interval());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = view.state();
                match (&state.error, &state.snapshot) {
                    (Some(err), _) => eprintln!("{}", err),
                    (None, Some(snapshot)) => print_json(snapshot)?,
                    (None, None) => {}
                }
            }
        }
    }
    poller.stop().await;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
