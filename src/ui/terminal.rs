use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    cursor::Show,
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};

use crate::cli::commands::Session;
use crate::core::api::{AlertsApi, EventsApi};
use crate::core::error::SyncError;
use crate::core::summary::{spawn_polling, SummaryState, SummaryView};
use crate::core::types::{Alert, AlertFilter, EventFilter, SecurityEvent};
use crate::core::view::{CollectionView, PageSource, ViewState};
use crate::ui::app::{next_page, page_label, prev_page, App, Pane};

type EventsView = Arc<CollectionView<EventsApi>>;
type AlertsView = Arc<CollectionView<AlertsApi>>;

/// The live views one dashboard draws from.
struct Views {
    events: EventsView,
    alerts: AlertsView,
    summary: Arc<SummaryView<EventsApi>>,
}

/// Summary header, events page and alerts page over live views.
///
/// The summary poller follows the events view's filter, so cycling the
/// severity re-scopes both.
pub async fn run_dashboard(session: &Session) -> Result<(), SyncError> {
    let cfg = &session.config;
    let views = Views {
        events: Arc::new(CollectionView::new(
            "events",
            session.events(),
            EventFilter::default(),
            cfg.events_page_size,
        )?),
        alerts: Arc::new(CollectionView::new(
            "alerts",
            session.alerts(),
            AlertFilter::default(),
            cfg.alerts_page_size,
        )?),
        summary: Arc::new(SummaryView::new(session.events(), EventFilter::default())),
    };
    let poller = spawn_polling(
        views.summary.clone(),
        views.events.subscribe_filter(),
        cfg.summary_interval(),
    );

    spawn_refresh(&views.events);
    spawn_refresh(&views.alerts);

    enable_raw_mode()?;
    let outcome = with_restore(
        || {
            let mut stdout = io::stdout();
            execute!(stdout, EnterAlternateScreen)?;
            let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
            terminal.hide_cursor()?;
            drive(&mut terminal, &views, read_key)
        },
        restore_terminal,
    );
    poller.stop().await;
    outcome
}

/// Run `body`, then `restore` whether or not `body` failed. The body's error wins.
fn with_restore<T>(
    body: impl FnOnce() -> Result<T, SyncError>,
    restore: impl FnOnce() -> Result<(), SyncError>,
) -> Result<T, SyncError> {
    let outcome = body();
    let restored = restore();
    let value = outcome?;
    restored?;
    Ok(value)
}

fn restore_terminal() -> Result<(), SyncError> {
    let raw = disable_raw_mode();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen, Show)?;
    raw?;
    Ok(())
}

fn read_key() -> Result<Option<KeyCode>, SyncError> {
    if event::poll(Duration::from_millis(250))? {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                return Ok(Some(key.code));
            }
        }
    }
    Ok(None)
}

/// Draw and dispatch keys until quit or until drawing or input fails.
fn drive<B: Backend>(
    terminal: &mut Terminal<B>,
    views: &Views,
    mut next_key: impl FnMut() -> Result<Option<KeyCode>, SyncError>,
) -> Result<(), SyncError> {
    let Views {
        events,
        alerts,
        summary,
    } = views;
    let mut app = App::new();

    loop {
        let ev = events.snapshot();
        let al = alerts.snapshot();
        let sum = summary.state();
        terminal.draw(|f| draw(f, &app, &ev, &al, &sum))?;

        let Some(code) = next_key()? else {
            continue;
        };
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Tab => app.switch_focus(),
            KeyCode::Char('r') => {
                app.log("refreshing");
                spawn_refresh(events);
                spawn_refresh(alerts);
                let summary = summary.clone();
                tokio::spawn(async move {
                    let _ = summary.refresh().await;
                });
            }
            KeyCode::Char('s') => {
                let filter = app.cycle_severity();
                let view = events.clone();
                tokio::spawn(async move {
                    let _ = view.set_filter(filter).await;
                });
            }
            KeyCode::Char('n') | KeyCode::Right => match app.focus {
                Pane::Events => turn_page(&mut app, events, &ev, true),
                Pane::Alerts => turn_page(&mut app, alerts, &al, true),
            },
            KeyCode::Char('p') | KeyCode::Left => match app.focus {
                Pane::Events => turn_page(&mut app, events, &ev, false),
                Pane::Alerts => turn_page(&mut app, alerts, &al, false),
            },
            _ => {}
        }
    }
}

fn spawn_refresh<S: PageSource>(view: &Arc<CollectionView<S>>) {
    let view = view.clone();
    tokio::spawn(async move {
        // outcome is recorded on the view
        let _ = view.refresh().await;
    });
}

fn turn_page<S: PageSource>(
    app: &mut App,
    view: &Arc<CollectionView<S>>,
    state: &ViewState<S::Filter, S::Item>,
    forward: bool,
) {
    let target = if forward {
        next_page(state.offset, state.limit, state.total)
    } else {
        prev_page(state.offset, state.limit)
    };
    let Some(offset) = target else {
        return;
    };
    app.log(format!("{}: offset {}", view.name(), offset));
    let view = view.clone();
    tokio::spawn(async move {
        let _ = view.goto_page(offset).await;
    });
}

fn draw(
    f: &mut Frame<'_>,
    app: &App,
    events: &ViewState<EventFilter, SecurityEvent>,
    alerts: &ViewState<AlertFilter, Alert>,
    summary: &SummaryState<EventFilter>,
) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(4),
                Constraint::Min(8),
                Constraint::Min(8),
                Constraint::Length(6),
            ]
            .as_ref(),
        )
        .split(f.size());

    draw_summary(f, layout[0], summary);
    draw_events(f, layout[1], events, app.focus == Pane::Events);
    draw_alerts(f, layout[2], alerts, app.focus == Pane::Alerts);
    draw_footer(f, layout[3], app);
}

fn draw_summary(f: &mut Frame<'_>, area: Rect, state: &SummaryState<EventFilter>) {
    let scope = state.filter.severity.as_deref().unwrap_or("any");
    let mut lines = Vec::new();
    match &state.snapshot {
        Some(snap) => {
            lines.push(Line::from(vec![
                Span::styled("Events: ", Style::default().fg(Color::White)),
                Span::styled(
                    snap.total.to_string(),
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled("High/Critical: ", Style::default().fg(Color::White)),
                Span::styled(
                    snap.high_and_critical().to_string(),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled("Categories: ", Style::default().fg(Color::White)),
                Span::styled(
                    snap.category_count().to_string(),
                    Style::default().fg(Color::Yellow),
                ),
                Span::raw("  "),
                Span::styled("Last event: ", Style::default().fg(Color::White)),
                Span::raw(
                    snap.last_event_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]));
        }
        None => lines.push(Line::from(Span::styled(
            "Loading summary...",
            Style::default().fg(Color::DarkGray),
        ))),
    }
    if let Some(err) = &state.error {
        lines.push(Line::from(Span::styled(
            err.as_str(),
            Style::default().fg(Color::Red),
        )));
    }
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Summary (severity: {}) ", scope));
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_events(
    f: &mut Frame<'_>,
    area: Rect,
    state: &ViewState<EventFilter, SecurityEvent>,
    focused: bool,
) {
    let rows: Vec<Row> = state
        .items
        .iter()
        .map(|e| {
            Row::new(vec![
                Cell::from(e.timestamp.format("%m-%d %H:%M:%S").to_string()),
                Cell::from(Span::styled(
                    e.severity.clone(),
                    Style::default().fg(severity_color(&e.severity)),
                )),
                Cell::from(e.category.clone()),
                Cell::from(e.source.clone()),
                Cell::from(e.description.clone()),
            ])
        })
        .collect();
    let table = Table::new(
        rows,
        [
            Constraint::Length(15),
            Constraint::Length(9),
            Constraint::Length(12),
            Constraint::Length(16),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Time", "Severity", "Category", "Source", "Description"]))
    .block(pane_block("Events", state, focused));
    f.render_widget(table, area);
}

fn draw_alerts(f: &mut Frame<'_>, area: Rect, state: &ViewState<AlertFilter, Alert>, focused: bool) {
    let rows: Vec<Row> = state
        .items
        .iter()
        .map(|a| {
            let status_style = if a.is_terminal() {
                Style::default().fg(Color::DarkGray)
            } else {
                Style::default().fg(Color::Yellow)
            };
            Row::new(vec![
                Cell::from(a.id.to_string()),
                Cell::from(Span::styled(a.status.to_string(), status_style)),
                Cell::from(a.rule_name.clone()),
                Cell::from(Span::styled(
                    a.event_severity.clone(),
                    Style::default().fg(severity_color(&a.event_severity)),
                )),
                Cell::from(a.assigned_to.clone().unwrap_or_else(|| "-".to_string())),
                Cell::from(a.event_description.clone()),
            ])
        })
        .collect();
    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(15),
            Constraint::Length(20),
            Constraint::Length(9),
            Constraint::Length(12),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["ID", "Status", "Rule", "Severity", "Assignee", "Event"]))
    .block(pane_block("Alerts", state, focused));
    f.render_widget(table, area);
}

fn draw_footer(f: &mut Frame<'_>, area: Rect, app: &App) {
    let keys = Line::from(vec![
        Span::styled("Keys: ", Style::default().fg(Color::Cyan)),
        Span::raw("n/p page  "),
        Span::raw("r refresh  "),
        Span::raw("s severity  "),
        Span::raw("tab switch  "),
        Span::raw("q quit"),
    ]);
    let mut items = vec![ListItem::new(keys)];
    items.extend(app.logs.iter().rev().take(3).map(|log| {
        ListItem::new(Line::from(vec![
            Span::styled("●", Style::default().fg(Color::Green)),
            Span::raw(" "),
            Span::raw(log.as_str()),
        ]))
    }));
    let list = List::new(items).block(Block::default().borders(Borders::ALL));
    f.render_widget(list, area);
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    Row::new(titles.iter().map(|t| Cell::from(*t)))
        .style(Style::default().add_modifier(Modifier::BOLD))
}

fn pane_block<F, T>(title: &str, state: &ViewState<F, T>, focused: bool) -> Block<'static> {
    let mut label = format!(
        " {} {} ",
        title,
        page_label(state.offset, state.items.len(), state.total)
    );
    if state.loading {
        label.push_str("(loading) ");
    }
    if let Some(err) = &state.error {
        label.push_str(&format!("! {} ", err));
    }
    let border = if state.error.is_some() {
        Color::Red
    } else if focused {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .title(label)
}

fn severity_color(severity: &str) -> Color {
    match severity.to_ascii_lowercase().as_str() {
        "low" => Color::Green,
        "medium" => Color::Yellow,
        "high" => Color::Red,
        "critical" => Color::Magenta,
        _ => Color::White,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use ratatui::backend::TestBackend;

    use super::*;
    use crate::core::transport::Transport;

    fn offline_views() -> Views {
        // nothing is fetched unless a key asks for it
        let transport = Arc::new(Transport::anonymous("http://127.0.0.1:9").unwrap());
        Views {
            events: Arc::new(
                CollectionView::new("events", EventsApi::new(transport.clone()), EventFilter::default(), 25)
                    .unwrap(),
            ),
            alerts: Arc::new(
                CollectionView::new("alerts", AlertsApi::new(transport.clone()), AlertFilter::default(), 50)
                    .unwrap(),
            ),
            summary: Arc::new(SummaryView::new(EventsApi::new(transport), EventFilter::default())),
        }
    }

    #[test]
    fn restore_runs_when_body_fails() {
        let restored = Cell::new(false);
        let outcome: Result<(), SyncError> = with_restore(
            || Err(SyncError::Io(io::Error::new(io::ErrorKind::Other, "tty gone"))),
            || {
                restored.set(true);
                Ok(())
            },
        );
        assert!(matches!(outcome, Err(SyncError::Io(_))));
        assert!(restored.get());
    }

    #[test]
    fn restore_error_surfaces_after_clean_body() {
        let outcome = with_restore(|| Ok(7), || Err(SyncError::Config("no tty".into())));
        assert!(matches!(outcome, Err(SyncError::Config(_))));
    }

    #[test]
    fn input_failure_ends_the_loop_with_the_error() {
        let views = offline_views();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        let mut reads = 0;
        let outcome = drive(&mut terminal, &views, || {
            reads += 1;
            if reads < 3 {
                Ok(None)
            } else {
                Err(SyncError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "input closed")))
            }
        });
        assert!(matches!(outcome, Err(SyncError::Io(_))));
        assert_eq!(reads, 3);
    }

    #[test]
    fn quit_key_ends_the_loop_after_one_frame() {
        let views = offline_views();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        drive(&mut terminal, &views, || Ok(Some(KeyCode::Char('q')))).unwrap();
        let rendered: String = terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(rendered.contains("Events 0 of 0"));
        assert!(rendered.contains("Loading summary..."));
    }
}
