//! Terminal dashboard for the coordination server

use crate::metrics::{format_offset, LogEntry, LogLevel, Metrics, ServerStatus};
use crate::network;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parade_core::clock::unix_time_ms;
use parade_core::sync::Mode;
use parking_lot::RwLock;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::io::{stdout, Stdout};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

type Term = Terminal<CrosstermBackend<Stdout>>;

const TICK: Duration = Duration::from_millis(100);
const PAGE: usize = 10;

/// Log view position. `back` counts entries hidden below the view; 0
/// follows the newest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogView {
    back: usize,
    follow: bool,
}

impl LogView {
    fn new() -> Self {
        Self { back: 0, follow: true }
    }

    fn older(&mut self, by: usize, log_count: usize) {
        if log_count == 0 {
            return;
        }
        self.back = (self.back + by).min(log_count - 1);
        self.follow = false;
    }

    fn newer(&mut self, by: usize) {
        self.back = self.back.saturating_sub(by);
        self.follow = self.back == 0;
    }

    /// Apply a key press; returns true when the dashboard should quit
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Up | KeyCode::Char('k') => self.older(1, log_count),
            KeyCode::Down | KeyCode::Char('j') => self.newer(1),
            KeyCode::PageUp => self.older(PAGE, log_count),
            KeyCode::PageDown => self.newer(PAGE),
            KeyCode::Home => self.older(log_count, log_count),
            KeyCode::End => self.newer(self.back),
            KeyCode::Char('a') => {
                self.follow = !self.follow;
                if self.follow {
                    self.back = 0;
                }
            }
            _ => {}
        }
        false
    }

    /// Entries to show, oldest first, for a pane `height` rows tall
    fn window(&self, log_count: usize, height: usize) -> Range<usize> {
        let back = if self.follow { 0 } else { self.back.min(log_count) };
        let end = log_count - back;
        end.saturating_sub(height)..end
    }
}

fn setup_terminal() -> std::io::Result<Term> {
    enable_raw_mode()?;
    let mut out = stdout();
    execute!(out, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(out))
}

fn restore_terminal(terminal: &mut Term) -> std::io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()
}

/// Run the dashboard until the operator quits
pub async fn run(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    let mut terminal = setup_terminal()?;

    // Failures land in the activity log
    let server_metrics = Arc::clone(&metrics);
    let server = tokio::spawn(async move {
        if let Err(e) = network::run_server(server_metrics).await {
            tracing::debug!("Server stopped: {}", e);
        }
    });

    let result = event_loop(&mut terminal, &metrics);

    server.abort();
    restore_terminal(&mut terminal)?;
    result
}

fn event_loop(terminal: &mut Term, metrics: &Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    let mut view = LogView::new();
    loop {
        terminal.draw(|f| draw(f, &metrics.read(), &view))?;

        if !event::poll(TICK)? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                let log_count = metrics.read().logs.len();
                if view.handle_key(key, log_count) {
                    return Ok(());
                }
            }
        }
    }
}

fn draw(f: &mut Frame, m: &Metrics, view: &LogView) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, rows[0], m);
    draw_stats(f, rows[1], m);
    draw_logs(f, rows[2], m, view);
    draw_footer(f, rows[3], view);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status, color) = match m.status {
        ServerStatus::Starting => ("starting", Color::Yellow),
        ServerStatus::Running => ("running", Color::Green),
        ServerStatus::Error => ("failed", Color::Red),
    };
    let addr = m.bind_addr.as_deref().unwrap_or("not bound");

    let line = Line::from(vec![
        Span::styled(" ● ", Style::default().fg(color)),
        Span::styled("Parade Coordinator", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(format!(" {} on {}", status, addr), Style::default().fg(color)),
        Span::styled(format!("   up {}", m.uptime()), Style::default().fg(Color::DarkGray)),
    ]);

    f.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::BOTTOM)),
        area,
    );
}

/// "label value" line for the stat panels
fn stat(label: &'static str, value: String, style: Style) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{:<10}", label), Style::default().fg(Color::DarkGray)),
        Span::styled(value, style),
    ])
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Percentage(30),
            Constraint::Percentage(30),
        ])
        .split(area);

    let plain = Style::default();
    let panels = [
        (
            " Session ",
            vec![
                stat("Playback", m.playback_summary(), playback_style(m.playback.mode)),
                stat("Position", position_label(m.position_ms(unix_time_ms())), plain),
                stat("Catalog", format!("{} tracks", m.catalog_size), plain),
            ],
        ),
        (
            " Connections ",
            vec![
                stat("Players", format!("{} ({} armed)", m.players, m.armed), plain.fg(Color::Green)),
                stat("Ctrl", m.controllers.to_string(), plain),
                stat("Peak", format!("{} of {} seen", m.peak_connections, m.total_connections), plain),
            ],
        ),
        (
            " Commands ",
            vec![
                stat("Applied", m.commands_applied.to_string(), plain.fg(Color::Green)),
                stat("Rejected", m.commands_rejected.to_string(), plain.fg(Color::Yellow)),
                stat("Advanced", format!("{} / kicks {}", m.auto_advances, m.kicks), plain),
            ],
        ),
    ];

    for ((title, lines), column) in panels.into_iter().zip(columns.iter()) {
        let panel = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
        f.render_widget(panel, *column);
    }
}

fn position_label(position: Option<i64>) -> String {
    match position {
        None => "-".to_string(),
        Some(pos) if pos < 0 => format!("starts in {}s", (pos.saturating_neg() + 999) / 1000),
        Some(pos) => format_offset(pos),
    }
}

fn playback_style(mode: Mode) -> Style {
    match mode {
        Mode::Idle => Style::default().fg(Color::DarkGray),
        Mode::Scheduled => Style::default().fg(Color::Yellow),
        Mode::Playing => Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        Mode::Paused => Style::default().fg(Color::Magenta),
    }
}

fn level_color(level: LogLevel) -> Color {
    match level {
        LogLevel::Info => Color::Blue,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
        LogLevel::Connection => Color::Green,
        LogLevel::Playback => Color::Magenta,
    }
}

fn log_item(entry: &LogEntry) -> ListItem<'_> {
    ListItem::new(Line::from(vec![
        Span::styled(
            entry.timestamp.format("%H:%M:%S ").to_string(),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(
            format!("{:<5} ", entry.level.as_str()),
            Style::default().fg(level_color(entry.level)),
        ),
        Span::raw(entry.message.as_str()),
    ]))
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, view: &LogView) {
    let height = area.height.saturating_sub(2) as usize;
    let total = m.logs.len();
    let shown = view.window(total, height);

    let title = if view.follow {
        format!(" Activity ({}) ", total)
    } else {
        format!(" Activity ({}-{} of {}) ", shown.start + 1, shown.end, total)
    };

    let items: Vec<ListItem> = m
        .logs
        .range(shown)
        .map(log_item)
        .collect();

    f.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );
}

fn draw_footer(f: &mut Frame, area: Rect, view: &LogView) {
    let key = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let hint = Style::default().fg(Color::DarkGray);
    let mut spans = Vec::new();
    for (keys, action) in [("q", "quit"), ("↑↓", "scroll"), ("PgUp/PgDn", "page"), ("a", "follow")] {
        spans.push(Span::styled(format!(" {}", keys), key));
        spans.push(Span::styled(format!(" {} ", action), hint));
    }
    spans.push(if view.follow {
        Span::styled("[following]", Style::default().fg(Color::Green))
    } else {
        Span::styled("[paused]", Style::default().fg(Color::Yellow))
    });

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}
