//! pwebm dashboard TUI
//!
//! Terminal interface for watching the main instance's queue. Polls the
//! control channel's `status` request.

use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use pwebm_daemon::config::{config_file, default_socket_path};
use pwebm_daemon::ipc::client;
use pwebm_daemon::{ClientError, Config, Status};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    path::PathBuf,
    time::{Duration, Instant},
};

const MAX_PROGRESS_POINTS: usize = 240;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

/// Live view of a running pwebm main instance
#[derive(Parser, Debug)]
#[command(name = "pwebm-top")]
#[command(version, about, long_about = None)]
struct Args {
    /// Control channel address; defaults to the configured one
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(short, long, default_value_t = 500)]
    interval: u64,
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    socket: PathBuf,
    /// Latest status from the main instance
    pub status: Option<Status>,
    /// Event log with stage changes
    pub event_log: VecDeque<String>,
    /// Percentage history of the current pass (elapsed secs, percent)
    pub progress_history: VecDeque<(f64, f64)>,
    pub connected: bool,
    /// Start of the pass the progress history belongs to
    pass_started: Instant,
}

impl App {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            status: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            progress_history: VecDeque::with_capacity(MAX_PROGRESS_POINTS),
            connected: false,
            pass_started: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Ask the main instance for its status
    pub async fn fetch_status(&mut self) {
        match client::status(&self.socket).await {
            Ok(status) => {
                if !self.connected {
                    self.log_event(format!("Connected to {}", self.socket.display()));
                }
                self.connected = true;
                self.apply(status);
            }
            Err(e) => {
                if self.connected {
                    let reason = match e {
                        ClientError::NoServer => "main instance exited".to_string(),
                        other => other.to_string(),
                    };
                    self.log_event(format!("Connection lost: {}", reason));
                }
                self.connected = false;
            }
        }
    }

    fn apply(&mut self, status: Status) {
        let event = describe_transition(self.status.as_ref().unwrap_or(&Status::Idle), &status);
        if let Some(event) = event {
            self.log_event(event);
            self.progress_history.clear();
            self.pass_started = Instant::now();
        }

        if let Some(percentage) = status.percentage() {
            if self.progress_history.len() >= MAX_PROGRESS_POINTS {
                self.progress_history.pop_front();
            }
            self.progress_history
                .push_back((self.pass_started.elapsed().as_secs_f64(), percentage));
        }
        self.status = Some(status);
    }
}

/// Event log line for a stage change, `None` when only the percentage moved
fn describe_transition(previous: &Status, next: &Status) -> Option<String> {
    let same_stage = match (previous, next) {
        (Status::Idle, Status::Idle) => true,
        (
            Status::SinglePass { current: a, .. },
            Status::SinglePass { current: b, .. },
        ) => a == b,
        (
            Status::FirstPass { current: a, tries: t, .. },
            Status::FirstPass { current: b, tries: u, .. },
        )
        | (
            Status::SecondPass { current: a, tries: t, .. },
            Status::SecondPass { current: b, tries: u, .. },
        ) => a == b && t == u,
        _ => false,
    };

    if same_stage {
        return None;
    }

    Some(match next {
        Status::Idle => "Queue idle".to_string(),
        Status::SinglePass { current, total, .. } => format!("Job {}/{}: encoding", current, total),
        Status::FirstPass { current, total, tries } => {
            format!("Job {}/{}: first pass (try {})", current, total, tries)
        }
        Status::SecondPass { current, total, tries, .. } => {
            format!("Job {}/{}: second pass (try {})", current, total, tries)
        }
    })
}

fn stage_name(status: &Status) -> &'static str {
    match status {
        Status::Idle => "Idle",
        Status::SinglePass { .. } => "Single pass",
        Status::FirstPass { .. } => "First pass",
        Status::SecondPass { .. } => "Second pass",
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the table describing the job in flight
fn render_current_job(f: &mut Frame, area: Rect, app: &App) {
    let label = |name: &'static str| {
        Cell::from(name).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    };

    let status = app.status.clone().unwrap_or(Status::Idle);
    let (current, total, tries) = match &status {
        Status::Idle => (None, None, None),
        Status::SinglePass { current, total, .. } => (Some(*current), Some(*total), None),
        Status::FirstPass { current, total, tries } | Status::SecondPass { current, total, tries, .. } => {
            (Some(*current), Some(*total), Some(*tries))
        }
    };
    let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    let rows = vec![
        Row::new(vec![label("Stage"), Cell::from(stage_name(&status))]),
        Row::new(vec![
            label("Job"),
            Cell::from(or_dash(current.zip(total).map(|(c, t)| format!("{} of {}", c, t)))),
        ]),
        Row::new(vec![label("Try"), Cell::from(or_dash(tries.map(|t| t.to_string())))]),
        Row::new(vec![
            label("Progress"),
            Cell::from(or_dash(status.percentage().map(|p| format!("{:.2}%", p)))),
        ]),
    ];

    let title = if app.connected {
        " Current Job "
    } else {
        " Current Job (Disconnected) "
    };

    let table = Table::new(rows, [Constraint::Length(10), Constraint::Min(10)])
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

fn render_progress_gauge(f: &mut Frame, area: Rect, app: &App) {
    let status = app.status.as_ref();
    let percentage = status.and_then(Status::percentage).unwrap_or(0.0);
    let (label, color) = match status {
        Some(Status::FirstPass { .. }) => ("analysing".to_string(), Color::Blue),
        Some(Status::SecondPass { .. }) | Some(Status::SinglePass { .. }) => {
            (format!("{:.1}%", percentage), Color::Green)
        }
        _ => ("idle".to_string(), Color::DarkGray),
    };

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Progress "))
        .gauge_style(Style::default().fg(color))
        .ratio((percentage / 100.0).clamp(0.0, 1.0))
        .label(label);

    f.render_widget(gauge, area);
}

/// Render the percentage of the current pass over time
fn render_progress_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.progress_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default().borders(Borders::ALL).title(" Pass Progress ");
        f.render_widget(block, area);
        return;
    }

    let max_x = data.last().map(|(x, _)| *x).unwrap_or(0.0).max(1.0);

    let datasets = vec![Dataset::default()
        .name("%")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Pass Progress "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_x])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", max_x / 2.0)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("%")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, 100.0])
                .labels(vec![Span::raw("0"), Span::raw("50"), Span::raw("100")]),
        );

    f.render_widget(chart, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let text = match (&app.status, app.connected) {
        (Some(status), true) => format!(" {} | {} | Press 'q' to quit ", app.socket.display(), status),
        _ => format!(" No main instance on {} | Press 'q' to quit ", app.socket.display()),
    };

    let paragraph = Paragraph::new(text).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // status bar at the bottom
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(main_chunks[0]);

    // Left panel: job table, gauge, event log
    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Length(3), Constraint::Min(0)])
        .split(content_chunks[0]);

    render_current_job(f, left_chunks[0], app);
    render_progress_gauge(f, left_chunks[1], app);
    render_event_log(f, left_chunks[2], app);
    render_progress_chart(f, content_chunks[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn socket_path(args: &Args) -> PathBuf {
    if let Some(socket) = &args.socket {
        return socket.clone();
    }
    Config::load(config_file())
        .ok()
        .and_then(|config| config.socket_path)
        .unwrap_or_else(default_socket_path)
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();
    let mut app = App::new(socket_path(&args));
    app.log_event("pwebm-top started".to_string());

    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, &mut app, Duration::from_millis(args.interval.max(50))).await;
    restore_terminal(&mut terminal)?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    poll_interval: Duration,
) -> io::Result<()> {
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |at| at.elapsed() >= poll_interval) {
            app.fetch_status().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        // short timeout keeps redraws frequent
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}
