//! av1top
//!
//! Terminal dashboard for a running av1conv batch. It only reads the run
//! state directory (`queue.json`, `slot-N.json`, `savings.log`) and never
//! talks to the converter, so it can be started and stopped at any time.

use av1conv::monitor::format_sample;
use av1conv::report::format_signed_size;
use av1conv::state::{latest_state_dir, QueueRecord, SavingsEntry, SlotPhase, SlotStatus, StateDir};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use humansize::{format_size, BINARY};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::{
    env,
    io::{self, Stdout},
    path::PathBuf,
    time::{Duration, Instant},
};
use sysinfo::System;

const MAX_RECENT_SAVINGS: usize = 50;

/// av1top - Live view of an av1conv run
#[derive(Parser, Debug)]
#[command(name = "av1top")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run state directory to watch (default: newest av1conv-* in --temp-dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory searched for run state directories
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Refresh interval in milliseconds
    #[arg(long, default_value_t = 500)]
    interval: u64,
}

// ============================================================================
// Data
// ============================================================================

/// What could be read from the state directory on the last refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub queue: Option<QueueRecord>,
    pub slots: Vec<SlotStatus>,
    pub savings: Vec<SavingsEntry>,
}

impl Snapshot {
    /// Read everything; missing or half-written files simply come back empty
    pub fn load(dir: &StateDir) -> Self {
        let queue = dir.read_queue();
        let slot_count = queue.as_ref().map(|q| q.slot_count).unwrap_or(0);
        Self {
            slots: dir.read_slots(slot_count),
            savings: dir.read_savings(),
            queue,
        }
    }
}

/// Totals over the savings log
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SavingsTotals {
    pub kept: usize,
    pub reverted: usize,
    pub saved_bytes: i64,
}

pub fn savings_totals(entries: &[SavingsEntry]) -> SavingsTotals {
    entries.iter().fold(SavingsTotals::default(), |mut acc, e| {
        if e.reverted {
            acc.reverted += 1;
        } else {
            acc.kept += 1;
            acc.saved_bytes += e.saved_bytes;
        }
        acc
    })
}

/// CPU, memory and load figures for the gauges
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub mem_used: u64,
    pub mem_total: u64,
    pub load: [f64; 3],
}

impl SystemSample {
    pub fn mem_ratio(&self) -> f64 {
        if self.mem_total == 0 {
            0.0
        } else {
            (self.mem_used as f64 / self.mem_total as f64).clamp(0.0, 1.0)
        }
    }
}

fn collect_system(sys: &mut System) -> SystemSample {
    sys.refresh_cpu_usage();
    sys.refresh_memory();
    let load = System::load_average();
    SystemSample {
        cpu_percent: sys.global_cpu_usage(),
        mem_used: sys.used_memory(),
        mem_total: sys.total_memory(),
        load: [load.one, load.five, load.fifteen],
    }
}

// ============================================================================
// App State
// ============================================================================

pub struct App {
    /// Explicit directory; when unset the newest run under `search_root` is used
    pinned: Option<PathBuf>,
    search_root: PathBuf,
    pub state_dir: Option<StateDir>,
    pub snapshot: Snapshot,
    pub system: SystemSample,
    sys: System,
    started: Instant,
}

impl App {
    pub fn new(pinned: Option<PathBuf>, search_root: PathBuf) -> Self {
        Self {
            pinned,
            search_root,
            state_dir: None,
            snapshot: Snapshot::default(),
            system: SystemSample::default(),
            sys: System::new(),
            started: Instant::now(),
        }
    }

    pub fn refresh(&mut self) {
        let path = match &self.pinned {
            Some(path) => Some(path.clone()),
            None => latest_state_dir(&self.search_root),
        };
        self.state_dir = path.filter(|p| p.is_dir()).map(StateDir::open);
        self.snapshot = match &self.state_dir {
            Some(dir) => Snapshot::load(dir),
            None => Snapshot::default(),
        };
        self.system = collect_system(&mut self.sys);
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Formatting
// ============================================================================

/// Gauge fill for a slot; finalizing counts as complete
pub fn slot_ratio(slot: &SlotStatus) -> f64 {
    match slot.phase {
        SlotPhase::Preparing => 0.0,
        SlotPhase::Finalizing => 1.0,
        SlotPhase::Encoding => slot
            .progress
            .as_ref()
            .and_then(|p| p.percent)
            .map(|p| (p / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.0),
    }
}

pub fn slot_caption(slot: &SlotStatus) -> String {
    match (&slot.phase, &slot.progress) {
        (SlotPhase::Preparing, _) => "preparing".to_string(),
        (SlotPhase::Finalizing, _) => "finalizing".to_string(),
        (SlotPhase::Encoding, Some(sample)) => format_sample(sample),
        (SlotPhase::Encoding, None) => "starting".to_string(),
    }
}

pub fn queue_lines(queue: &QueueRecord, totals: &SavingsTotals) -> Vec<String> {
    let q = &queue.queue;
    vec![
        format!(
            "Files {}  started {}  pending {}  active {}/{}",
            q.total,
            q.started,
            q.pending(),
            q.active,
            queue.slot_count
        ),
        format!(
            "Kept {}  skipped {}  reverted {}",
            q.processed, q.skipped, totals.reverted
        ),
        format!("Saved {}", format_signed_size(q.saved_bytes)),
    ]
}

pub fn savings_line(entry: &SavingsEntry) -> String {
    let name = entry
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| entry.path.display().to_string());
    if entry.reverted {
        format!("{}  reverted", name)
    } else {
        format!("{}  {}", name, format_signed_size(entry.saved_bytes))
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn render_queue(f: &mut Frame, area: Rect, app: &App) {
    let lines: Vec<Line> = match &app.snapshot.queue {
        Some(queue) => queue_lines(queue, &savings_totals(&app.snapshot.savings))
            .into_iter()
            .map(Line::from)
            .collect(),
        None => vec![Line::from("Waiting for run state...")],
    };
    let paragraph =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Queue "));
    f.render_widget(paragraph, area);
}

fn render_slots(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().borders(Borders::ALL).title(" Encoding ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    if app.snapshot.slots.is_empty() {
        f.render_widget(Paragraph::new("No active encodes"), inner);
        return;
    }

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            app.snapshot
                .slots
                .iter()
                .map(|_| Constraint::Length(3))
                .chain(std::iter::once(Constraint::Min(0))),
        )
        .split(inner);

    for (slot, row) in app.snapshot.slots.iter().zip(rows.iter()) {
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" {} | {} ", slot.slot, slot.label)),
            )
            .gauge_style(Style::default().fg(Color::Green))
            .ratio(slot_ratio(slot))
            .label(slot_caption(slot));
        f.render_widget(gauge, *row);
    }
}

fn render_system_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let cpu = (app.system.cpu_percent as f64 / 100.0).clamp(0.0, 1.0);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu)
        .label(format!("{:.1}%", cpu * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(app.system.mem_ratio())
        .label(format!(
            "{} / {}",
            format_size(app.system.mem_used, BINARY),
            format_size(app.system.mem_total, BINARY)
        ));

    let [one, five, fifteen] = app.system.load;
    let load = Paragraph::new(format!("{:.2}  {:.2}  {:.2}", one, five, fifteen))
        .block(Block::default().borders(Borders::ALL).title(" Load Avg "));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
    f.render_widget(load, chunks[2]);
}

fn render_savings(f: &mut Frame, area: Rect, app: &App) {
    let header = Row::new(vec![Cell::from("Finished")])
        .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = app
        .snapshot
        .savings
        .iter()
        .rev()
        .take(MAX_RECENT_SAVINGS)
        .map(|e| {
            let style = if e.reverted {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            Row::new(vec![Cell::from(savings_line(e))]).style(style)
        })
        .collect();

    let table = Table::new(rows, [Constraint::Percentage(100)])
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(" Savings "));
    f.render_widget(table, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = match &app.state_dir {
        Some(dir) => format!(
            " {} | up {} | Press 'q' to quit ",
            dir.path().display(),
            format_uptime(app.started.elapsed())
        ),
        None => " No av1conv run found | Press 'q' to quit ".to_string(),
    };
    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

fn ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.area());

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(main_chunks[0]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(0)])
        .split(columns[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(0)])
        .split(columns[1]);

    render_queue(f, left[0], app);
    render_slots(f, left[1], app);
    render_system_gauges(f, right[0], app);
    render_savings(f, right[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> io::Result<()> {
    let args = Args::parse();
    let search_root = args.temp_dir.unwrap_or_else(env::temp_dir);
    let mut app = App::new(args.state_dir, search_root);

    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, &mut app, Duration::from_millis(args.interval.max(50)));
    restore_terminal(&mut terminal)?;
    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    interval: Duration,
) -> io::Result<()> {
    let mut last_refresh: Option<Instant> = None;

    loop {
        if last_refresh.map_or(true, |t| t.elapsed() >= interval) {
            app.refresh();
            last_refresh = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc)
                {
                    return Ok(());
                }
            }
        }
    }
}
