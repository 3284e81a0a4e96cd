//! Terminal monitor: a per-node table, an aggregate stats line, and the most
//! recent error. Drains the watcher's update channel with a receive timeout;
//! keeping that drain prompt is the backpressure contract with the
//! reconcilers.

use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::Terminal;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};

use fleet::node::{NodeLifecycle, StatusUpdate};
use fleet::watcher::{FleetStats, FleetWatcher};

pub fn run(watcher: &FleetWatcher) -> anyhow::Result<()> {
    terminal::enable_raw_mode()?;
    execute!(io::stdout(), EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, watcher);

    terminal::disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    watcher: &FleetWatcher,
) -> anyhow::Result<()> {
    let mut stats = FleetStats::default();

    loop {
        // Block briefly for the next update, then drain whatever queued up.
        if let Ok(update) = watcher.updates().recv_timeout(Duration::from_millis(100)) {
            stats = FleetStats::collect(watcher.statuses(), &update);
            while let Ok(update) = watcher.updates().try_recv() {
                stats = FleetStats::collect(watcher.statuses(), &update);
            }
        }

        let nodes: Vec<StatusUpdate> = watcher
            .statuses()
            .iter()
            .map(|slot| slot.snapshot())
            .collect();

        terminal.draw(|frame| render(frame, &nodes, &stats))?;

        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                let quit = key.code == KeyCode::Char('q')
                    || (key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL));
                if quit {
                    return Ok(());
                }
            }
        }
    }
}

fn render(frame: &mut Frame, nodes: &[StatusUpdate], stats: &FleetStats) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(4),    // node table
            Constraint::Length(3), // aggregate stats
            Constraint::Length(4), // latest error
        ])
        .split(frame.area());

    render_node_table(frame, chunks[0], nodes);
    render_stats(frame, chunks[1], nodes.len(), stats);
    render_error(frame, chunks[2], stats);
}

fn render_node_table(frame: &mut Frame, area: Rect, nodes: &[StatusUpdate]) {
    let header = Row::new(vec!["Node", "State", "Inst", "Clone", "Run", "Address"])
        .style(Style::default().bold());

    let rows: Vec<Row> = nodes
        .iter()
        .map(|node| {
            Row::new(vec![
                Cell::from(format!("{}", node.id)),
                Cell::from(node.lifecycle.as_str()),
                Cell::from(flag(node.installed)),
                Cell::from(flag(node.cloned)),
                Cell::from(flag(node.running)),
                Cell::from(node.info.external_ip.clone()),
            ])
            .style(lifecycle_style(node))
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(5),
            Constraint::Length(12),
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Fill(1),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title("Fleet"));

    frame.render_widget(table, area);
}

fn render_stats(frame: &mut Frame, area: Rect, total: usize, stats: &FleetStats) {
    let text = format!(
        "Active: {}/{}  Installed: {}  Cloned: {}  Running: {}",
        stats.active, total, stats.installed, stats.cloned, stats.running
    );
    let paragraph = Paragraph::new(text).block(Block::default().borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

fn render_error(frame: &mut Frame, area: Rect, stats: &FleetStats) {
    let text = match &stats.last_error {
        Some((id, message)) => format!("Error (node {id}): {}", message.replace('\n', "\\n")),
        None => String::new(),
    };
    let paragraph = Paragraph::new(text)
        .style(Style::default().fg(Color::Red))
        .block(Block::default().borders(Borders::ALL).title("Last error"));
    frame.render_widget(paragraph, area);
}

fn flag(on: bool) -> &'static str {
    if on { "\u{2713}" } else { "\u{00b7}" }
}

fn lifecycle_style(node: &StatusUpdate) -> Style {
    match node.lifecycle {
        NodeLifecycle::Ready if node.running => Style::default().fg(Color::Green),
        NodeLifecycle::Ready => Style::default(),
        NodeLifecycle::Error => Style::default().fg(Color::Red),
        NodeLifecycle::Creating | NodeLifecycle::Deleting | NodeLifecycle::Stopping => {
            Style::default().fg(Color::Yellow)
        }
        _ => Style::default().fg(Color::DarkGray),
    }
}
