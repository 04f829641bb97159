mod tui_app;

use std::io;
use std::time::Duration;

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tui_app::{
    format_change, format_price, format_time_ms, format_volume, truncate, AppState, ConnectionStatus,
    LoadState, Pane,
};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let user_id = std::env::var("USER_ID").unwrap_or_else(|_| "local".to_string());
    let token = std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url, user_id, token);

    // Initial fetch before rendering
    app.refresh(&client).await;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut tables = PaneTables::default();

    let result = run_loop(&mut terminal, &mut app, &client, &mut tables).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

/// Selection state per pane.
#[derive(Default)]
struct PaneTables {
    tickers: TableState,
    watchlist: TableState,
    alerts: TableState,
}

impl PaneTables {
    fn focused(&mut self, pane: Pane) -> &mut TableState {
        match pane {
            Pane::Tickers => &mut self.tickers,
            Pane::Watchlist => &mut self.watchlist,
            Pane::Alerts => &mut self.alerts,
        }
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
    tables: &mut PaneTables,
) -> io::Result<()> {
    let refresh_interval = Duration::from_secs(5);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app, tables))?;

        let timeout = refresh_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Tab => app.focus = app.focus.next(),
                        KeyCode::Down | KeyCode::Char('j') => {
                            let max = app.focused_len().saturating_sub(1);
                            let state = tables.focused(app.focus);
                            let next = state.selected().map_or(0, |i| (i + 1).min(max));
                            state.select(Some(next));
                        }
                        KeyCode::Up | KeyCode::Char('k') => {
                            let state = tables.focused(app.focus);
                            let prev = state.selected().map_or(0, |i| i.saturating_sub(1));
                            state.select(Some(prev));
                        }
                        KeyCode::Char('w') | KeyCode::Char('W') => {
                            if let Some(symbol) = selected_symbol(app, tables) {
                                app.toggle_watchlist(client, &symbol).await;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= refresh_interval {
            app.refresh(client).await;
            last_tick = std::time::Instant::now();
        }
    }
}

/// Symbol under the cursor in the tickers or watchlist pane.
fn selected_symbol(app: &AppState, tables: &PaneTables) -> Option<String> {
    match app.focus {
        Pane::Tickers => {
            let i = tables.tickers.selected()?;
            app.tickers.content()?.get(i).map(|t| t.symbol.clone())
        }
        Pane::Watchlist => {
            let i = tables.watchlist.selected()?;
            app.watchlist.content()?.get(i).map(|e| e.symbol.clone())
        }
        Pane::Alerts => None,
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState, tables: &mut PaneTables) {
    let area = f.area();

    // Outer vertical split: header | body | footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // body
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, app, chunks[0]);
    render_body(f, app, tables, chunks[1]);
    render_footer(f, chunks[2]);
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (status_text, status_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let live = if app.health.live_connected.unwrap_or(false) { "live" } else { "polling" };
    let last = app
        .health
        .last_refresh_at_ms
        .map_or("—".to_string(), |ms| format!("refreshed {} UTC", format_time_ms(ms)));

    let title_spans = vec![
        Span::styled(
            " Coin Tracker  ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  "),
        Span::styled(format!("user: {}", app.user_id), Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(live, Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(last, Style::default().fg(Color::White)),
    ];

    let header_line = Line::from(title_spans);
    let paragraph = Paragraph::new(header_line)
        .block(Block::default().borders(Borders::ALL).border_style(
            Style::default().fg(Color::DarkGray),
        ));

    f.render_widget(paragraph, area);
}

fn render_body(f: &mut Frame, app: &AppState, tables: &mut PaneTables, area: Rect) {
    // Horizontal split: tickers (60%) | watchlist over alerts (40%)
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(halves[1]);

    render_tickers_table(f, app, &mut tables.tickers, halves[0]);
    render_watchlist_table(f, app, &mut tables.watchlist, right[0]);
    render_alerts_table(f, app, &mut tables.alerts, right[1]);
}

fn pane_block(title: &str, focused: bool) -> Block<'_> {
    let border = if focused { Color::Cyan } else { Color::DarkGray };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .title(Span::styled(
            title,
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
}

/// Placeholder for a pane that has no content to show yet.
fn render_placeholder<T>(f: &mut Frame, state: &LoadState<T>, block: Block, area: Rect) -> bool {
    let line = match state {
        LoadState::Content(_) => return false,
        LoadState::Loading => Line::from(Span::styled("loading…", Style::default().fg(Color::Yellow))),
        LoadState::Error(e) => Line::from(Span::styled(format!("✗ {e}"), Style::default().fg(Color::Red))),
    };
    f.render_widget(Paragraph::new(line).block(block), area);
    true
}

fn header_row(cols: &[&'static str]) -> Row<'static> {
    let cells = cols
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    Row::new(cells).height(1)
}

fn change_color(pct: f64) -> Color {
    if pct > 0.0 {
        Color::Green
    } else if pct < 0.0 {
        Color::Red
    } else {
        Color::White
    }
}

fn render_tickers_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let block = pane_block(" TICKERS ", app.focus == Pane::Tickers);
    if render_placeholder(f, &app.tickers, block.clone(), area) {
        return;
    }
    let tickers = app.tickers.content().map(Vec::as_slice).unwrap_or_default();

    let rows: Vec<Row> = tickers
        .iter()
        .map(|t| {
            let star = if app.is_watched(&t.symbol) { "★" } else { " " };
            Row::new(vec![
                Cell::from(star).style(Style::default().fg(Color::Yellow)),
                Cell::from(truncate(&t.symbol, 12)),
                Cell::from(format_price(t.last_price)),
                Cell::from(format_change(t.price_change_percent))
                    .style(Style::default().fg(change_color(t.price_change_percent))),
                Cell::from(format_volume(t.quote_volume)).style(Style::default().fg(Color::Cyan)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(1),
            Constraint::Min(8),
            Constraint::Length(16),
            Constraint::Length(9),
            Constraint::Length(9),
        ],
    )
    .header(header_row(&["", "Symbol", "Price", "24h", "Volume"]))
    .block(block)
    .row_highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    f.render_stateful_widget(table, area, state);
}

fn render_watchlist_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let block = pane_block(" WATCHLIST ", app.focus == Pane::Watchlist);
    if render_placeholder(f, &app.watchlist, block.clone(), area) {
        return;
    }
    let entries = app.watchlist.content().map(Vec::as_slice).unwrap_or_default();
    let tickers = app.tickers.content().map(Vec::as_slice).unwrap_or_default();

    let rows: Vec<Row> = entries
        .iter()
        .map(|e| {
            let ticker = tickers.iter().find(|t| t.symbol == e.symbol);
            let price = ticker.map_or("—".to_string(), |t| format_price(t.last_price));
            let pct = ticker.map_or(0.0, |t| t.price_change_percent);
            Row::new(vec![
                Cell::from(truncate(&e.symbol, 12)),
                Cell::from(price),
                Cell::from(format_change(pct)).style(Style::default().fg(change_color(pct))),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [Constraint::Min(8), Constraint::Length(16), Constraint::Length(9)],
    )
    .header(header_row(&["Symbol", "Price", "24h"]))
    .block(block)
    .row_highlight_style(Style::default().bg(Color::DarkGray));

    f.render_stateful_widget(table, area, state);
}

fn render_alerts_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let block = pane_block(" ALERTS ", app.focus == Pane::Alerts);
    if render_placeholder(f, &app.alerts, block.clone(), area) {
        return;
    }
    let alerts = app.alerts.content().map(Vec::as_slice).unwrap_or_default();

    let rows: Vec<Row> = alerts
        .iter()
        .map(|a| {
            let (state_text, color) = match a.triggered_at {
                Some(at) if a.triggered => (format!("fired {}", format_time_ms(at)), Color::Green),
                _ => ("armed".to_string(), Color::DarkGray),
            };
            Row::new(vec![
                Cell::from(truncate(&a.symbol, 10)),
                Cell::from(a.condition.clone()),
                Cell::from(format_price(a.target_price)),
                Cell::from(state_text).style(Style::default().fg(color)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Min(8),
            Constraint::Length(6),
            Constraint::Length(14),
            Constraint::Length(14),
        ],
    )
    .header(header_row(&["Symbol", "When", "Target", "State"]))
    .block(block)
    .row_highlight_style(Style::default().bg(Color::DarkGray));

    f.render_stateful_widget(table, area, state);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let line = Line::from(vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh  "),
        Span::styled("[↑↓ / j k] ", Style::default().fg(Color::Yellow)),
        Span::raw("scroll  "),
        Span::styled("[w] ", Style::default().fg(Color::Yellow)),
        Span::raw("toggle watchlist  "),
        Span::styled("[tab] ", Style::default().fg(Color::Yellow)),
        Span::raw("switch pane  "),
        Span::styled("auto-refresh: 5s", Style::default().fg(Color::DarkGray)),
    ]);
    let paragraph = Paragraph::new(line).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}
