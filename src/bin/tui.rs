//! Terminal peripheral browser and session console.
//!
//! Usage:
//!   cargo run --features tui --bin tui                          # first local adapter (needs `platform`)
//!   cargo run --features tui --bin tui -- --simulate            # built-in simulated peripherals
//!   cargo run --features tui --bin tui -- --simulate --service 180d --characteristic 2a37
//!
//! Keys
//! ----
//!   s        clear the list and scan
//!   x        stop scanning
//!   ↑ / ↓    move the cursor
//!   Enter    connect to the highlighted peripheral
//!   d        disconnect
//!   r        read the bound characteristic
//!   w        write the next sample message
//!   n        toggle notifications
//!   i        refresh RSSI
//!   c        clear the log
//!   q / Esc  quit

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use ble_session::client::{BleClient, SessionHandle};
use ble_session::config::CliOptions;
use ble_session::error::BleError;
use ble_session::protocol::short_uuid;
use ble_session::types::{
    AdapterState, ConnectionState, SessionEvent, SessionPhase, SessionSnapshot,
};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Payloads cycled through by `w`.
const SAMPLE_MESSAGES: [[u8; 7]; 4] = [
    [0, 7, 2, 52, 2, 19, 181],
    [0, 7, 2, 103, 2, 47, 69],
    [0, 7, 2, 32, 2, 28, 181],
    [0, 7, 2, 120, 2, 39, 117],
];

/// Lines kept in the activity log.
const LOG_LINES: usize = 200;

/// Braille spinner frames cycled at ~100 ms intervals while a step is in flight.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

// ── App state (shared with the event task via Arc<Mutex<_>>) ──────────────────

struct App {
    /// Latest snapshot of the session core, refreshed every frame.
    snapshot: Option<SessionSnapshot>,
    cursor: usize,
    log: VecDeque<(Color, String)>,
    notifications: u64,
    last_value: Option<Vec<u8>>,
    write_index: usize,
    simulate: bool,
}

impl App {
    fn new(simulate: bool) -> Self {
        Self {
            snapshot: None,
            cursor: 0,
            log: VecDeque::with_capacity(LOG_LINES),
            notifications: 0,
            last_value: None,
            write_index: 0,
            simulate,
        }
    }

    fn push(&mut self, color: Color, line: impl Into<String>) {
        if self.log.len() == LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((color, line.into()));
    }

    fn selected_id(&self) -> Option<String> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.peripherals.get(self.cursor))
            .map(|p| p.id.clone())
    }
}

type Shared = Arc<Mutex<App>>;

// ── Background tasks ──────────────────────────────────────────────────────────

/// Turn session events into log lines.
fn spawn_event_task(mut events: mpsc::Receiver<SessionEvent>, app: Shared) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let (color, line) = match event {
                SessionEvent::ScanStarted => (Color::Yellow, "Scan started".to_owned()),
                SessionEvent::ScanStopped => (Color::DarkGray, "Scan stopped".to_owned()),
                SessionEvent::PeripheralDiscovered { id } => {
                    (Color::White, format!("Found {id}"))
                }
                SessionEvent::PhaseChanged {
                    peripheral_id,
                    phase,
                } => (
                    phase_color(phase),
                    match peripheral_id {
                        Some(id) => format!("{id}: {phase}"),
                        None => format!("Session {phase}"),
                    },
                ),
                SessionEvent::TargetNotFound { peripheral_id, uuid } => (
                    Color::Red,
                    format!("{peripheral_id} has no {}", short_uuid(&uuid).unwrap_or(uuid)),
                ),
                SessionEvent::RssiUpdated { id, rssi } => {
                    (Color::DarkGray, format!("{id}: {rssi} dBm"))
                }
                SessionEvent::Disconnected {
                    peripheral_id,
                    reason,
                } => (
                    Color::Red,
                    match reason {
                        Some(reason) => format!("Disconnected from {peripheral_id} ({reason})"),
                        None => format!("Disconnected from {peripheral_id}"),
                    },
                ),
                SessionEvent::AdapterStateChanged(state) => {
                    (Color::Yellow, format!("Adapter {state:?}"))
                }
                SessionEvent::Failed(e) => (Color::Red, e.to_string()),
            };
            app.lock().unwrap().push(color, line);
        }
    });
}

/// Run one session command without blocking the render loop; the outcome
/// lands in the log.
fn spawn_command<F, Fut>(app: &Shared, handle: &SessionHandle, label: &'static str, command: F)
where
    F: FnOnce(SessionHandle) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<String, BleError>> + Send + 'static,
{
    let app = Arc::clone(app);
    let handle = handle.clone();
    tokio::spawn(async move {
        let (color, line) = match command(handle).await {
            Ok(done) if done.is_empty() => return,
            Ok(done) => (Color::Green, format!("{label}: {done}")),
            Err(e) => (Color::Red, format!("{label}: {e}")),
        };
        app.lock().unwrap().push(color, line);
    });
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App) {
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .split(frame.area());

    draw_header(frame, root[0], app);

    let [list_area, right] =
        Layout::horizontal([Constraint::Percentage(50), Constraint::Percentage(50)])
            .areas(root[1]);
    let [session_area, log_area] =
        Layout::vertical([Constraint::Length(9), Constraint::Min(0)]).areas(right);

    draw_peripherals(frame, list_area, app);
    draw_session(frame, session_area, app);
    draw_log(frame, log_area, app);
    draw_footer(frame, root[2]);
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

fn phase_color(phase: SessionPhase) -> Color {
    match phase {
        SessionPhase::Idle => Color::DarkGray,
        SessionPhase::Ready => Color::Green,
        SessionPhase::Disconnecting => Color::Red,
        _ => Color::Yellow,
    }
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let (phase, scanning, adapter) = match &app.snapshot {
        Some(s) => (s.phase, s.scan.active, s.adapter_state),
        None => (SessionPhase::Idle, false, AdapterState::Unknown),
    };
    let busy = phase.is_active() && phase != SessionPhase::Ready;
    let phase_label = if busy {
        format!("{} {phase}", spinner_str())
    } else {
        format!("● {phase}")
    };
    let scan_label = if scanning {
        format!("{} scanning", spinner_str())
    } else {
        "scan off".to_owned()
    };
    let source = if app.simulate { "simulated" } else { "radio" };

    let line = Line::from(vec![
        Span::styled(
            " BLE Session ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(
            phase_label,
            Style::default()
                .fg(phase_color(phase))
                .add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(scan_label, Style::default().fg(Color::Yellow)),
        sep(),
        Span::styled(format!("adapter {adapter:?}"), Style::default().fg(Color::White)),
        sep(),
        Span::styled(source, Style::default().fg(Color::Cyan)),
        Span::raw(" "),
    ]);
    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

fn draw_peripherals(frame: &mut Frame, area: Rect, app: &App) {
    let peripherals = app
        .snapshot
        .as_ref()
        .map(|s| s.peripherals.as_slice())
        .unwrap_or_default();

    let items: Vec<ListItem> = if peripherals.is_empty() {
        vec![ListItem::new(Span::styled(
            "  No peripherals, press [s] to scan",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        peripherals
            .iter()
            .map(|p| {
                let (bullet, color) = match p.connection_state {
                    ConnectionState::Connected => ("● ", Color::Green),
                    ConnectionState::Connecting | ConnectionState::Disconnecting => {
                        ("◌ ", Color::Yellow)
                    }
                    ConnectionState::Disconnected => ("  ", Color::White),
                };
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{bullet}{:<18}", p.label()), Style::default().fg(color)),
                    Span::styled(format!(" {:>4} dBm ", p.rssi), Style::default().fg(Color::Cyan)),
                    Span::styled(p.id.clone(), Style::default().fg(Color::DarkGray)),
                ]))
            })
            .collect()
    };

    let mut state = ListState::default();
    if !peripherals.is_empty() {
        state.select(Some(app.cursor.min(peripherals.len() - 1)));
    }
    frame.render_stateful_widget(
        List::new(items)
            .block(
                Block::default()
                    .title(format!(" Peripherals ({}) ", peripherals.len()))
                    .borders(Borders::ALL),
            )
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ "),
        area,
        &mut state,
    );
}

fn draw_session(frame: &mut Frame, area: Rect, app: &App) {
    let label = |s: &str| Span::styled(format!("{s:<14}"), Style::default().fg(Color::DarkGray));
    let short = |uuid: &str| short_uuid(uuid).unwrap_or_else(|| uuid.to_owned());

    let mut lines = vec![];
    match app.snapshot.as_ref().and_then(|s| s.session.as_ref()) {
        Some(session) => {
            lines.push(Line::from(vec![
                label("peripheral"),
                Span::raw(session.peripheral_id.clone()),
            ]));
            lines.push(Line::from(vec![
                label("target"),
                Span::raw(format!(
                    "{} / {}",
                    short(&session.target_service_uuid),
                    short(&session.target_characteristic_uuid)
                )),
            ]));
            let bound = match &session.characteristic {
                Some(c) if c.supports_notify => Span::styled("bound (notify)", Style::default().fg(Color::Green)),
                Some(_) => Span::styled("bound", Style::default().fg(Color::Green)),
                None => Span::styled("not found", Style::default().fg(Color::Red)),
            };
            lines.push(Line::from(vec![label("characteristic"), bound]));
            lines.push(Line::from(vec![
                label("notify"),
                Span::raw(if session.notify_enabled { "on" } else { "off" }),
            ]));
        }
        None => {
            let phase = app.snapshot.as_ref().map(|s| s.phase).unwrap_or_default();
            let who = app
                .snapshot
                .as_ref()
                .and_then(|s| s.peripheral_id.clone())
                .unwrap_or_else(|| "–".to_owned());
            lines.push(Line::from(vec![label("session"), Span::raw(phase.to_string())]));
            lines.push(Line::from(vec![label("peripheral"), Span::raw(who)]));
        }
    }
    lines.push(Line::from(vec![
        label("notifications"),
        Span::raw(app.notifications.to_string()),
    ]));
    lines.push(Line::from(vec![
        label("last value"),
        Span::styled(
            app.last_value.as_deref().map(hex).unwrap_or_else(|| "–".to_owned()),
            Style::default().fg(Color::Cyan),
        ),
    ]));

    frame.render_widget(
        Paragraph::new(lines)
            .block(Block::default().title(" Session ").borders(Borders::ALL))
            .wrap(Wrap { trim: true }),
        area,
    );
}

fn draw_log(frame: &mut Frame, area: Rect, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = app
        .log
        .iter()
        .skip(app.log.len().saturating_sub(visible))
        .map(|(color, line)| ListItem::new(Span::styled(line.clone(), Style::default().fg(*color))))
        .collect();
    frame.render_widget(
        List::new(items).block(Block::default().title(" Log ").borders(Borders::ALL)),
        area,
    );
}

fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

fn draw_footer(frame: &mut Frame, area: Rect) {
    let line = Line::from(vec![
        key(" [s]"),
        Span::raw(" Scan  "),
        key("[x]"),
        Span::raw(" Stop  "),
        key("[↵]"),
        Span::raw(" Connect  "),
        key("[d]"),
        Span::raw(" Disconnect  "),
        key("[r]"),
        Span::raw(" Read  "),
        key("[w]"),
        Span::raw(" Write  "),
        key("[n]"),
        Span::raw(" Notify  "),
        key("[i]"),
        Span::raw(" RSSI  "),
        key("[q]"),
        Span::raw(" Quit"),
    ]);
    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[cfg(feature = "platform")]
async fn start_platform(
    client: &BleClient,
) -> Result<(mpsc::Receiver<SessionEvent>, SessionHandle)> {
    client.start_platform().await
}

#[cfg(not(feature = "platform"))]
async fn start_platform(
    _client: &BleClient,
) -> Result<(mpsc::Receiver<SessionEvent>, SessionHandle)> {
    anyhow::bail!("built without the `platform` feature; rebuild with --features platform or pass --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: the ble-session tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to ble-session-tui.log so they never draw over the UI.
    //   RUST_LOG=debug cargo run --features tui --bin tui -- --simulate
    {
        use std::fs::File;
        if let Ok(file) = File::create("ble-session-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    let options = CliOptions::parse();
    let client = BleClient::new(options.client_config());
    let app: Shared = Arc::new(Mutex::new(App::new(options.simulate)));

    // ── Start the session runtime ─────────────────────────────────────────────
    let (events, handle) = if options.simulate {
        let (events, handle, adapter) = client.start_simulated();
        adapter.spawn_ticker(Duration::from_secs(1));
        (events, handle)
    } else {
        start_platform(&client).await?
    };
    spawn_event_task(events, Arc::clone(&app));

    let sink = Arc::clone(&app);
    handle
        .on_data(move |bytes| {
            let mut s = sink.lock().unwrap();
            s.notifications += 1;
            s.last_value = Some(bytes.to_vec());
        })
        .await?;
    handle.start_scan().await?;

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    loop {
        // ── 1. Refresh the snapshot ───────────────────────────────────────────
        match handle.snapshot().await {
            Ok(snapshot) => app.lock().unwrap().snapshot = Some(snapshot),
            Err(e) => {
                app.lock().unwrap().push(Color::Red, e.to_string());
                break;
            }
        }

        // ── 2. Render ─────────────────────────────────────────────────────────
        {
            let s = app.lock().unwrap();
            terminal.draw(|f| draw(f, &s))?;
        }

        // ── 3. Handle keyboard ────────────────────────────────────────────────
        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        // In raw mode Ctrl+C arrives as a key event, not SIGINT.
        let ctrl_c =
            key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        if ctrl_c {
            break;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Up => {
                let mut s = app.lock().unwrap();
                s.cursor = s.cursor.saturating_sub(1);
            }
            KeyCode::Down => {
                let mut s = app.lock().unwrap();
                let n = s.snapshot.as_ref().map_or(0, |snap| snap.peripherals.len());
                if s.cursor + 1 < n {
                    s.cursor += 1;
                }
            }
            KeyCode::Char('s') => {
                app.lock().unwrap().cursor = 0;
                spawn_command(&app, &handle, "scan", |h| async move {
                    h.start_scan().await.map(|_| String::new())
                });
            }
            KeyCode::Char('x') => {
                spawn_command(&app, &handle, "stop", |h| async move {
                    h.stop_scan().await.map(|_| String::new())
                });
            }
            KeyCode::Enter => {
                let selected = app.lock().unwrap().selected_id();
                if let Some(id) = selected {
                    spawn_command(&app, &handle, "connect", move |h| async move {
                        h.connect(&id).await.map(|_| String::new())
                    });
                }
            }
            KeyCode::Char('d') => {
                spawn_command(&app, &handle, "disconnect", |h| async move {
                    h.disconnect().await.map(|_| String::new())
                });
            }
            KeyCode::Char('r') => {
                let sink = Arc::clone(&app);
                spawn_command(&app, &handle, "read", move |h| async move {
                    let value = h.read().await?;
                    let line = hex(&value);
                    sink.lock().unwrap().last_value = Some(value);
                    Ok::<_, BleError>(line)
                });
            }
            KeyCode::Char('w') => {
                let message = {
                    let mut s = app.lock().unwrap();
                    let message = SAMPLE_MESSAGES[s.write_index % SAMPLE_MESSAGES.len()];
                    s.write_index += 1;
                    message
                };
                spawn_command(&app, &handle, "write", move |h| async move {
                    h.write(message.to_vec()).await.map(|_| hex(&message))
                });
            }
            KeyCode::Char('n') => {
                spawn_command(&app, &handle, "notify", |h| async move {
                    h.toggle_notify()
                        .await
                        .map(|on| if on { "on" } else { "off" }.to_owned())
                });
            }
            KeyCode::Char('i') => {
                spawn_command(&app, &handle, "rssi", |h| async move {
                    h.refresh_rssi().await.map(|rssi| format!("{rssi} dBm"))
                });
            }
            KeyCode::Char('c') => {
                app.lock().unwrap().log.clear();
            }
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    let _ = handle.shutdown().await;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
