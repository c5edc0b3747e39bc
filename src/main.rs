use std::io::{self, BufRead};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use ble_session::client::{BleClient, SessionHandle};
use ble_session::config::CliOptions;
use ble_session::protocol::short_uuid;
use ble_session::types::{SessionEvent, SessionSnapshot};

const HELP: &str = "\
Commands (type + Enter):
  scan               – clear the list and scan
  stop               – stop scanning
  list               – show discovered peripherals
  json               – dump the session snapshot as JSON
  connect <id|#>     – connect by id or list index
  read               – read the bound characteristic
  write <hex>        – write bytes, e.g. `write 00 07 02 34`
  notify             – toggle notifications
  rssi               – refresh signal strength
  disconnect         – end the session
  q                  – quit";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ble_session=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let options = CliOptions::parse();
    let client = BleClient::new(options.client_config());

    // ── Start the session runtime ─────────────────────────────────────────────
    let (mut events, handle) = if options.simulate {
        info!("Using simulated peripherals");
        let (events, handle, adapter) = client.start_simulated();
        adapter.spawn_ticker(Duration::from_secs(1));
        (events, handle)
    } else {
        start_platform(&client).await?
    };

    handle
        .on_data(|bytes| println!("[NOTIFY] {}", hex(bytes)))
        .await?;
    handle.start_scan().await?;
    info!("{HELP}");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (a StdinLock is not Send) and
    // relayed to an async task that owns a handle clone.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle_cmd = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            if line == "q" {
                info!("Quit requested.");
                break;
            }
            if let Err(e) = run_command(&handle_cmd, &line).await {
                error!("{line}: {e}");
            }
        }
        if let Err(e) = handle_cmd.shutdown().await {
            error!("shutdown: {e}");
        }
    });
    drop(handle);

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::ScanStarted => info!("🔍  Scanning …"),
            SessionEvent::ScanStopped => info!("Scan stopped."),
            SessionEvent::PeripheralDiscovered { id } => println!("[FOUND] {id}"),
            SessionEvent::PhaseChanged {
                peripheral_id,
                phase,
            } => info!(
                "Session {phase}{}",
                peripheral_id.map(|id| format!(" ({id})")).unwrap_or_default()
            ),
            SessionEvent::TargetNotFound { peripheral_id, uuid } => info!(
                "⚠️  {peripheral_id} has no {}",
                short_uuid(&uuid).unwrap_or(uuid)
            ),
            SessionEvent::RssiUpdated { id, rssi } => println!("[RSSI] {id} {rssi} dBm"),
            SessionEvent::Disconnected {
                peripheral_id,
                reason,
            } => match reason {
                Some(reason) => info!("❌  Disconnected from {peripheral_id}: {reason}"),
                None => info!("❌  Disconnected from {peripheral_id}"),
            },
            SessionEvent::AdapterStateChanged(state) => info!("Adapter: {state:?}"),
            SessionEvent::Failed(e) => error!("{e}"),
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}

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
    bail!("built without the `platform` feature; rebuild with --features platform or pass --simulate")
}

async fn run_command(handle: &SessionHandle, line: &str) -> Result<()> {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };
    match command {
        "help" | "?" => println!("{HELP}"),
        "scan" => handle.start_scan().await?,
        "stop" => handle.stop_scan().await?,
        "list" => print_list(&handle.snapshot().await?),
        "json" => println!("{}", serde_json::to_string_pretty(&handle.snapshot().await?)?),
        "connect" => {
            let snapshot = handle.snapshot().await?;
            let id = resolve_peripheral(&snapshot, arg)?;
            let phase = handle.connect(&id).await?;
            info!("connect {id}: {phase}");
        }
        "disconnect" => handle.disconnect().await?,
        "read" => println!("[READ] {}", hex(&handle.read().await?)),
        "write" => {
            let bytes = parse_hex(arg)?;
            handle.write(bytes).await?;
        }
        "notify" => {
            let enabled = handle.toggle_notify().await?;
            info!("Notifications {}", if enabled { "on" } else { "off" });
        }
        "rssi" => {
            handle.refresh_rssi().await?;
        }
        other => bail!("unknown command {other:?} (try `help`)"),
    }
    Ok(())
}

/// A list index (`0`, `1`, …) or a literal peripheral id.
fn resolve_peripheral(snapshot: &SessionSnapshot, arg: &str) -> Result<String> {
    if arg.is_empty() {
        bail!("usage: connect <id|#>");
    }
    if let Ok(index) = arg.parse::<usize>() {
        if let Some(record) = snapshot.peripherals.get(index) {
            return Ok(record.id.clone());
        }
    }
    Ok(arg.to_owned())
}

fn print_list(snapshot: &SessionSnapshot) {
    if snapshot.peripherals.is_empty() {
        println!("(no peripherals)");
        return;
    }
    for (i, p) in snapshot.peripherals.iter().enumerate() {
        println!(
            "{i:>3}  {:<24} {:<20} {:>4} dBm  {:?}",
            p.id,
            p.label(),
            p.rssi,
            p.connection_state
        );
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `"0007 0234"`, `"00 07 02 34"` or `"0x00070234"` into bytes.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !digits.is_ascii() || digits.is_empty() || digits.len() % 2 != 0 {
        bail!("expected an even number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| anyhow::anyhow!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}
