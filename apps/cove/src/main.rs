use std::io::Write;

use clap::Parser;
use cove_client_core::config::StateStore;
use cove_client_core::registry::CoveEngine;
use cove_client_core::{ClientEvent, SessionKey};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "cove", about = "Attach to a cove host from the terminal")]
struct Cli {
    /// Primary host, e.g. http://box:9846
    url: String,
    /// Password for the primary host
    #[arg(long, env = "COVE_PASSWORD")]
    password: Option<String>,
    /// Also connect the hosts remembered in the primary's cluster roster
    #[arg(long)]
    cluster: bool,
}

enum InputAction {
    Bytes(Vec<u8>),
    Resize(u16, u16),
    Quit,
}

fn key_to_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphabetic() {
                Some(vec![c as u8 - b'a' + 1])
            } else {
                None
            }
        }
        KeyCode::Char(c) => Some(c.to_string().into_bytes()),
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        _ => None,
    }
}

/// Blocking reader feeding terminal events to the async side.
/// Ctrl-Q detaches the client; everything else goes to the shell.
fn input_task(tx: mpsc::UnboundedSender<InputAction>) {
    loop {
        let event = match crossterm::event::read() {
            Ok(event) => event,
            Err(_) => {
                let _ = tx.send(InputAction::Quit);
                return;
            }
        };
        let action = match event {
            Event::Key(key)
                if key.code == KeyCode::Char('q')
                    && key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                InputAction::Quit
            }
            Event::Key(key) => match key_to_bytes(key) {
                Some(bytes) => InputAction::Bytes(bytes),
                None => continue,
            },
            Event::Resize(cols, rows) => InputAction::Resize(cols, rows),
            _ => continue,
        };
        let quit = matches!(action, InputAction::Quit);
        if tx.send(action).is_err() || quit {
            return;
        }
    }
}

struct RawMode;

impl RawMode {
    fn enter() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = match StateStore::open() {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "state persistence unavailable");
            None
        }
    };

    let (engine, mut events) = CoveEngine::new(store);
    engine.add_host("primary", &cli.url, None, true, None)?;
    if let Some(password) = &cli.password {
        engine.login("primary", password);
    }

    let _raw = RawMode::enter()?;
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || input_task(input_tx));

    let mut hydrated = !cli.cluster;
    let mut focused: Option<SessionKey> = None;
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::SessionAdded { key, .. } => {
                        if focused.is_none() {
                            focused = Some(key.clone());
                            engine.focus(Some(key));
                        }
                        if !hydrated {
                            hydrated = true;
                            if let Err(e) = engine.hydrate_cluster().await {
                                warn!(error = %e, "cluster hydrate failed");
                            }
                        }
                    }
                    ClientEvent::FocusChanged { key } => {
                        focused = key;
                    }
                    ClientEvent::Snapshot { key, data } | ClientEvent::Output { key, data } => {
                        if focused.as_ref() == Some(&key) {
                            stdout.write_all(data.as_bytes())?;
                            stdout.flush()?;
                        }
                    }
                    ClientEvent::EmptyState => {
                        eprintln!("\r\nno sessions remain; press Ctrl-Q to quit\r");
                    }
                    ClientEvent::AuthRequired { host_id, forced } => {
                        if forced {
                            eprintln!("\r\n{host_id}: access revoked, log in again with --password\r");
                        } else {
                            eprintln!("\r\n{host_id}: password required (--password or COVE_PASSWORD)\r");
                        }
                    }
                    ClientEvent::GatewayLogin { host_id, url } => {
                        eprintln!("\r\n{host_id}: complete the gateway login at {url}\r");
                    }
                    ClientEvent::ReloadRequired => {
                        eprintln!("\r\nprimary host restarted; detach and reattach to resync\r");
                    }
                    _ => {}
                }
            }
            action = input_rx.recv() => {
                let Some(action) = action else { break };
                match action {
                    InputAction::Quit => break,
                    InputAction::Bytes(bytes) => {
                        if let Some(key) = &focused {
                            engine.send_input(key, &String::from_utf8_lossy(&bytes));
                        }
                    }
                    InputAction::Resize(cols, rows) => {
                        if let Some(key) = &focused {
                            engine.resize(key, cols, rows);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
