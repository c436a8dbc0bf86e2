use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("pty writer not available")]
    WriterGone,
    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pty error: {0}")]
    Other(String),
}

/// Events produced by the PTY reader/waiter tasks.
#[derive(Debug)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited(Option<u32>),
}

#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// One pseudo-terminal-backed shell process: raw byte sink plus resize.
///
/// Spawn failures (missing binary, permission denied) surface as a
/// `PtyError::Spawn` from [`PtyProcess::spawn`]; exit is reported once
/// through the event channel and the process is never restarted here.
pub struct PtyProcess {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyProcess {
    /// Spawn the shell and start the blocking reader and waiter tasks.
    /// Output chunks and the final exit notice arrive on `events`.
    pub fn spawn(
        opts: PtyOptions,
        events: mpsc::UnboundedSender<PtyEvent>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Other(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&opts.shell);
        cmd.args(&opts.args);
        cmd.cwd(&opts.cwd);
        // CommandBuilder starts from an empty environment; inherit ours
        // before applying the session-specific overrides.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Other(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Other(e.to_string()))?;

        let read_events = events.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_events.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "pty read ended");
                        break;
                    }
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    error!(error = %e, "waiting on pty child failed");
                    None
                }
            };
            let _ = events.send(PtyEvent::Exited(code));
        });

        Ok(Self {
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(Some(writer))),
            killer: Mutex::new(killer),
        })
    }

    /// Deliver bytes to the child's stdin.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(PtyError::WriterGone)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the terminal. Idempotent; takes effect before the next
    /// read is delivered.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Other(e.to_string()))
    }

    /// Kill the child process. The waiter task reports the exit.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = killer.kill();
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
