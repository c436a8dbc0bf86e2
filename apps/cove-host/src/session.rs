use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use cove_proto::{CommandExecution, FileWrite, ServerFrame, SessionInfo, SessionStatus, SessionUpdate};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{CommandCapture, Normalizer, Token, PROMPT_OSC};
use crate::pty::{PtyError, PtyEvent, PtyOptions, PtyProcess};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Default)]
struct Meta {
    title: Option<String>,
    cwd: Option<String>,
    env: HashMap<String, String>,
    cols: u16,
    rows: u16,
}

/// Scrollback and the (at most one) attached transport, guarded together
/// so a snapshot and the sender swap happen atomically with respect to
/// new output. A frame is either in the snapshot or delivered after it,
/// never both and never neither.
struct StreamState {
    scrollback: VecDeque<u8>,
    limit: usize,
    sender: Option<mpsc::UnboundedSender<ServerFrame>>,
}

impl StreamState {
    fn append(&mut self, bytes: &[u8]) {
        self.scrollback.extend(bytes.iter().copied());
        while self.scrollback.len() > self.limit {
            self.scrollback.pop_front();
        }
    }

    fn send(&mut self, frame: ServerFrame) {
        if let Some(sender) = &self.sender {
            if sender.send(frame).is_err() {
                self.sender = None;
            }
        }
    }
}

/// One live shell session: PTY, bounded raw scrollback, command capture
/// and a single attached websocket transport.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub shell: String,
    pub initial_cwd: String,
    pty: PtyProcess,
    meta: RwLock<Meta>,
    stream: Mutex<StreamState>,
    capture: Mutex<(Normalizer, CommandCapture)>,
    editor_state: Mutex<Option<serde_json::Value>>,
    ended: AtomicBool,
    rc_file: Option<PathBuf>,
}

pub struct SpawnOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub history_limit: usize,
}

impl Session {
    /// Spawn the shell and the event pump. `exited` receives the session
    /// id once the child process is gone.
    pub fn spawn(
        opts: SpawnOptions,
        exited: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Self>, PtyError> {
        let id = Uuid::new_v4().to_string();
        let sentinel: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let (args, rc_file) = prompt_mark_args(&opts.shell, &id, &sentinel);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pty = PtyProcess::spawn(
            PtyOptions {
                shell: opts.shell.clone(),
                args,
                cwd: opts.cwd.clone(),
                env: HashMap::new(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            },
            events_tx,
        )?;

        let session = Arc::new(Self {
            id: id.clone(),
            created_at: Utc::now(),
            shell: opts.shell,
            initial_cwd: opts.cwd.to_string_lossy().into_owned(),
            pty,
            meta: RwLock::new(Meta {
                cwd: Some(opts.cwd.to_string_lossy().into_owned()),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                ..Meta::default()
            }),
            stream: Mutex::new(StreamState {
                scrollback: VecDeque::new(),
                limit: opts.history_limit,
                sender: None,
            }),
            capture: Mutex::new((Normalizer::new(sentinel), CommandCapture::new())),
            editor_state: Mutex::new(None),
            ended: AtomicBool::new(false),
            rc_file,
        });

        let pump = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PtyEvent::Output(bytes) => pump.on_output(&bytes),
                    PtyEvent::Exited(code) => {
                        info!(session = %pump.id, code = ?code, "shell exited");
                        pump.on_exit();
                        let _ = exited.send(pump.id.clone());
                        break;
                    }
                }
            }
        });

        info!(session = %id, "session spawned");
        Ok(session)
    }

    fn on_output(&self, bytes: &[u8]) {
        let tokens = {
            let mut capture = self.capture.lock().unwrap_or_else(|e| e.into_inner());
            let (normalizer, commands) = &mut *capture;
            let tokens = normalizer.feed(bytes);
            for token in &tokens {
                if let Some(exec) = commands.observe(token) {
                    debug!(session = %self.id, input = %exec.input, "command completed");
                }
            }
            tokens
        };

        let mut meta_frame = None;
        for token in &tokens {
            match token {
                Token::Title(title) => {
                    let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
                    meta.title = Some(title.clone());
                    meta_frame = Some(self.meta_frame(&meta));
                }
                Token::Cwd(cwd) => {
                    let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
                    meta.cwd = Some(cwd.clone());
                    meta_frame = Some(self.meta_frame(&meta));
                }
                _ => {}
            }
        }

        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.append(bytes);
        stream.send(ServerFrame::Output {
            data: String::from_utf8_lossy(bytes).into_owned(),
        });
        if let Some(frame) = meta_frame {
            stream.send(frame);
        }
    }

    fn on_exit(&self) {
        self.ended.store(true, Ordering::SeqCst);
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.send(ServerFrame::Status {
            status: SessionStatus::Ended,
        });
        stream.sender = None;
        if let Some(rc) = &self.rc_file {
            let _ = std::fs::remove_file(rc);
        }
    }

    fn meta_frame(&self, meta: &Meta) -> ServerFrame {
        ServerFrame::Meta {
            title: meta.title.clone(),
            cwd: meta.cwd.clone(),
            env: if meta.env.is_empty() {
                None
            } else {
                Some(meta.env.clone())
            },
            cols: Some(meta.cols),
            rows: Some(meta.rows),
        }
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Attach a transport, superseding any previous one. The previous
    /// transport receives a detached status before being dropped. The
    /// snapshot lands on the new channel before any later output frame.
    pub fn attach(&self, sender: mpsc::UnboundedSender<ServerFrame>) {
        let meta_frame = {
            let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
            self.meta_frame(&meta)
        };
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = stream.sender.take() {
            debug!(session = %self.id, "superseding attached transport");
            let _ = old.send(ServerFrame::Status {
                status: SessionStatus::Detached,
            });
        }
        let snapshot = String::from_utf8_lossy(
            &stream.scrollback.iter().copied().collect::<Vec<u8>>(),
        )
        .into_owned();
        let _ = sender.send(ServerFrame::Snapshot { data: snapshot });
        let _ = sender.send(meta_frame);
        if self.ended() {
            let _ = sender.send(ServerFrame::Status {
                status: SessionStatus::Ended,
            });
        } else {
            stream.sender = Some(sender);
        }
    }

    /// Drop the attached transport if it is the one backing `sender`.
    pub fn detach_if_current(&self, sender: &mpsc::UnboundedSender<ServerFrame>) {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = &stream.sender {
            if current.same_channel(sender) {
                stream.sender = None;
            }
        }
    }

    pub fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        self.pty.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        {
            let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
            if meta.cols == cols && meta.rows == rows {
                return Ok(());
            }
        }
        self.pty.resize(cols, rows)?;
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());
        meta.cols = cols;
        meta.rows = rows;
        Ok(())
    }

    pub fn kill(&self) {
        self.pty.kill();
    }

    /// Apply one heartbeat update. Fields are independent; a failing
    /// field is logged and skipped without affecting the others.
    pub fn apply_update(&self, update: &SessionUpdate) {
        if let Some(resize) = &update.resize {
            if let Err(e) = self.resize(resize.cols, resize.rows) {
                warn!(session = %self.id, error = %e, "resize failed");
            }
        }
        if let Some(state) = &update.editor_state {
            *self.editor_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        }
        if let Some(writes) = &update.file_writes {
            for write in writes {
                if let Err(e) = self.write_file(write) {
                    warn!(session = %self.id, path = %write.path, error = %e, "file write failed");
                }
            }
        }
    }

    fn write_file(&self, write: &FileWrite) -> std::io::Result<()> {
        let path = Path::new(&write.path);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
            Path::new(meta.cwd.as_deref().unwrap_or(&self.initial_cwd)).join(path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, &write.content)
    }

    pub fn editor_state(&self) -> Option<serde_json::Value> {
        self.editor_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_execution(&self) -> Option<CommandExecution> {
        let capture = self.capture.lock().unwrap_or_else(|e| e.into_inner());
        capture.1.last_execution().cloned()
    }

    pub fn info(&self) -> SessionInfo {
        // Capture lock is released before the meta lock is taken.
        let last_execution = self.last_execution();
        let meta = self.meta.read().unwrap_or_else(|e| e.into_inner());
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            shell: self.shell.clone(),
            initial_cwd: self.initial_cwd.clone(),
            title: meta.title.clone(),
            cwd: meta.cwd.clone(),
            env: meta.env.clone(),
            cols: meta.cols,
            rows: meta.rows,
            last_execution,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(rc) = &self.rc_file {
            let _ = std::fs::remove_file(rc);
        }
    }
}

/// Build shell arguments that arrange prompt marks. Only bash supports
/// rc file injection here; other shells run unmarked and command capture
/// stays inactive for them.
fn prompt_mark_args(shell: &str, id: &str, sentinel: &str) -> (Vec<String>, Option<PathBuf>) {
    let base = Path::new(shell)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base != "bash" {
        return (Vec::new(), None);
    }
    let rc = std::env::temp_dir().join(format!("cove-rc-{id}.sh"));
    let contents = format!(
        "[ -f /etc/bash.bashrc ] && source /etc/bash.bashrc\n\
         [ -f \"$HOME/.bashrc\" ] && source \"$HOME/.bashrc\"\n\
         PS1=\"\\[\\e]{osc};{sentinel};A\\a\\]${{PS1}}\\[\\e]{osc};{sentinel};B\\a\\]\"\n",
        osc = PROMPT_OSC,
    );
    match std::fs::write(&rc, contents) {
        Ok(()) => (
            vec!["--rcfile".to_string(), rc.to_string_lossy().into_owned()],
            Some(rc),
        ),
        Err(e) => {
            warn!(error = %e, "could not write prompt rc file, capture disabled");
            (Vec::new(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_sh() -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            SpawnOptions {
                shell: "/bin/sh".into(),
                cwd: std::env::temp_dir(),
                history_limit: 64 * 1024,
            },
            tx,
        )
        .expect("spawn /bin/sh");
        (session, rx)
    }

    async fn wait_for_output(
        rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
        needle: &str,
    ) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let frame = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("frame before deadline")
                .expect("channel open");
            match frame {
                ServerFrame::Snapshot { data } | ServerFrame::Output { data } => {
                    seen.push_str(&data);
                    if seen.contains(needle) {
                        return seen;
                    }
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn attach_delivers_snapshot_before_live_output() {
        let (session, _exited) = spawn_sh();
        session.write_input(b"printf before-attach\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach(tx);
        let first = rx.recv().await.expect("snapshot frame");
        match first {
            ServerFrame::Snapshot { data } => assert!(data.contains("before-attach")),
            other => panic!("expected snapshot first, got {other:?}"),
        }
        session.kill();
    }

    #[tokio::test]
    async fn second_attach_supersedes_first() {
        let (session, _exited) = spawn_sh();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        session.attach(tx1);
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        session.attach(tx2);

        let mut detached = false;
        while let Ok(frame) = rx1.try_recv() {
            if matches!(
                frame,
                ServerFrame::Status {
                    status: SessionStatus::Detached
                }
            ) {
                detached = true;
            }
        }
        assert!(detached, "first transport should learn it was superseded");

        session.write_input(b"printf to-second\n").unwrap();
        wait_for_output(&mut rx2, "to-second").await;
        session.kill();
    }

    #[tokio::test]
    async fn exit_reports_ended_and_session_id() {
        let (session, mut exited) = spawn_sh();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach(tx);
        session.write_input(b"exit\n").unwrap();

        let id = tokio::time::timeout(Duration::from_secs(10), exited.recv())
            .await
            .expect("exit notice")
            .expect("channel open");
        assert_eq!(id, session.id);
        assert!(session.ended());

        let mut saw_ended = false;
        while let Ok(frame) = rx.try_recv() {
            if matches!(
                frame,
                ServerFrame::Status {
                    status: SessionStatus::Ended
                }
            ) {
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn apply_update_is_per_field_and_resize_idempotent() {
        let (session, _exited) = spawn_sh();
        let dir = std::env::temp_dir().join(format!("cove-test-{}", session.id));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("note.txt");

        session.apply_update(&SessionUpdate {
            id: session.id.clone(),
            resize: Some(cove_proto::Resize { cols: 120, rows: 40 }),
            editor_state: Some(serde_json::json!({"open": ["a.rs"]})),
            file_writes: Some(vec![FileWrite {
                path: target.to_string_lossy().into_owned(),
                content: "hello".into(),
            }]),
        });
        // Same resize again must be a no-op rather than an error.
        session.apply_update(&SessionUpdate {
            id: session.id.clone(),
            resize: Some(cove_proto::Resize { cols: 120, rows: 40 }),
            editor_state: None,
            file_writes: None,
        });

        let info = session.info();
        assert_eq!((info.cols, info.rows), (120, 40));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
        assert_eq!(
            session.editor_state(),
            Some(serde_json::json!({"open": ["a.rs"]}))
        );
        session.kill();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scrollback_evicts_oldest_bytes() {
        let mut state = StreamState {
            scrollback: VecDeque::new(),
            limit: 8,
            sender: None,
        };
        state.append(b"0123456789");
        let kept: Vec<u8> = state.scrollback.iter().copied().collect();
        assert_eq!(kept, b"23456789");
    }

    #[test]
    fn prompt_args_only_for_bash() {
        let (args, rc) = prompt_mark_args("/bin/zsh", "id", "s");
        assert!(args.is_empty());
        assert!(rc.is_none());

        let (args, rc) = prompt_mark_args("/bin/bash", "test-rc", "s");
        assert_eq!(args[0], "--rcfile");
        let rc = rc.unwrap();
        let body = std::fs::read_to_string(&rc).unwrap();
        assert!(body.contains("]7770;s;A"));
        assert!(body.contains("]7770;s;B"));
        let _ = std::fs::remove_file(rc);
    }
}
