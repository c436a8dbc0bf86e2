use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cove_proto::{
    ClusterHost, ClusterPayload, HeartbeatRequest, HeartbeatResponse, HeartbeatUpdates, Resize,
    ServerFrame, SessionStatus,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PersistedState, StateStore};
use crate::error::HostError;
use crate::heartbeat::{BootIdLatch, Cadence, HEARTBEAT_INTERVAL};
use crate::host::HostClient;
use crate::pending::PendingChanges;
use crate::reconcile;
use crate::session::CachedSession;
use crate::transport::SessionTransport;
use crate::{ClientEvent, HostState, SessionKey};

/// Last problem the user was told about for a host, so a failing host
/// produces one notification per distinct condition instead of one per
/// heartbeat tick.
#[derive(Debug, Clone, PartialEq)]
enum Notice {
    Auth { forced: bool },
    Gateway(String),
}

struct HostEntry {
    client: Arc<HostClient>,
    primary: bool,
    /// Display name from the cluster roster, when one is known.
    alias: Option<String>,
    state: HostState,
    /// Round trip of the most recent successful heartbeat.
    last_latency: Option<Duration>,
    cadence: Cadence,
    pending: PendingChanges,
    sessions: Vec<CachedSession>,
    /// Dropped to cancel the loop and discard any in-flight response.
    alive: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    /// Secondary whose auth was rejected: no more heartbeats until the
    /// user reconnects explicitly.
    halted: bool,
    last_notice: Option<Notice>,
}

impl HostEntry {
    fn session(&mut self, session_id: &str) -> Option<&mut CachedSession> {
        self.sessions.iter_mut().find(|s| s.key.session_id == session_id)
    }

    fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        for session in &mut self.sessions {
            session.close_transport();
        }
    }
}

struct Inner {
    hosts: Mutex<Vec<HostEntry>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    frames: mpsc::UnboundedSender<(SessionKey, ServerFrame)>,
    focused: Mutex<Option<SessionKey>>,
    latch: Mutex<BootIdLatch>,
    state_store: Option<StateStore>,
}

/// The multi-host engine: owns every [`HostClient`], its heartbeat loop
/// and its session transports, and reports through the event stream
/// handed out at construction.
pub struct CoveEngine {
    inner: Arc<Inner>,
}

impl CoveEngine {
    pub fn new(state_store: Option<StateStore>) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let persisted = state_store.as_ref().map(|s| s.load()).unwrap_or_default();

        let inner = Arc::new(Inner {
            hosts: Mutex::new(Vec::new()),
            events: events_tx,
            frames: frames_tx,
            focused: Mutex::new(None),
            latch: Mutex::new(BootIdLatch::new(persisted.primary_boot_id.clone())),
            state_store,
        });

        tokio::spawn(frame_pump(Arc::clone(&inner), frames_rx));

        (Self { inner }, events_rx)
    }

    /// Register a host and start its heartbeat loop. A host whose
    /// endpoint resolves to an already-registered one replaces that
    /// entry in place, keeping its position in the roster.
    pub fn add_host(
        &self,
        id: impl Into<String>,
        base_url: &str,
        alias: Option<String>,
        primary: bool,
        token: Option<String>,
    ) -> Result<String, HostError> {
        let id = id.into();
        let client = Arc::new(HostClient::new(id.clone(), base_url)?);
        let token = if primary && token.is_none() {
            self.persisted().primary_token
        } else {
            token
        };
        client.set_token(token);

        let alive = Arc::new(AtomicBool::new(true));
        let entry = HostEntry {
            client: Arc::clone(&client),
            primary,
            alias,
            state: HostState::Disconnected,
            last_latency: None,
            cadence: Cadence::default(),
            pending: PendingChanges::new(),
            sessions: Vec::new(),
            alive: Arc::clone(&alive),
            task: None,
            halted: false,
            last_notice: None,
        };

        let key = client.endpoint_key();
        {
            let mut hosts = self.inner.hosts.lock();
            let mut entry = entry;
            entry.task = Some(tokio::spawn(heartbeat_loop(
                Arc::clone(&self.inner),
                Arc::clone(&client),
                alive,
            )));
            match hosts.iter().position(|h| h.client.endpoint_key() == key) {
                Some(idx) => {
                    info!(host = %id, endpoint = %key, "replacing host at same endpoint");
                    let mut old = std::mem::replace(&mut hosts[idx], entry);
                    drop(hosts);
                    let removed: Vec<SessionKey> =
                        old.sessions.iter().map(|s| s.key.clone()).collect();
                    old.shutdown();
                    for key in removed {
                        let _ = self.inner.events.send(ClientEvent::SessionRemoved { key });
                    }
                    refocus_after_removal(&self.inner);
                }
                None => hosts.push(entry),
            }
        }
        self.emit_state(&id, HostState::Disconnected);
        Ok(id)
    }

    pub fn remove_host(&self, host_id: &str) {
        let removed_sessions = {
            let mut hosts = self.inner.hosts.lock();
            match hosts.iter().position(|h| h.client.id == host_id) {
                Some(idx) => {
                    let mut entry = hosts.remove(idx);
                    entry.shutdown();
                    entry
                        .sessions
                        .iter()
                        .map(|s| s.key.clone())
                        .collect::<Vec<_>>()
                }
                None => return,
            }
        };
        for key in removed_sessions {
            let _ = self.inner.events.send(ClientEvent::SessionRemoved { key });
        }
        self.emit_state(host_id, HostState::Terminated);
        refocus_after_removal(&self.inner);
    }

    /// Store credentials for a host and retry immediately.
    pub fn login(&self, host_id: &str, password: &str) {
        let mut hosts = self.inner.hosts.lock();
        let Some(entry) = hosts.iter_mut().find(|h| h.client.id == host_id) else {
            return;
        };
        entry.client.login(password);
        entry.halted = false;
        entry.last_notice = None;
        entry.cadence.reset();
        if entry.primary {
            let token = entry.client.token();
            drop(hosts);
            self.update_persisted(|state| state.primary_token = token);
        }
    }

    /// Manual reconnect: clears the cooldown and any auth halt so the
    /// next tick attempts a heartbeat right away.
    pub fn reconnect(&self, host_id: &str) {
        let mut hosts = self.inner.hosts.lock();
        if let Some(entry) = hosts.iter_mut().find(|h| h.client.id == host_id) {
            entry.halted = false;
            entry.last_notice = None;
            entry.cadence.reset();
            entry.state = HostState::Connecting;
            let id = entry.client.id.clone();
            drop(hosts);
            self.emit_state(&id, HostState::Connecting);
        }
    }

    pub fn send_input(&self, key: &SessionKey, data: &str) {
        let hosts = self.inner.hosts.lock();
        if let Some(entry) = hosts.iter().find(|h| h.client.id == key.host_id) {
            if let Some(session) = entry
                .sessions
                .iter()
                .find(|s| s.key.session_id == key.session_id)
            {
                if let Some(transport) = &session.transport {
                    transport.send_input(data.to_string());
                }
            }
        }
    }

    /// Propagate a geometry change. Suppressed entirely when the session
    /// already has this geometry, so repeated identical resizes send
    /// nothing anywhere.
    pub fn resize(&self, key: &SessionKey, cols: u16, rows: u16) {
        let mut hosts = self.inner.hosts.lock();
        let Some(entry) = hosts.iter_mut().find(|h| h.client.id == key.host_id) else {
            return;
        };
        let Some(session) = entry.session(&key.session_id) else {
            return;
        };
        if (session.info.cols, session.info.rows) == (cols, rows) {
            return;
        }
        session.info.cols = cols;
        session.info.rows = rows;
        if let Some(transport) = &session.transport {
            transport.send_resize(cols, rows);
        }
        entry
            .pending
            .queue_resize(&key.session_id, Resize { cols, rows });
    }

    pub fn set_editor_state(&self, key: &SessionKey, state: serde_json::Value) {
        let mut hosts = self.inner.hosts.lock();
        if let Some(entry) = hosts.iter_mut().find(|h| h.client.id == key.host_id) {
            entry.pending.queue_editor_state(&key.session_id, state);
        }
    }

    pub fn queue_file_write(&self, key: &SessionKey, write: cove_proto::FileWrite) {
        let mut hosts = self.inner.hosts.lock();
        if let Some(entry) = hosts.iter_mut().find(|h| h.client.id == key.host_id) {
            entry.pending.queue_file_write(&key.session_id, write);
        }
    }

    pub async fn create_session(
        &self,
        host_id: &str,
        cwd: Option<String>,
    ) -> Result<SessionKey, HostError> {
        let client = self.client(host_id)?;
        let info = client.create_session(cwd).await?;
        // The next heartbeat reconciles it into the cache.
        Ok(SessionKey::new(host_id, info.id))
    }

    pub async fn close_session(&self, key: &SessionKey) -> Result<(), HostError> {
        let client = self.client(&key.host_id)?;
        client.delete_session(&key.session_id).await?;
        Ok(())
    }

    pub fn focus(&self, key: Option<SessionKey>) {
        *self.inner.focused.lock() = key.clone();
        let _ = self.inner.events.send(ClientEvent::FocusChanged { key });
    }

    pub fn focused(&self) -> Option<SessionKey> {
        self.inner.focused.lock().clone()
    }

    pub fn host_state(&self, host_id: &str) -> Option<HostState> {
        self.inner
            .hosts
            .lock()
            .iter()
            .find(|h| h.client.id == host_id)
            .map(|h| h.state)
    }

    pub fn host_alias(&self, host_id: &str) -> Option<String> {
        self.inner
            .hosts
            .lock()
            .iter()
            .find(|h| h.client.id == host_id)
            .and_then(|h| h.alias.clone())
    }

    pub fn host_latency(&self, host_id: &str) -> Option<Duration> {
        self.inner
            .hosts
            .lock()
            .iter()
            .find(|h| h.client.id == host_id)
            .and_then(|h| h.last_latency)
    }

    pub fn sessions(&self) -> Vec<SessionKey> {
        let hosts = self.inner.hosts.lock();
        hosts
            .iter()
            .flat_map(|h| h.sessions.iter().map(|s| s.key.clone()))
            .collect()
    }

    /// Pull the roster from the primary and register every listed host.
    pub async fn hydrate_cluster(&self) -> Result<usize, HostError> {
        let primary = self.primary_client()?;
        let payload = primary.get_cluster().await?;
        let mut added = 0;
        for server in payload.servers {
            let alias = (!server.host.is_empty()).then(|| server.host.clone());
            if self
                .add_host(server.id.clone(), &server.base_url, alias, false, server.token)
                .is_ok()
            {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Persist a secondary host to the primary's roster ("remember").
    pub async fn remember_host(&self, host_id: &str) -> Result<(), HostError> {
        let primary = self.primary_client()?;
        let entry = {
            let hosts = self.inner.hosts.lock();
            let host = hosts
                .iter()
                .find(|h| h.client.id == host_id)
                .ok_or_else(|| HostError::Protocol(format!("unknown host {host_id}")))?;
            ClusterHost {
                id: host.client.id.clone(),
                base_url: host.client.base_url().to_string(),
                host: host
                    .sessions
                    .first()
                    .and_then(|s| s.info.title.clone())
                    .unwrap_or_else(|| host.client.endpoint_key()),
                token: host.client.token(),
            }
        };
        let mut payload = primary.get_cluster().await?;
        payload.servers.retain(|s| s.id != entry.id);
        payload.servers.push(entry);
        primary.put_cluster(&payload).await
    }

    pub async fn forget_host(&self, host_id: &str) -> Result<(), HostError> {
        let primary = self.primary_client()?;
        let mut payload = primary.get_cluster().await?;
        payload.servers.retain(|s| s.id != host_id);
        primary.put_cluster(&payload).await
    }

    pub async fn cluster(&self) -> Result<ClusterPayload, HostError> {
        self.primary_client()?.get_cluster().await
    }

    fn client(&self, host_id: &str) -> Result<Arc<HostClient>, HostError> {
        self.inner
            .hosts
            .lock()
            .iter()
            .find(|h| h.client.id == host_id)
            .map(|h| Arc::clone(&h.client))
            .ok_or_else(|| HostError::Protocol(format!("unknown host {host_id}")))
    }

    fn primary_client(&self) -> Result<Arc<HostClient>, HostError> {
        self.inner
            .hosts
            .lock()
            .iter()
            .find(|h| h.primary)
            .map(|h| Arc::clone(&h.client))
            .ok_or_else(|| HostError::Protocol("no primary host registered".into()))
    }

    fn persisted(&self) -> PersistedState {
        self.inner
            .state_store
            .as_ref()
            .map(|s| s.load())
            .unwrap_or_default()
    }

    fn update_persisted(&self, mutate: impl FnOnce(&mut PersistedState)) {
        if let Some(store) = &self.inner.state_store {
            let mut state = store.load();
            mutate(&mut state);
            if let Err(e) = store.save(&state) {
                warn!(error = %e, "persisting client state failed");
            }
        }
    }

    fn emit_state(&self, host_id: &str, state: HostState) {
        let _ = self.inner.events.send(ClientEvent::HostStateChanged {
            host_id: host_id.to_string(),
            state,
        });
    }
}

impl Drop for CoveEngine {
    fn drop(&mut self) {
        let mut hosts = self.inner.hosts.lock();
        for entry in hosts.iter_mut() {
            entry.shutdown();
        }
    }
}

/// Per-host driver. One tick per second; transports are repaired every
/// tick, heartbeats obey the cooldown and the auth halt.
async fn heartbeat_loop(inner: Arc<Inner>, client: Arc<HostClient>, alive: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::SeqCst) {
            return;
        }

        repair_transports(&inner, &client);

        let batch = {
            let mut hosts = inner.hosts.lock();
            let Some(entry) = hosts.iter_mut().find(|h| h.client.id == client.id) else {
                return;
            };
            if entry.halted || !entry.cadence.should_attempt(tokio::time::Instant::now()) {
                continue;
            }
            if entry.state == HostState::Disconnected {
                entry.state = HostState::Connecting;
                let _ = inner.events.send(ClientEvent::HostStateChanged {
                    host_id: client.id.clone(),
                    state: HostState::Connecting,
                });
            }
            entry.pending.snapshot()
        };

        let request = HeartbeatRequest {
            updates: HeartbeatUpdates {
                sessions: batch.updates(),
            },
        };
        let started = std::time::Instant::now();
        let result = client.heartbeat(&request).await;
        let latency = started.elapsed();
        if !alive.load(Ordering::SeqCst) {
            // Host was removed while the request was in flight.
            return;
        }
        match result {
            Ok(response) => apply_success(&inner, &client, &batch, response, latency),
            Err(err) => apply_failure(&inner, &client, err),
        }
    }
}

/// Reopen the stream for any session found without a live transport.
/// Runs on every tick, but is a no-op while the owning host is in
/// cooldown or halted, so socket retries do not herd against a host
/// the heartbeat layer is already backing off from.
fn repair_transports(inner: &Arc<Inner>, client: &Arc<HostClient>) {
    let mut hosts = inner.hosts.lock();
    let Some(entry) = hosts.iter_mut().find(|h| h.client.id == client.id) else {
        return;
    };
    if entry.halted || !entry.cadence.should_attempt(tokio::time::Instant::now()) {
        return;
    }
    let mut dropped_any = false;
    for session in &mut entry.sessions {
        if session.transport_open() {
            continue;
        }
        // A transport that existed and closed is a drop; a session that
        // never had one is just awaiting its first attach.
        dropped_any |= session.transport.is_some();
        session.close_transport();
        match client.ws_url(&session.key.session_id) {
            Ok(url) => {
                debug!(session = %session.key, "reopening transport");
                session.transport = Some(SessionTransport::connect(
                    url,
                    session.key.clone(),
                    inner.frames.clone(),
                ));
            }
            Err(e) => warn!(session = %session.key, error = %e, "transport url invalid"),
        }
    }
    // A dropped stream degrades the host until the next successful
    // heartbeat confirms it. The cooldown stays untouched.
    if dropped_any && entry.state == HostState::Connected {
        entry.state = HostState::Reconnecting;
        let _ = inner.events.send(ClientEvent::HostStateChanged {
            host_id: client.id.clone(),
            state: HostState::Reconnecting,
        });
    }
}

fn apply_success(
    inner: &Arc<Inner>,
    client: &Arc<HostClient>,
    batch: &crate::pending::SentBatch,
    response: HeartbeatResponse,
    latency: Duration,
) {
    let mut events = Vec::new();
    let mut removed_any = false;
    {
        let mut hosts = inner.hosts.lock();
        let Some(entry) = hosts.iter_mut().find(|h| h.client.id == client.id) else {
            return;
        };
        if entry.state != HostState::Connected {
            entry.state = HostState::Connected;
            events.push(ClientEvent::HostStateChanged {
                host_id: client.id.clone(),
                state: HostState::Connected,
            });
        }
        entry.last_notice = None;
        entry.last_latency = Some(latency);
        entry.cadence.record_success();
        entry.pending.clear_sent(batch);

        let local_ids: HashSet<String> = entry
            .sessions
            .iter()
            .map(|s| s.key.session_id.clone())
            .collect();
        let plan = reconcile::plan(&response.sessions, &local_ids);

        for session_id in &plan.removed {
            if let Some(idx) = entry
                .sessions
                .iter()
                .position(|s| &s.key.session_id == session_id)
            {
                let mut gone = entry.sessions.remove(idx);
                gone.close_transport();
                entry.pending.drop_session(session_id);
                events.push(ClientEvent::SessionRemoved {
                    key: gone.key.clone(),
                });
                removed_any = true;
            }
        }
        for info in plan.added {
            let key = SessionKey::new(client.id.clone(), info.id.clone());
            events.push(ClientEvent::SessionAdded {
                key: key.clone(),
                info: info.clone(),
            });
            entry.sessions.push(CachedSession::new(key, info));
        }
        for info in plan.kept {
            if let Some(session) = entry.session(&info.id) {
                if session.merge_info(&info) {
                    events.push(ClientEvent::SessionUpdated {
                        key: session.key.clone(),
                        info: session.info.clone(),
                    });
                }
            }
        }

        events.push(ClientEvent::SystemUpdate {
            host_id: client.id.clone(),
            system: response.system,
            latency_ms: latency.as_millis() as u64,
        });

        if entry.primary {
            let mut latch = inner.latch.lock();
            if latch.observe(&response.runtime.boot_id) {
                events.push(ClientEvent::ReloadRequired);
                if let Some(store) = &inner.state_store {
                    let mut state = store.load();
                    state.primary_boot_id = latch.current().map(str::to_string);
                    if let Err(e) = store.save(&state) {
                        warn!(error = %e, "persisting boot id failed");
                    }
                }
            }
        }
    }
    for event in events {
        let _ = inner.events.send(event);
    }
    if removed_any {
        refocus_after_removal(inner);
    }
}

fn apply_failure(inner: &Arc<Inner>, client: &Arc<HostClient>, err: HostError) {
    let mut events = Vec::new();
    let mut clear_primary_token = false;
    {
        let mut hosts = inner.hosts.lock();
        let Some(entry) = hosts.iter_mut().find(|h| h.client.id == client.id) else {
            return;
        };
        if entry.state == HostState::Connected || entry.state == HostState::Connecting {
            entry.state = HostState::Reconnecting;
            events.push(ClientEvent::HostStateChanged {
                host_id: client.id.clone(),
                state: HostState::Reconnecting,
            });
        }
        entry.cadence.record_failure(tokio::time::Instant::now());

        let notice = match &err {
            HostError::Unauthorized => {
                if entry.primary {
                    // A primary 401 means the stored token went stale;
                    // drop it and ask the user to log in again.
                    entry.client.set_token(None);
                    clear_primary_token = true;
                } else {
                    // Secondary credentials are not escrowed; stop
                    // polling until the user reconnects by hand.
                    entry.halted = true;
                }
                Some(Notice::Auth { forced: false })
            }
            HostError::Locked => {
                entry.client.set_token(None);
                entry.halted = !entry.primary;
                if entry.primary {
                    clear_primary_token = true;
                }
                Some(Notice::Auth { forced: true })
            }
            HostError::GatewayRedirect { login_url } => {
                // The gateway sits in front of the host; our token is
                // still valid behind it.
                Some(Notice::Gateway(login_url.clone()))
            }
            HostError::Transient(reason) | HostError::Protocol(reason) => {
                debug!(host = %client.id, reason = %reason, "heartbeat failed");
                None
            }
        };

        if let Some(notice) = notice {
            if entry.last_notice.as_ref() != Some(&notice) {
                entry.last_notice = Some(notice.clone());
                events.push(match notice {
                    Notice::Auth { forced } => ClientEvent::AuthRequired {
                        host_id: client.id.clone(),
                        forced,
                    },
                    Notice::Gateway(url) => ClientEvent::GatewayLogin {
                        host_id: client.id.clone(),
                        url,
                    },
                });
            }
        }
    }
    if clear_primary_token {
        if let Some(store) = &inner.state_store {
            let mut state = store.load();
            state.primary_token = None;
            if let Err(e) = store.save(&state) {
                warn!(error = %e, "clearing persisted token failed");
            }
        }
    }
    for event in events {
        let _ = inner.events.send(event);
    }
}

/// If the focused session no longer exists, move focus to the oldest
/// surviving session anywhere, or declare the empty state.
fn refocus_after_removal(inner: &Arc<Inner>) {
    let (still_exists, fallback, any_left) = {
        let hosts = inner.hosts.lock();
        let focused = inner.focused.lock().clone();
        let exists = focused.as_ref().map(|key| {
            hosts.iter().any(|h| {
                h.sessions.iter().any(|s| &s.key == key)
            })
        });
        let pairs: Vec<(SessionKey, chrono::DateTime<chrono::Utc>)> = hosts
            .iter()
            .flat_map(|h| h.sessions.iter().map(|s| (s.key.clone(), s.info.created_at)))
            .collect();
        let fallback =
            reconcile::focus_fallback(pairs.iter().map(|(k, t)| (k, t)));
        (exists, fallback, !pairs.is_empty())
    };

    match still_exists {
        Some(true) => {}
        Some(false) => {
            *inner.focused.lock() = fallback.clone();
            let _ = inner
                .events
                .send(ClientEvent::FocusChanged { key: fallback });
            if !any_left {
                let _ = inner.events.send(ClientEvent::EmptyState);
            }
        }
        None => {
            if !any_left {
                let _ = inner.events.send(ClientEvent::EmptyState);
            }
        }
    }
}

/// Translates raw stream frames into client events and cache updates.
/// Snapshot bytes arrive as their own event type so consumers replay
/// them without treating them as live activity.
async fn frame_pump(
    inner: Arc<Inner>,
    mut frames: mpsc::UnboundedReceiver<(SessionKey, ServerFrame)>,
) {
    while let Some((key, frame)) = frames.recv().await {
        match frame {
            ServerFrame::Snapshot { data } => {
                let _ = inner.events.send(ClientEvent::Snapshot { key, data });
            }
            ServerFrame::Output { data } => {
                let _ = inner.events.send(ClientEvent::Output { key, data });
            }
            ServerFrame::Meta {
                title,
                cwd,
                env,
                cols,
                rows,
            } => {
                let mut event = None;
                {
                    let mut hosts = inner.hosts.lock();
                    if let Some(entry) = hosts.iter_mut().find(|h| h.client.id == key.host_id) {
                        if let Some(session) = entry.session(&key.session_id) {
                            let mut remote = session.info.clone();
                            if title.is_some() {
                                remote.title = title;
                            }
                            if cwd.is_some() {
                                remote.cwd = cwd;
                            }
                            if let Some(env) = env {
                                remote.env = env;
                            }
                            if let Some(cols) = cols {
                                remote.cols = cols;
                            }
                            if let Some(rows) = rows {
                                remote.rows = rows;
                            }
                            if session.merge_info(&remote) {
                                event = Some(ClientEvent::SessionUpdated {
                                    key: session.key.clone(),
                                    info: session.info.clone(),
                                });
                            }
                        }
                    }
                }
                if let Some(event) = event {
                    let _ = inner.events.send(event);
                }
            }
            ServerFrame::Status { status } => {
                let _ = inner.events.send(ClientEvent::SessionStatus {
                    key: key.clone(),
                    status,
                });
                if status == SessionStatus::Ended {
                    let removed = {
                        let mut hosts = inner.hosts.lock();
                        if let Some(entry) =
                            hosts.iter_mut().find(|h| h.client.id == key.host_id)
                        {
                            if let Some(idx) = entry
                                .sessions
                                .iter()
                                .position(|s| s.key.session_id == key.session_id)
                            {
                                let mut gone = entry.sessions.remove(idx);
                                gone.close_transport();
                                entry.pending.drop_session(&key.session_id);
                                true
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    };
                    if removed {
                        let _ = inner.events.send(ClientEvent::SessionRemoved {
                            key: key.clone(),
                        });
                        refocus_after_removal(&inner);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Json;
    use chrono::Utc;
    use cove_proto::{
        CpuStats, MemoryStats, RuntimeInfo, SessionInfo, SessionUpdate, SystemSnapshot,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct StubState {
        heartbeats: AtomicUsize,
        reject: AtomicBool,
        sessions: Mutex<Vec<SessionInfo>>,
        received_updates: Mutex<Vec<Vec<SessionUpdate>>>,
        boot_id: Mutex<String>,
    }

    fn session_info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            created_at: Utc::now(),
            shell: "/bin/bash".into(),
            initial_cwd: "/".into(),
            title: Some(id.to_string()),
            cwd: Some("/".into()),
            env: Default::default(),
            cols: 80,
            rows: 24,
            last_execution: None,
        }
    }

    fn system_snapshot() -> SystemSnapshot {
        SystemSnapshot {
            hostname: "stub".into(),
            os_name: "test".into(),
            ip: "127.0.0.1".into(),
            cpu: CpuStats {
                count: 1,
                speed: "1.00 GHz".into(),
                usage_percent: 0.0,
            },
            memory: MemoryStats { used: 1, total: 2 },
            uptime: 1,
            process_uptime: 1,
        }
    }

    async fn stub_heartbeat(
        State(state): State<Arc<StubState>>,
        Json(req): Json<HeartbeatRequest>,
    ) -> Result<Json<HeartbeatResponse>, StatusCode> {
        state.heartbeats.fetch_add(1, Ordering::SeqCst);
        if state.reject.load(Ordering::SeqCst) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        state.received_updates.lock().push(req.updates.sessions);
        Ok(Json(HeartbeatResponse {
            sessions: state.sessions.lock().clone(),
            system: system_snapshot(),
            runtime: RuntimeInfo {
                boot_id: state.boot_id.lock().clone(),
            },
        }))
    }

    async fn start_stub(state: Arc<StubState>) -> std::net::SocketAddr {
        let app = axum::Router::new()
            .route("/api/heartbeat", post(stub_heartbeat))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn stub_state(sessions: Vec<SessionInfo>) -> Arc<StubState> {
        Arc::new(StubState {
            heartbeats: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            sessions: Mutex::new(sessions),
            received_updates: Mutex::new(Vec::new()),
            boot_id: Mutex::new("boot-1".into()),
        })
    }

    async fn wait_for<F>(
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
        mut pred: F,
    ) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("event before deadline")
                .expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn connect_reconcile_and_teardown() {
        let stub = stub_state(vec![session_info("s1")]);
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host("h1", &format!("http://{addr}"), None, true, Some("tok".into()))
            .unwrap();

        wait_for(&mut rx, |e| {
            matches!(
                e,
                ClientEvent::HostStateChanged {
                    state: HostState::Connected,
                    ..
                }
            )
        })
        .await;
        let added = wait_for(&mut rx, |e| matches!(e, ClientEvent::SessionAdded { .. })).await;
        match added {
            ClientEvent::SessionAdded { key, info } => {
                assert_eq!(key, SessionKey::new("h1", "s1"));
                assert_eq!(info.id, "s1");
            }
            _ => unreachable!(),
        }
        wait_for(&mut rx, |e| matches!(e, ClientEvent::SystemUpdate { .. })).await;

        // The host drops the session; the next heartbeat tears it down.
        stub.sessions.lock().clear();
        wait_for(&mut rx, |e| matches!(e, ClientEvent::SessionRemoved { .. })).await;
        wait_for(&mut rx, |e| matches!(e, ClientEvent::EmptyState)).await;
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn rejected_secondary_halts_until_manual_reconnect() {
        let stub = stub_state(Vec::new());
        stub.reject.store(true, Ordering::SeqCst);
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host("h2", &format!("http://{addr}"), None, false, Some("tok".into()))
            .unwrap();

        let event = wait_for(&mut rx, |e| matches!(e, ClientEvent::AuthRequired { .. })).await;
        match event {
            ClientEvent::AuthRequired { host_id, forced } => {
                assert_eq!(host_id, "h2");
                assert!(!forced);
            }
            _ => unreachable!(),
        }

        // Halted: no further attempts while we wait.
        let after_notice = stub.heartbeats.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stub.heartbeats.load(Ordering::SeqCst), after_notice);

        stub.reject.store(false, Ordering::SeqCst);
        engine.reconnect("h2");
        wait_for(&mut rx, |e| {
            matches!(
                e,
                ClientEvent::HostStateChanged {
                    state: HostState::Connected,
                    ..
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn duplicate_resize_is_sent_once_and_cleared_after_ack() {
        let stub = stub_state(vec![session_info("s1")]);
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host("h1", &format!("http://{addr}"), None, true, Some("tok".into()))
            .unwrap();
        wait_for(&mut rx, |e| matches!(e, ClientEvent::SessionAdded { .. })).await;

        let key = SessionKey::new("h1", "s1");
        engine.resize(&key, 120, 40);
        engine.resize(&key, 120, 40);

        // Wait until the stub has seen the resize plus one more
        // heartbeat after it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            assert!(tokio::time::Instant::now() < deadline);
            let batches = stub.received_updates.lock().clone();
            if let Some(idx) = batches
                .iter()
                .position(|b| b.iter().any(|u| u.resize.is_some()))
            {
                if batches.len() > idx + 1 {
                    let with_resize: Vec<_> = batches
                        .iter()
                        .filter(|b| b.iter().any(|u| u.resize.is_some()))
                        .collect();
                    assert_eq!(with_resize.len(), 1, "resize must be uploaded exactly once");
                    assert_eq!(
                        with_resize[0][0].resize,
                        Some(Resize {
                            cols: 120,
                            rows: 40
                        })
                    );
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn same_endpoint_replaces_host_in_place() {
        let stub = stub_state(Vec::new());
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, _rx) = CoveEngine::new(None);
        engine
            .add_host("first", &format!("http://{addr}"), None, false, None)
            .unwrap();
        engine
            .add_host("second", &format!("http://{addr}/"), None, false, None)
            .unwrap();

        assert!(engine.host_state("first").is_none());
        assert!(engine.host_state("second").is_some());
    }

    #[tokio::test]
    async fn primary_restart_triggers_reload_once() {
        let stub = stub_state(Vec::new());
        let addr = start_stub(Arc::clone(&stub)).await;
        let dir = tempfile::tempdir().unwrap();
        let store = crate::config::StateStore::open_at(dir.path().join("client.json"));
        store
            .save(&crate::config::PersistedState {
                primary_token: None,
                primary_boot_id: Some("boot-0".into()),
            })
            .unwrap();

        let (engine, mut rx) = CoveEngine::new(Some(store));
        engine
            .add_host("h1", &format!("http://{addr}"), None, true, Some("tok".into()))
            .unwrap();

        wait_for(&mut rx, |e| matches!(e, ClientEvent::ReloadRequired)).await;

        // Further boot id changes must not fire again.
        *stub.boot_id.lock() = "boot-2".into();
        let mut saw_second_reload = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if matches!(event, ClientEvent::ReloadRequired) {
                saw_second_reload = true;
            }
        }
        assert!(!saw_second_reload);
        drop(engine);
    }

    #[tokio::test]
    async fn fresh_host_walks_disconnected_connecting_connected() {
        let stub = stub_state(Vec::new());
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host("h1", &format!("http://{addr}"), None, true, Some("tok".into()))
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let event =
                wait_for(&mut rx, |e| matches!(e, ClientEvent::HostStateChanged { .. })).await;
            if let ClientEvent::HostStateChanged { state, .. } = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                HostState::Disconnected,
                HostState::Connecting,
                HostState::Connected,
            ]
        );
        drop(engine);
    }

    #[tokio::test]
    async fn alias_and_heartbeat_latency_are_tracked() {
        let stub = stub_state(Vec::new());
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host(
                "h1",
                &format!("http://{addr}"),
                Some("den".into()),
                true,
                Some("tok".into()),
            )
            .unwrap();
        assert_eq!(engine.host_alias("h1").as_deref(), Some("den"));

        let event = wait_for(&mut rx, |e| matches!(e, ClientEvent::SystemUpdate { .. })).await;
        match event {
            ClientEvent::SystemUpdate {
                host_id,
                latency_ms,
                ..
            } => {
                assert_eq!(host_id, "h1");
                assert!(latency_ms < 10_000);
            }
            _ => unreachable!(),
        }
        assert!(engine.host_latency("h1").is_some());
        drop(engine);
    }

    #[tokio::test]
    async fn dropped_transport_degrades_host_until_heartbeat_confirms() {
        // The stub serves heartbeats but has no websocket route, so every
        // transport the engine opens for s1 fails and stays closed.
        let stub = stub_state(vec![session_info("s1")]);
        let addr = start_stub(Arc::clone(&stub)).await;
        let (engine, mut rx) = CoveEngine::new(None);
        engine
            .add_host("h1", &format!("http://{addr}"), None, true, Some("tok".into()))
            .unwrap();

        wait_for(&mut rx, |e| matches!(e, ClientEvent::SessionAdded { .. })).await;
        wait_for(&mut rx, |e| {
            matches!(
                e,
                ClientEvent::HostStateChanged {
                    state: HostState::Reconnecting,
                    ..
                }
            )
        })
        .await;
        // The next successful heartbeat restores the host.
        wait_for(&mut rx, |e| {
            matches!(
                e,
                ClientEvent::HostStateChanged {
                    state: HostState::Connected,
                    ..
                }
            )
        })
        .await;
        drop(engine);
    }
}
