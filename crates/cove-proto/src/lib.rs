//! Wire contract shared by the cove host daemon and the client engine.
//!
//! All JSON field names are camelCase so that payloads stay compatible
//! across host and client versions. Frames travelling over a session
//! websocket carry a lowercase `type` tag.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most recent shell command captured from a session's PTY stream,
/// listed alongside the session so consumers (assistant context, the
/// session list) see what last ran without attaching a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecution {
    pub input: String,
    pub output: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Advertised state of one session, as listed in a heartbeat response
/// and in the session-creation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub shell: String,
    pub initial_cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<CommandExecution>,
}

/// Desired terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// A single pending editor save carried by a heartbeat upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

/// Per-session slice of a heartbeat upload. Every field is optional;
/// the host applies each independently and idempotently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<Resize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_writes: Option<Vec<FileWrite>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.resize.is_none()
            && self.editor_state.is_none()
            && self.file_writes.as_ref().map_or(true, |w| w.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatUpdates {
    #[serde(default)]
    pub sessions: Vec<SessionUpdate>,
}

/// Body of `POST /api/heartbeat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub updates: HeartbeatUpdates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub count: usize,
    pub speed: String,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used: u64,
    pub total: u64,
}

/// Host machine snapshot bundled with every heartbeat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub hostname: String,
    pub os_name: String,
    pub ip: String,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub uptime: u64,
    pub process_uptime: u64,
}

/// Identity of one run of the host process. A changed `bootId` between
/// two successful primary heartbeats means the host restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub boot_id: String,
}

/// Body of a successful heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub sessions: Vec<SessionInfo>,
    pub system: SystemSnapshot,
    pub runtime: RuntimeInfo,
}

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// One known secondary host, as persisted by the primary's cluster
/// registry. `host` is the display alias (wire name kept for
/// compatibility).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHost {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of `GET`/`PUT /api/cluster`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPayload {
    #[serde(default)]
    pub servers: Vec<ClusterHost>,
}

/// Session lifecycle notice delivered on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The shell process exited.
    Ended,
    /// A newer transport superseded this one.
    Detached,
}

/// Host-to-client frame on a session websocket. The first frame after
/// attach is always `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Snapshot {
        data: String,
    },
    Output {
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Meta {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Status {
        status: SessionStatus,
    },
}

/// Client-to-host frame on a session websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}
