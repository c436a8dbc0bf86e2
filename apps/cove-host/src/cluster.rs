use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use cove_proto::ClusterPayload;
use directories::ProjectDirs;
use tracing::warn;

/// Durable cluster roster, stored as JSON next to the host's other
/// state. The primary serves GET/PUT so any client can pick the roster
/// up again after reinstalling or switching machines.
pub struct ClusterStore {
    path: PathBuf,
    payload: Mutex<ClusterPayload>,
}

impl ClusterStore {
    pub fn open() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "cove")
            .context("could not resolve a config directory")?;
        let dir = dirs.config_dir().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        Self::open_at(dir.join("cluster.json"))
    }

    pub fn open_at(path: PathBuf) -> Result<Self> {
        let payload = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "cluster file unreadable, starting empty");
                ClusterPayload::default()
            }),
            Err(_) => ClusterPayload::default(),
        };
        Ok(Self {
            path,
            payload: Mutex::new(payload),
        })
    }

    pub fn get(&self) -> ClusterPayload {
        self.payload.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the roster wholesale and persist it.
    pub fn put(&self, payload: ClusterPayload) -> Result<()> {
        let raw = serde_json::to_string_pretty(&payload)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        *self.payload.lock().unwrap_or_else(|e| e.into_inner()) = payload;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_proto::ClusterHost;

    #[test]
    fn roster_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");

        let store = ClusterStore::open_at(path.clone()).unwrap();
        assert!(store.get().servers.is_empty());

        store
            .put(ClusterPayload {
                servers: vec![ClusterHost {
                    id: "h1".into(),
                    base_url: "http://10.0.0.2:9846".into(),
                    host: "worker".into(),
                    token: Some("abc".into()),
                }],
            })
            .unwrap();

        let reopened = ClusterStore::open_at(path).unwrap();
        assert_eq!(reopened.get().servers.len(), 1);
        assert_eq!(reopened.get().servers[0].id, "h1");
    }

    #[test]
    fn corrupt_file_starts_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ClusterStore::open_at(path).unwrap();
        assert!(store.get().servers.is_empty());
    }
}
