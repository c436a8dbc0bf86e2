use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// State that outlives one run of the client. Only the primary host's
/// token is escrowed here: secondary hosts re-authenticate each start
/// unless the user saved them to the cluster roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_boot_id: Option<String>,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn open() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "cove")
            .context("could not resolve a config directory")?;
        let dir = dirs.config_dir().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            path: dir.join("client.json"),
        })
    }

    pub fn open_at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> PersistedState {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
