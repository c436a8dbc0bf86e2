use std::path::PathBuf;
use std::sync::Arc;

use cove_proto::SessionInfo;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::pty::PtyError;
use crate::session::{Session, SpawnOptions};

/// All live sessions on this host. Lookups go straight to the map;
/// create and remove are serialized so a dispose racing a create cannot
/// leave a half-registered session behind.
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    lifecycle: Mutex<()>,
    shell: String,
    default_cwd: PathBuf,
    history_limit: usize,
    exited_tx: mpsc::UnboundedSender<String>,
}

impl SessionRegistry {
    pub fn new(shell: String, default_cwd: PathBuf, history_limit: usize) -> Arc<Self> {
        let (exited_tx, mut exited_rx) = mpsc::unbounded_channel::<String>();
        let sessions: Arc<DashMap<String, Arc<Session>>> = Arc::new(DashMap::new());

        let reaper = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Some(id) = exited_rx.recv().await {
                if reaper.remove(&id).is_some() {
                    info!(session = %id, "session reaped after exit");
                }
            }
        });

        Arc::new(Self {
            sessions,
            lifecycle: Mutex::new(()),
            shell,
            default_cwd,
            history_limit,
            exited_tx,
        })
    }

    pub async fn create(&self, cwd: Option<PathBuf>) -> Result<Arc<Session>, PtyError> {
        let _guard = self.lifecycle.lock().await;
        let session = Session::spawn(
            SpawnOptions {
                shell: self.shell.clone(),
                cwd: cwd.unwrap_or_else(|| self.default_cwd.clone()),
                history_limit: self.history_limit,
            },
            self.exited_tx.clone(),
        )?;
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Kill and remove a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.kill();
                info!(session = %id, "session disposed");
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Make sure at least one session exists, spawning one if needed.
    pub async fn ensure_one(&self) -> Result<(), PtyError> {
        if self.is_empty() {
            self.create(None).await?;
        }
        Ok(())
    }

    pub async fn dispose_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<SessionRegistry> {
        SessionRegistry::new("/bin/sh".into(), std::env::temp_dir(), 64 * 1024)
    }

    #[tokio::test]
    async fn create_list_remove_roundtrip() {
        let registry = test_registry();
        let session = registry.create(None).await.unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get(&session.id).is_some());

        assert!(registry.remove(&session.id).await);
        assert!(registry.list().is_empty());
        assert!(!registry.remove(&session.id).await, "second remove is a no-op");
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation_time() {
        let registry = test_registry();
        let first = registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = registry.create(None).await.unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        registry.dispose_all().await;
    }

    #[tokio::test]
    async fn ensure_one_spawns_only_when_empty() {
        let registry = test_registry();
        registry.ensure_one().await.unwrap();
        assert_eq!(registry.list().len(), 1);
        registry.ensure_one().await.unwrap();
        assert_eq!(registry.list().len(), 1);
        registry.dispose_all().await;
    }

    #[tokio::test]
    async fn exited_shell_is_reaped() {
        let registry = test_registry();
        let session = registry.create(None).await.unwrap();
        session.write_input(b"exit\n").unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while registry.get(&session.id).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "reap timed out");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
