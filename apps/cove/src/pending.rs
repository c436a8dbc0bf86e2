use std::collections::HashMap;

use cove_proto::{FileWrite, Resize, SessionUpdate};
use serde_json::Value;

/// Unsent state for one session.
#[derive(Debug, Clone, Default, PartialEq)]
struct PendingSession {
    resize: Option<Resize>,
    editor_state: Option<Value>,
    file_writes: Vec<FileWrite>,
}

impl PendingSession {
    fn is_empty(&self) -> bool {
        self.resize.is_none() && self.editor_state.is_none() && self.file_writes.is_empty()
    }
}

/// What a heartbeat actually carried, remembered so the clear step can
/// compare against it.
#[derive(Debug, Clone)]
pub struct SentBatch {
    sessions: HashMap<String, PendingSession>,
}

impl SentBatch {
    pub fn updates(&self) -> Vec<SessionUpdate> {
        let mut updates: Vec<SessionUpdate> = self
            .sessions
            .iter()
            .map(|(id, pending)| SessionUpdate {
                id: id.clone(),
                resize: pending.resize,
                editor_state: pending.editor_state.clone(),
                file_writes: if pending.file_writes.is_empty() {
                    None
                } else {
                    Some(pending.file_writes.clone())
                },
            })
            .collect();
        updates.sort_by(|a, b| a.id.cmp(&b.id));
        updates
    }
}

/// Per-host accumulator of changes awaiting upload.
///
/// A field is cleared after a successful heartbeat only when its current
/// value still equals the value that was sent. A resize or write that
/// landed while the request was in flight survives for the next tick
/// instead of being silently dropped.
#[derive(Debug, Default)]
pub struct PendingChanges {
    sessions: HashMap<String, PendingSession>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn queue_resize(&mut self, session_id: &str, resize: Resize) {
        self.sessions.entry(session_id.to_string()).or_default().resize = Some(resize);
    }

    pub fn queue_editor_state(&mut self, session_id: &str, state: Value) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .editor_state = Some(state);
    }

    /// Queue a file write. A later write to the same path replaces the
    /// earlier one; only the latest content matters.
    pub fn queue_file_write(&mut self, session_id: &str, write: FileWrite) {
        let pending = self.sessions.entry(session_id.to_string()).or_default();
        pending.file_writes.retain(|w| w.path != write.path);
        pending.file_writes.push(write);
    }

    /// Forget everything queued for a session that no longer exists.
    pub fn drop_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Snapshot the current pending state for one heartbeat.
    pub fn snapshot(&self) -> SentBatch {
        SentBatch {
            sessions: self.sessions.clone(),
        }
    }

    /// After a successful heartbeat, clear exactly what was sent and is
    /// still current. Idempotent: a second clear with the same batch
    /// finds nothing left to remove.
    pub fn clear_sent(&mut self, sent: &SentBatch) {
        for (id, sent_pending) in &sent.sessions {
            let Some(current) = self.sessions.get_mut(id) else {
                continue;
            };
            if current.resize.is_some() && current.resize == sent_pending.resize {
                current.resize = None;
            }
            if current.editor_state.is_some()
                && current.editor_state == sent_pending.editor_state
            {
                current.editor_state = None;
            }
            current
                .file_writes
                .retain(|w| !sent_pending.file_writes.contains(w));
            if current.is_empty() {
                self.sessions.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &str, content: &str) -> FileWrite {
        FileWrite {
            path: path.into(),
            content: content.into(),
        }
    }

    #[test]
    fn snapshot_carries_only_nonempty_fields() {
        let mut pending = PendingChanges::new();
        pending.queue_resize("s1", Resize { cols: 100, rows: 30 });
        let updates = pending.snapshot().updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "s1");
        assert!(updates[0].resize.is_some());
        assert!(updates[0].editor_state.is_none());
        assert!(updates[0].file_writes.is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut pending = PendingChanges::new();
        pending.queue_resize("s1", Resize { cols: 100, rows: 30 });
        let sent = pending.snapshot();

        pending.clear_sent(&sent);
        assert!(pending.is_empty());
        pending.clear_sent(&sent);
        assert!(pending.is_empty());
    }

    #[test]
    fn field_changed_in_flight_survives_clear() {
        let mut pending = PendingChanges::new();
        pending.queue_resize("s1", Resize { cols: 100, rows: 30 });
        let sent = pending.snapshot();

        // User resizes again while the heartbeat is in flight.
        pending.queue_resize("s1", Resize { cols: 80, rows: 24 });
        pending.clear_sent(&sent);

        let updates = pending.snapshot().updates();
        assert_eq!(updates[0].resize, Some(Resize { cols: 80, rows: 24 }));
    }

    #[test]
    fn file_write_updated_in_flight_survives_clear() {
        let mut pending = PendingChanges::new();
        pending.queue_file_write("s1", write("a.txt", "v1"));
        pending.queue_file_write("s1", write("b.txt", "x"));
        let sent = pending.snapshot();

        pending.queue_file_write("s1", write("a.txt", "v2"));
        pending.clear_sent(&sent);

        let updates = pending.snapshot().updates();
        let writes = updates[0].file_writes.as_ref().unwrap();
        assert_eq!(writes, &vec![write("a.txt", "v2")]);
    }

    #[test]
    fn untouched_sessions_are_not_cleared() {
        let mut pending = PendingChanges::new();
        pending.queue_resize("s1", Resize { cols: 100, rows: 30 });
        let sent = pending.snapshot();
        pending.queue_editor_state("s2", serde_json::json!({"cursor": 5}));

        pending.clear_sent(&sent);
        let updates = pending.snapshot().updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "s2");
    }

    #[test]
    fn latest_write_per_path_wins_before_send() {
        let mut pending = PendingChanges::new();
        pending.queue_file_write("s1", write("a.txt", "v1"));
        pending.queue_file_write("s1", write("a.txt", "v2"));
        let updates = pending.snapshot().updates();
        assert_eq!(
            updates[0].file_writes.as_ref().unwrap(),
            &vec![write("a.txt", "v2")]
        );
    }

    #[test]
    fn drop_session_discards_its_queue() {
        let mut pending = PendingChanges::new();
        pending.queue_resize("gone", Resize { cols: 1, rows: 1 });
        pending.drop_session("gone");
        assert!(pending.is_empty());
    }
}
