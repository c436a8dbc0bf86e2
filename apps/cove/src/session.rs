use cove_proto::SessionInfo;

use crate::transport::SessionTransport;
use crate::SessionKey;

/// Client-side view of one remote session: the last known metadata plus
/// the streaming transport, when one is open.
pub struct CachedSession {
    pub key: SessionKey,
    pub info: SessionInfo,
    pub transport: Option<SessionTransport>,
}

impl CachedSession {
    pub fn new(key: SessionKey, info: SessionInfo) -> Self {
        Self {
            key,
            info,
            transport: None,
        }
    }

    /// Merge fresh metadata field by field. Each field is overwritten
    /// only when the remote value actually differs, and the return
    /// value says whether anything changed, so a steady-state heartbeat
    /// causes no update events and no redraw flicker.
    pub fn merge_info(&mut self, remote: &SessionInfo) -> bool {
        let mut changed = false;
        if self.info.title != remote.title {
            self.info.title = remote.title.clone();
            changed = true;
        }
        if self.info.cwd != remote.cwd {
            self.info.cwd = remote.cwd.clone();
            changed = true;
        }
        if self.info.env != remote.env {
            self.info.env = remote.env.clone();
            changed = true;
        }
        if (self.info.cols, self.info.rows) != (remote.cols, remote.rows) {
            self.info.cols = remote.cols;
            self.info.rows = remote.rows;
            changed = true;
        }
        if self.info.last_execution != remote.last_execution {
            self.info.last_execution = remote.last_execution.clone();
            changed = true;
        }
        changed
    }

    pub fn transport_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    pub fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}
