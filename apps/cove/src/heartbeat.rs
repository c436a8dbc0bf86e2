use std::time::Duration;

use tokio::time::Instant;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const RETRY_COOLDOWN: Duration = Duration::from_secs(5);

/// When the next heartbeat for one host may run. Failures push the next
/// attempt out by a fixed cooldown so an unreachable host sees a bounded
/// request rate; successes return to the normal cadence.
#[derive(Debug, Default)]
pub struct Cadence {
    next_allowed: Option<Instant>,
}

impl Cadence {
    pub fn should_attempt(&self, now: Instant) -> bool {
        match self.next_allowed {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.next_allowed = Some(now + RETRY_COOLDOWN);
    }

    pub fn record_success(&mut self) {
        self.next_allowed = None;
    }

    /// Manual reconnect: forget the cooldown so the next tick fires.
    pub fn reset(&mut self) {
        self.next_allowed = None;
    }
}

/// Restart detector for the primary host.
///
/// Fires when the observed boot id differs from the persisted one,
/// whether the restart happened mid-run (id changes between heartbeats)
/// or before this client started. Guarded to fire at most once per
/// client lifetime; callers persist the new id after reacting so the
/// next run does not fire again.
#[derive(Debug)]
pub struct BootIdLatch {
    persisted: Option<String>,
    last_seen: Option<String>,
    fired: bool,
}

impl BootIdLatch {
    pub fn new(persisted: Option<String>) -> Self {
        Self {
            persisted,
            last_seen: None,
            fired: false,
        }
    }

    /// Record one observed boot id; true means "the primary restarted,
    /// reload now".
    pub fn observe(&mut self, boot_id: &str) -> bool {
        let changed_since_last = self
            .last_seen
            .as_deref()
            .map(|seen| seen != boot_id)
            .unwrap_or(true);
        self.last_seen = Some(boot_id.to_string());

        if self.fired || !changed_since_last {
            return false;
        }
        match self.persisted.as_deref() {
            None => {
                // Nothing persisted yet: adopt this id without reloading.
                self.persisted = Some(boot_id.to_string());
                false
            }
            Some(known) if known == boot_id => false,
            Some(_) => {
                self.fired = true;
                self.persisted = Some(boot_id.to_string());
                true
            }
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.persisted.as_deref()
    }
}
