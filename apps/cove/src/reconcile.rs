use std::collections::HashSet;

use chrono::{DateTime, Utc};
use cove_proto::SessionInfo;

use crate::SessionKey;

/// Outcome of diffing one host's authoritative session list against the
/// local cache. The remote set wins: locals missing from it are torn
/// down, remotes missing locally are instantiated, the intersection is
/// merged in place.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub added: Vec<SessionInfo>,
    pub removed: Vec<String>,
    pub kept: Vec<SessionInfo>,
}

pub fn plan(remote: &[SessionInfo], local_ids: &HashSet<String>) -> ReconcilePlan {
    let remote_ids: HashSet<&str> = remote.iter().map(|s| s.id.as_str()).collect();
    let mut out = ReconcilePlan::default();
    for info in remote {
        if local_ids.contains(&info.id) {
            out.kept.push(info.clone());
        } else {
            out.added.push(info.clone());
        }
    }
    out.removed = local_ids
        .iter()
        .filter(|id| !remote_ids.contains(id.as_str()))
        .cloned()
        .collect();
    out.removed.sort();
    out
}

/// Pick where focus lands after the focused session disappears: the
/// oldest surviving session across every host, or nothing.
pub fn focus_fallback<'a, I>(sessions: I) -> Option<SessionKey>
where
    I: Iterator<Item = (&'a SessionKey, &'a DateTime<Utc>)>,
{
    sessions
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            created_at: Utc::now(),
            shell: "/bin/bash".into(),
            initial_cwd: "/".into(),
            title: None,
            cwd: None,
            env: Default::default(),
            cols: 80,
            rows: 24,
            last_execution: None,
        }
    }

    #[test]
    fn plan_splits_added_removed_kept() {
        let remote = vec![info("a"), info("b")];
        let local: HashSet<String> = ["b".to_string(), "c".to_string()].into();
        let plan = plan(&remote, &local);
        assert_eq!(
            plan.added.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["a"]
        );
        assert_eq!(plan.removed, vec!["c"]);
        assert_eq!(
            plan.kept.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[test]
    fn empty_remote_tears_everything_down() {
        let local: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let plan = plan(&[], &local);
        assert!(plan.added.is_empty());
        assert!(plan.kept.is_empty());
        assert_eq!(plan.removed, vec!["a", "b"]);
    }

    #[test]
    fn focus_falls_back_to_oldest_across_hosts() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let k1 = SessionKey::new("host-b", "s1");
        let k2 = SessionKey::new("host-a", "s2");
        let sessions = vec![(&k2, &t2), (&k1, &t1)];
        assert_eq!(focus_fallback(sessions.into_iter()), Some(k1));
    }

    #[test]
    fn focus_fallback_with_no_sessions_is_none() {
        let sessions: Vec<(&SessionKey, &DateTime<Utc>)> = Vec::new();
        assert_eq!(focus_fallback(sessions.into_iter()), None);
    }
}
