//! Short-lived cache of successful grant outcomes.
//!
//! The host stays authoritative. The cache only absorbs repeated grants for
//! the same (repository, invitee) during a burst of webhook redeliveries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::GrantOutcome;

type Key = (String, String);

pub struct GrantCache {
    ttl: Duration,
    entries: Mutex<HashMap<Key, (GrantOutcome, Instant)>>,
}

impl GrantCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(repository: &str, invitee: &str) -> Key {
        (repository.to_string(), invitee.to_lowercase())
    }

    /// Outcome a repeated grant would observe, if still fresh
    pub fn get(&self, repository: &str, invitee: &str) -> Option<GrantOutcome> {
        if self.ttl.is_zero() {
            return None;
        }

        let entries = self.entries.lock().ok()?;
        let (outcome, at) = entries.get(&Self::key(repository, invitee))?;
        (at.elapsed() < self.ttl).then(|| outcome.on_repeat())
    }

    /// Remember a successful outcome; failures are never cached
    pub fn put(&self, repository: &str, invitee: &str, outcome: GrantOutcome) {
        if self.ttl.is_zero() || !outcome.is_success() {
            return;
        }

        if let Ok(mut entries) = self.entries.lock() {
            let ttl = self.ttl;
            entries.retain(|_, (_, at)| at.elapsed() < ttl);
            entries.insert(Self::key(repository, invitee), (outcome, Instant::now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_cache() {
        let cache = GrantCache::new(Duration::ZERO);
        cache.put("r-a", "octocat", GrantOutcome::InvitationSent);
        assert_eq!(cache.get("r-a", "octocat"), None);
    }

    #[test]
    fn test_failures_not_cached() {
        let cache = GrantCache::new(Duration::from_secs(60));
        cache.put("r-a", "octocat", GrantOutcome::RepositoryMissing);
        assert_eq!(cache.get("r-a", "octocat"), None);
    }

    #[test]
    fn test_repeat_outcomes() {
        let cache = GrantCache::new(Duration::from_secs(60));
        cache.put("r-a", "octocat", GrantOutcome::GrantedDirectly);
        cache.put("r-b", "octocat", GrantOutcome::InvitationSent);

        assert_eq!(
            cache.get("r-a", "OCTOCAT"),
            Some(GrantOutcome::AlreadyCollaborator)
        );
        assert_eq!(
            cache.get("r-b", "octocat"),
            Some(GrantOutcome::InvitationPending)
        );
    }

    #[test]
    fn test_entries_expire() {
        let cache = GrantCache::new(Duration::from_millis(5));
        cache.put("r-a", "octocat", GrantOutcome::InvitationSent);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("r-a", "octocat"), None);
    }
}
