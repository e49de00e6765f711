//! Mock Repository Host
//!
//! In-memory stand-in for the source-control host. Used by tests and by the
//! server when no host credentials are configured.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{AddCollaborator, GrantResult, Permission, RepositoryHost};
use crate::error::ConnectorError;

type Pair = (String, String);

#[derive(Default)]
struct HostState {
    repositories: HashSet<String>,
    collaborators: HashSet<Pair>,
    invitations: HashSet<Pair>,
    org_members: HashSet<String>,
    refused: HashSet<String>,
    delay: Option<Duration>,
}

/// Mock host with switchable failure modes
#[derive(Default)]
pub struct MockRepositoryHost {
    state: Mutex<HostState>,
    unreachable: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

fn pair(repository: &str, invitee: &str) -> Pair {
    (repository.to_string(), invitee.to_lowercase())
}

impl MockRepositoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing repository
    #[must_use]
    pub fn with_repository(self, repository: &str) -> Self {
        self.add_repository(repository);
        self
    }

    pub fn add_repository(&self, repository: &str) {
        self.with_state(|s| {
            s.repositories.insert(repository.to_string());
        });
    }

    /// Organization members are added without an invitation
    pub fn add_org_member(&self, username: &str) {
        self.with_state(|s| {
            s.org_members.insert(username.to_lowercase());
        });
    }

    /// Make add-collaborator calls for this user come back refused
    pub fn refuse_invitee(&self, username: &str) {
        self.with_state(|s| {
            s.refused.insert(username.to_lowercase());
        });
    }

    /// Fail every call with a transport error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every call (for timeout tests)
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    /// Simulate the invitee clicking "Accept" on the host
    pub fn accept_invitation(&self, repository: &str, invitee: &str) -> bool {
        self.with_state(|s| {
            let key = pair(repository, invitee);
            if s.invitations.remove(&key) {
                s.collaborators.insert(key);
                true
            } else {
                false
            }
        })
    }

    pub fn pending_invitations(&self, repository: &str) -> usize {
        self.with_state(|s| s.invitations.iter().filter(|(r, _)| r == repository).count())
    }

    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    async fn enter(&self, counter: &AtomicUsize) -> GrantResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.with_state(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectorError::Transport("mock host unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryHost for MockRepositoryHost {
    async fn is_collaborator(&self, repository: &str, invitee: &str) -> GrantResult<bool> {
        self.enter(&self.reads).await?;
        Ok(self.with_state(|s| s.collaborators.contains(&pair(repository, invitee))))
    }

    async fn has_pending_invitation(&self, repository: &str, invitee: &str) -> GrantResult<bool> {
        self.enter(&self.reads).await?;
        Ok(self.with_state(|s| s.invitations.contains(&pair(repository, invitee))))
    }

    async fn repository_exists(&self, repository: &str) -> GrantResult<bool> {
        self.enter(&self.reads).await?;
        Ok(self.with_state(|s| s.repositories.contains(repository)))
    }

    async fn add_collaborator(
        &self,
        repository: &str,
        invitee: &str,
        _permission: Permission,
    ) -> GrantResult<AddCollaborator> {
        self.enter(&self.writes).await?;

        Ok(self.with_state(|s| {
            let login = invitee.to_lowercase();
            if !s.repositories.contains(repository) {
                return AddCollaborator::Refused("repository not found".into());
            }
            if s.refused.contains(&login) {
                return AddCollaborator::Refused(format!("user {invitee} not found"));
            }

            let key = pair(repository, invitee);
            if s.collaborators.contains(&key) || s.org_members.contains(&login) {
                s.collaborators.insert(key);
                AddCollaborator::AddedDirectly
            } else {
                s.invitations.insert(key);
                AddCollaborator::Invited
            }
        }))
    }

    fn name(&self) -> &str {
        "MockHost"
    }
}
