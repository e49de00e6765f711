//! Access Grant Connector
//!
//! Adds a buyer as a read-only collaborator on an item's private repository.
//! The remote API sits behind [`RepositoryHost`]; the check-then-invite
//! algorithm lives in [`AccessGrantConnector`] so it runs the same against
//! GitHub and against [`MockRepositoryHost`].
//!
//! ```text
//! grant(repo, invitee)
//!   ├─ collaborator already?     → AlreadyCollaborator
//!   ├─ invitation pending?       → InvitationPending
//!   ├─ repository exists?  no    → RepositoryMissing
//!   └─ add collaborator (pull)   → GrantedDirectly | InvitationSent | Rejected
//! ```

mod cache;
mod mock;

pub use cache::GrantCache;
pub use mock::MockRepositoryHost;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;
use crate::lifecycle::AccessStatus;

/// Result type for host calls
pub type GrantResult<T> = std::result::Result<T, ConnectorError>;

/// Collaborator permission level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read-only (`pull` on GitHub)
    Read,
}

/// Host answer to an add-collaborator call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddCollaborator {
    /// Invitation created; the invitee has to accept it
    Invited,
    /// Added without an invitation (organization member)
    AddedDirectly,
    /// Host declined, e.g. the invitee account does not exist
    Refused(String),
}

/// Source-control host API used for access grants
///
/// All calls are scoped to the single account or organization the service
/// credential belongs to, so repositories are named without an owner.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Whether `invitee` is an accepted collaborator
    async fn is_collaborator(&self, repository: &str, invitee: &str) -> GrantResult<bool>;

    /// Whether an invitation for `invitee` is outstanding
    async fn has_pending_invitation(&self, repository: &str, invitee: &str) -> GrantResult<bool>;

    async fn repository_exists(&self, repository: &str) -> GrantResult<bool>;

    async fn add_collaborator(
        &self,
        repository: &str,
        invitee: &str,
        permission: Permission,
    ) -> GrantResult<AddCollaborator>;

    /// Host name for logs and health output
    fn name(&self) -> &str;
}

/// Terminal answer of a grant attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOutcome {
    GrantedDirectly,
    InvitationSent,
    AlreadyCollaborator,
    InvitationPending,
    RepositoryMissing,
    Rejected,
}

impl GrantOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GrantedDirectly => "granted_directly",
            Self::InvitationSent => "invitation_sent",
            Self::AlreadyCollaborator => "already_collaborator",
            Self::InvitationPending => "invitation_pending",
            Self::RepositoryMissing => "repository_missing",
            Self::Rejected => "rejected",
        }
    }

    /// Access-grant status this outcome leaves on the entitlement
    pub const fn access_status(self) -> AccessStatus {
        match self {
            Self::GrantedDirectly | Self::AlreadyCollaborator => AccessStatus::Accepted,
            Self::InvitationSent | Self::InvitationPending => AccessStatus::Sent,
            Self::RepositoryMissing | Self::Rejected => AccessStatus::Failed,
        }
    }

    pub const fn is_success(self) -> bool {
        !matches!(self, Self::RepositoryMissing | Self::Rejected)
    }

    /// What a repeated grant for the same pair would observe
    pub const fn on_repeat(self) -> Self {
        match self {
            Self::GrantedDirectly | Self::AlreadyCollaborator => Self::AlreadyCollaborator,
            Self::InvitationSent | Self::InvitationPending => Self::InvitationPending,
            other => other,
        }
    }
}

/// A single grant attempt and its answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub repository: String,
    pub invitee: String,
    pub outcome: GrantOutcome,
}

/// Connector configuration
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Upper bound for each host call
    pub call_timeout: Duration,

    /// Lifetime of cached successful outcomes; zero disables the cache
    pub cache_ttl: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

impl ConnectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            call_timeout: secs("GRANT_TIMEOUT_SECS").unwrap_or(defaults.call_timeout),
            cache_ttl: secs("GRANT_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl),
        }
    }
}

/// Source-control login: ASCII letters, digits and hyphens, at most 39
/// characters, not starting with a hyphen
pub fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login.len() <= 39
        && !login.starts_with('-')
        && login.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Repository name without owner: letters, digits, `.`, `_` and `-`
pub fn is_valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Runs the grant algorithm against a repository host
pub struct AccessGrantConnector {
    host: Arc<dyn RepositoryHost>,
    config: ConnectorConfig,
    cache: GrantCache,
}

impl AccessGrantConnector {
    pub fn new(host: Arc<dyn RepositoryHost>, config: ConnectorConfig) -> Self {
        let cache = GrantCache::new(config.cache_ttl);
        Self { host, config, cache }
    }

    pub fn host_name(&self) -> &str {
        self.host.name()
    }

    /// Provision read access for `invitee` on `repository`
    pub async fn grant(&self, repository: &str, invitee: &str) -> GrantResult<AccessGrant> {
        let repository = repository.trim();
        let invitee = invitee.trim();
        if repository.is_empty() || invitee.is_empty() {
            return Err(ConnectorError::InvalidRequest(
                "repository and invitee must be non-empty".into(),
            ));
        }
        if !is_valid_repository(repository) {
            return Err(ConnectorError::InvalidRequest(format!(
                "invalid repository name: {repository}"
            )));
        }
        if !is_valid_login(invitee) {
            return Err(ConnectorError::InvalidRequest(format!(
                "invalid username: {invitee}"
            )));
        }

        let done = |outcome| AccessGrant {
            repository: repository.to_string(),
            invitee: invitee.to_string(),
            outcome,
        };

        if let Some(outcome) = self.cache.get(repository, invitee) {
            tracing::debug!(repository, invitee, outcome = outcome.as_str(), "Grant cache hit");
            return Ok(done(outcome));
        }

        let outcome = self.resolve(repository, invitee).await?;
        self.cache.put(repository, invitee, outcome);

        tracing::info!(
            host = self.host.name(),
            repository,
            invitee,
            outcome = outcome.as_str(),
            "Access grant resolved"
        );

        Ok(done(outcome))
    }

    async fn resolve(&self, repository: &str, invitee: &str) -> GrantResult<GrantOutcome> {
        if self.call(self.host.is_collaborator(repository, invitee)).await? {
            return Ok(GrantOutcome::AlreadyCollaborator);
        }

        if self
            .call(self.host.has_pending_invitation(repository, invitee))
            .await?
        {
            return Ok(GrantOutcome::InvitationPending);
        }

        if !self.call(self.host.repository_exists(repository)).await? {
            return Ok(GrantOutcome::RepositoryMissing);
        }

        let added = self
            .call(self.host.add_collaborator(repository, invitee, Permission::Read))
            .await?;

        Ok(match added {
            AddCollaborator::Invited => GrantOutcome::InvitationSent,
            AddCollaborator::AddedDirectly => GrantOutcome::GrantedDirectly,
            AddCollaborator::Refused(reason) => {
                tracing::warn!(repository, invitee, %reason, "Host refused collaborator");
                GrantOutcome::Rejected
            }
        })
    }

    /// Whether `invitee` has accepted access, asked fresh from the host
    pub async fn has_accepted(&self, repository: &str, invitee: &str) -> GrantResult<bool> {
        if !is_valid_repository(repository) || !is_valid_login(invitee) {
            return Err(ConnectorError::InvalidRequest(
                "invalid repository or username".into(),
            ));
        }
        self.call(self.host.is_collaborator(repository, invitee)).await
    }

    async fn call<T, F>(&self, fut: F) -> GrantResult<T>
    where
        F: Future<Output = GrantResult<T>>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| ConnectorError::Timeout(self.config.call_timeout))?
    }
}
