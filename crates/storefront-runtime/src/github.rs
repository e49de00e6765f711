//! GitHub Repository Host
//!
//! Implementation of `RepositoryHost` over the GitHub REST API. Every call
//! is scoped to the owner configured with the service token.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use storefront_core::{
    AddCollaborator, ConnectorError, FulfillmentError, Permission, RepositoryHost,
    grant::GrantResult,
};

const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;
const MAX_INVITATION_PAGES: u32 = 10;

/// GitHub host configuration
#[derive(Clone)]
pub struct GitHubConfig {
    /// API base URL
    pub api_url: String,

    /// Account or organization that owns the artifact repositories
    pub owner: String,

    /// Service token with collaborator admin rights
    pub token: String,

    pub user_agent: String,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_url", &self.api_url)
            .field("owner", &self.owner)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl GitHubConfig {
    pub fn new(owner: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.github.com".into(),
            owner: owner.into(),
            token: token.into(),
            user_agent: concat!("storefront/", env!("CARGO_PKG_VERSION")).into(),
        }
    }

    pub fn from_env() -> Result<Self, FulfillmentError> {
        let token = std::env::var("GITHUB_TOKEN")
            .map_err(|_| FulfillmentError::Config("GITHUB_TOKEN not set".into()))?;
        let owner = std::env::var("GITHUB_OWNER")
            .map_err(|_| FulfillmentError::Config("GITHUB_OWNER not set".into()))?;

        let mut config = Self::new(owner, token);
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            config.api_url = url;
        }
        Ok(config)
    }
}

#[derive(Deserialize)]
struct Invitation {
    invitee: Option<Account>,
}

#[derive(Deserialize)]
struct Account {
    login: String,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

/// GitHub repository host
pub struct GitHubHost {
    client: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubHost {
    pub fn new(config: GitHubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Result<Self, FulfillmentError> {
        Ok(Self::new(GitHubConfig::from_env()?))
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    /// `{api}/repos/{owner}/{repository}` plus extra path segments, each
    /// one percent-encoded
    fn repo_url(&self, repository: &str, segments: &[&str]) -> String {
        let mut url = format!(
            "{}/repos/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            urlencoding::encode(&self.config.owner),
            urlencoding::encode(repository),
        );
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, &self.config.user_agent)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, builder: RequestBuilder) -> GrantResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))
    }

    /// Map a response we have no specific handling for
    async fn unexpected(response: Response) -> ConnectorError {
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return ConnectorError::Unauthorized(status.as_u16());
        }
        ConnectorError::UnexpectedStatus {
            status: status.as_u16(),
            body: Self::message(response).await,
        }
    }

    async fn message(response: Response) -> String {
        let text = response.text().await.unwrap_or_default();
        serde_json::from_str::<ApiMessage>(&text)
            .map(|m| m.message)
            .unwrap_or(text)
    }

    /// GET that answers yes with `ok` and no with 404
    async fn probe(&self, url: &str, ok: StatusCode) -> GrantResult<bool> {
        let response = self.send(self.request(Method::GET, url)).await?;
        match response.status() {
            s if s == ok => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

const fn permission_name(permission: Permission) -> &'static str {
    match permission {
        Permission::Read => "pull",
    }
}

#[async_trait]
impl RepositoryHost for GitHubHost {
    async fn is_collaborator(&self, repository: &str, invitee: &str) -> GrantResult<bool> {
        let url = self.repo_url(repository, &["collaborators", invitee]);
        self.probe(&url, StatusCode::NO_CONTENT).await
    }

    async fn has_pending_invitation(&self, repository: &str, invitee: &str) -> GrantResult<bool> {
        let url = self.repo_url(repository, &["invitations"]);

        for page in 1..=MAX_INVITATION_PAGES {
            let builder = self
                .request(Method::GET, &url)
                .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())]);
            let response = self.send(builder).await?;

            match response.status() {
                StatusCode::OK => {}
                // Repository existence is checked separately
                StatusCode::NOT_FOUND => return Ok(false),
                _ => return Err(Self::unexpected(response).await),
            }

            let invitations: Vec<Invitation> = response
                .json()
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))?;

            let found = invitations.iter().any(|i| {
                i.invitee
                    .as_ref()
                    .is_some_and(|a| a.login.eq_ignore_ascii_case(invitee))
            });
            if found {
                return Ok(true);
            }
            if invitations.len() < PAGE_SIZE {
                break;
            }
        }

        Ok(false)
    }

    async fn repository_exists(&self, repository: &str) -> GrantResult<bool> {
        self.probe(&self.repo_url(repository, &[]), StatusCode::OK).await
    }

    async fn add_collaborator(
        &self,
        repository: &str,
        invitee: &str,
        permission: Permission,
    ) -> GrantResult<AddCollaborator> {
        let url = self.repo_url(repository, &["collaborators", invitee]);
        let body = serde_json::json!({ "permission": permission_name(permission) });
        let response = self.send(self.request(Method::PUT, &url).json(&body)).await?;

        match response.status() {
            StatusCode::CREATED => Ok(AddCollaborator::Invited),
            StatusCode::NO_CONTENT => Ok(AddCollaborator::AddedDirectly),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                let reason = Self::message(response).await;
                tracing::warn!(repository, invitee, %reason, "GitHub refused collaborator");
                Ok(AddCollaborator::Refused(reason))
            }
            _ => Err(Self::unexpected(response).await),
        }
    }

    fn name(&self) -> &str {
        "GitHub"
    }
}
