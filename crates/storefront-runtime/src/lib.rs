//! # storefront-runtime
//!
//! Source-control host implementations of
//! [`RepositoryHost`](storefront_core::RepositoryHost).
//!
//! ## Supported Hosts
//!
//! - **GitHub** (default) - REST API v3 with a service token
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storefront_runtime::GitHubHost;
//!
//! let host = GitHubHost::from_env()?;
//! let exists = host.repository_exists("skill-pack").await?;
//! ```

#[cfg(feature = "github")]
mod github;

#[cfg(feature = "github")]
pub use github::{GitHubConfig, GitHubHost};
