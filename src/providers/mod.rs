//! Remote Provider Module
//!
//! Everything on the cloud-storage side of an import: the descriptors the
//! picker hands over, the byte fetch for a single file, and the bearer token
//! used to authorize it.
//!
//! ```text
//!  PickedItem ──► GoogleDriveSource::build_catalog ──► Vec<RemoteFileDescriptor>
//!                                                              │
//!  TokenSource::access_token ──► RemoteFileSource::fetch ◄─────┘ (one job at a time)
//! ```

pub mod types;
pub mod oauth2;
pub mod google_drive;

pub use types::*;
pub use google_drive::{GoogleDriveConfig, GoogleDriveSource};
pub use oauth2::{OAuthConfig, RefreshingToken, StoredTokens};

use async_trait::async_trait;
use secrecy::SecretString;

/// Progress callback: `(bytes_received, total_bytes_if_known)`
pub type FetchProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Byte fetch for one remote file
#[async_trait]
pub trait RemoteFileSource: Send + Sync {
    /// Download the whole file body into memory.
    ///
    /// `resource_key` must be presented for files the user reached through a
    /// share link rather than owning them.
    async fn fetch(
        &self,
        remote_id: &str,
        resource_key: Option<&str>,
        token: &SecretString,
        on_progress: FetchProgress<'_>,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// Source of the current session's bearer token.
///
/// Read once per job start, so a refresh between jobs is picked up.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<SecretString, ProviderError>;
}

/// A fixed token handed over by an external auth handshake
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<SecretString, ProviderError> {
        Ok(self.0.clone())
    }
}
