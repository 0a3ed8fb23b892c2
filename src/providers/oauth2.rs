//! OAuth2 Token Refresh
//!
//! Keeps a Drive access token fresh using a stored refresh token. The
//! interactive consent step belongs to the picker integration; this module
//! only runs the refresh-token grant and caches the result on disk.

use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken,
    TokenResponse, TokenUrl,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::{ProviderError, TokenSource};

/// OAuth2 client with only the token endpoint set (v5 typestates)
type RefreshClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Google's token endpoint
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Simple error wrapper for the oauth2 HTTP client adapter.
#[derive(Debug)]
struct OAuth2TransportError(String);

impl std::fmt::Display for OAuth2TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OAuth2TransportError {}

/// Bridges reqwest 0.13 to oauth2's `AsyncHttpClient` trait, whose built-in
/// reqwest support targets an older reqwest.
struct OAuth2HttpClient;

impl<'c> oauth2::AsyncHttpClient<'c> for OAuth2HttpClient {
    type Error = oauth2::HttpClientError<OAuth2TransportError>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + Sync + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let url = request.uri().to_string();

            let mut builder = client.request(method, &url);
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            builder = builder.body(request.into_body());

            let response = builder.send().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::builder()
                .status(http::StatusCode::from_u16(status_code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in headers.iter() {
                http_response = http_response.header(name.as_str(), value.as_bytes());
            }
            http_response
                .body(body.to_vec())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// OAuth2 client settings for the refresh grant
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
}

impl OAuthConfig {
    pub fn google(client_id: &str, client_secret: Option<&str>) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }

    fn create_client(&self) -> Result<RefreshClient, ProviderError> {
        let token_url = TokenUrl::new(self.token_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid token URL: {}", e)))?;

        let mut client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_token_uri(token_url);

        if let Some(ref secret) = self.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }
}

/// Stored OAuth2 tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>, // Unix timestamp
}

impl StoredTokens {
    /// Check if token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + 300,
            None => false,
        }
    }
}

/// Token source that refreshes the Drive access token when it expires
pub struct RefreshingToken {
    config: OAuthConfig,
    token_path: PathBuf,
    cached: Mutex<Option<StoredTokens>>,
}

impl RefreshingToken {
    pub fn new(config: OAuthConfig, token_path: PathBuf) -> Self {
        Self {
            config,
            token_path,
            cached: Mutex::new(None),
        }
    }

    /// Seed the store with a refresh token obtained out of band
    pub fn with_refresh_token(
        config: OAuthConfig,
        token_path: PathBuf,
        refresh_token: &str,
    ) -> Result<Self, ProviderError> {
        let tokens = StoredTokens {
            access_token: String::new(),
            refresh_token: Some(refresh_token.to_string()),
            expires_at: None,
        };
        store_tokens(&token_path, &tokens)?;
        Ok(Self::new(config, token_path))
    }

    /// `<config_dir>/drive-image-import/oauth_tokens.json`
    pub fn default_token_path() -> Result<PathBuf, ProviderError> {
        let base = dirs::config_dir()
            .ok_or_else(|| ProviderError::Other("Could not find config directory".to_string()))?;
        Ok(base.join("drive-image-import").join("oauth_tokens.json"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<StoredTokens, ProviderError> {
        let client = self.config.create_client()?;

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&OAuth2HttpClient)
            .await
            .map_err(|e| ProviderError::AuthenticationFailed(format!("Token refresh failed: {}", e)))?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        let tokens = StoredTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())), // Keep old refresh token if not returned
            expires_at,
        };

        store_tokens(&self.token_path, &tokens)?;
        info!("OAuth2 access token refreshed");
        Ok(tokens)
    }
}

#[async_trait]
impl TokenSource for RefreshingToken {
    async fn access_token(&self) -> Result<SecretString, ProviderError> {
        let mut cached = self.cached.lock().await;

        let mut tokens = match cached.take() {
            Some(tokens) => tokens,
            None => load_tokens(&self.token_path)?,
        };

        if tokens.is_expired() {
            let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
                ProviderError::AuthenticationFailed(
                    "Token expired and no refresh token available".to_string(),
                )
            })?;
            tokens = self.refresh(&refresh_token).await?;
        }

        let token = SecretString::from(tokens.access_token.clone());
        *cached = Some(tokens);
        Ok(token)
    }
}

fn load_tokens(path: &Path) -> Result<StoredTokens, ProviderError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ProviderError::AuthenticationFailed(format!("No stored tokens: {}", e)))?;
    serde_json::from_str(&json)
        .map_err(|e| ProviderError::ParseError(format!("Failed to parse tokens: {}", e)))
}

fn store_tokens(path: &Path, tokens: &StoredTokens) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(tokens)
        .map_err(|e| ProviderError::Other(format!("Failed to serialize tokens: {}", e)))?;
    std::fs::write(path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
