// Import configuration
// Persistent settings for the host admin and the Drive side

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::host::HostConfig;
use crate::providers::google_drive::DRIVE_API_BASE;
use crate::providers::{GoogleDriveConfig, OAuthConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid host URL '{0}': {1}")]
    InvalidUrl(String, String),
}

/// Import settings, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Base URL of the Wagtail site (e.g., https://cms.example.com/)
    #[serde(default)]
    pub host_url: String,
    #[serde(default = "default_import_path")]
    pub import_path: String,
    #[serde(default = "default_duplicate_review_path")]
    pub duplicate_review_path: String,
    /// Collection new images are filed under
    #[serde(default = "default_collection_id")]
    pub collection_id: u64,
    #[serde(default)]
    pub csrf_token: String,
    /// Raw `Cookie` header value, e.g. `sessionid=...; csrftoken=...`
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default = "default_drive_api_base")]
    pub drive_api_base: String,
    /// OAuth client used for refreshing the Drive token
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_folder_page_size")]
    pub folder_page_size: u32,
}

fn default_import_path() -> String {
    "/admin/image-import/import/".to_string()
}

fn default_duplicate_review_path() -> String {
    "/admin/image-import/find-duplicates/".to_string()
}

fn default_collection_id() -> u64 {
    1
}

fn default_drive_api_base() -> String {
    DRIVE_API_BASE.to_string()
}

fn default_folder_page_size() -> u32 {
    1000
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            host_url: String::new(),
            import_path: default_import_path(),
            duplicate_review_path: default_duplicate_review_path(),
            collection_id: default_collection_id(),
            csrf_token: String::new(),
            session_cookie: None,
            drive_api_base: default_drive_api_base(),
            client_id: None,
            client_secret: None,
            folder_page_size: default_folder_page_size(),
        }
    }
}

impl ImportConfig {
    /// `<config_dir>/drive-image-import/config.json`
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
        config_dir.join("drive-image-import").join("config.json")
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;

        // Holds the CSRF token and session cookie
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Validated host settings
    pub fn host_config(&self) -> Result<HostConfig, ConfigError> {
        if self.host_url.trim().is_empty() {
            return Err(ConfigError::Missing("host_url"));
        }
        if self.csrf_token.trim().is_empty() {
            return Err(ConfigError::Missing("csrf_token"));
        }
        let base_url = Url::parse(self.host_url.trim())
            .map_err(|e| ConfigError::InvalidUrl(self.host_url.clone(), e.to_string()))?;

        Ok(HostConfig {
            base_url,
            import_path: self.import_path.clone(),
            duplicate_review_path: self.duplicate_review_path.clone(),
            csrf_token: SecretString::from(self.csrf_token.clone()),
            session_cookie: self
                .session_cookie
                .clone()
                .filter(|c| !c.trim().is_empty())
                .map(SecretString::from),
        })
    }

    pub fn drive_config(&self) -> GoogleDriveConfig {
        GoogleDriveConfig {
            api_base: self.drive_api_base.clone(),
            page_size: self.folder_page_size,
        }
    }

    /// OAuth settings, when a client id is configured
    pub fn oauth_config(&self) -> Option<OAuthConfig> {
        self.client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| OAuthConfig::google(id, self.client_secret.as_deref()))
    }
}
