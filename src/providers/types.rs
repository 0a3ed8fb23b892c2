//! Shared types for the remote provider side
//!
//! Remote file descriptors as produced by the picker/catalog step, picked
//! items, and the provider error type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Image metadata reported by Drive for photo files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMediaMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
    /// EXIF capture time, e.g. "2008:07:31 10:38:11"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
}

/// One file chosen on the remote provider.
///
/// Serialized with Drive's own field names, because the host's duplicate
/// matcher maps those names onto its database fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "thumbnailLink", default)]
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,
    #[serde(
        rename = "size",
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "size_to_string",
        deserialize_with = "size_from_string_or_number"
    )]
    pub size_bytes: Option<u64>,
    #[serde(rename = "fileExtension", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(rename = "md5Checksum", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_media_metadata: Option<ImageMediaMetadata>,
}

impl RemoteFileDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            thumbnail_url: String::new(),
            resource_key: None,
            size_bytes: None,
            extension: None,
            checksum: None,
            image_media_metadata: None,
        }
    }
}

/// Drive expects `<fileId>/<resourceKey>` for files shared by link
pub fn resource_key_header(id: &str, resource_key: Option<&str>) -> Option<String> {
    resource_key
        .filter(|key| !key.is_empty())
        .map(|key| format!("{}/{}", id, key))
}

// Drive reports `size` as a decimal string (int64 in JSON).
fn size_to_string<S: Serializer>(size: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    match size {
        Some(size) => serializer.serialize_str(&size.to_string()),
        None => serializer.serialize_none(),
    }
}

fn size_from_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(n)) => Ok(Some(n)),
        Some(Size::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid size {:?}: {}", s, e))),
    }
}

/// What the user picked in the file picker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickedKind {
    File,
    Folder,
}

/// A raw selection, before it is expanded into descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickedItem {
    pub id: String,
    pub kind: PickedKind,
}

impl PickedItem {
    pub fn file(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: PickedKind::File }
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: PickedKind::Folder }
    }
}

/// Remote provider errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
