//! Backend abstraction for the relay service
//!
//! Every stage talks to exactly one endpoint. The [`Backend`] trait is the
//! seam between the stage sequencer and the service that performs the
//! actual acquisition and uploads; [`HttpBackend`] speaks to the real HTTP
//! service.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Video metadata returned by the metadata stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    #[serde(rename = "duration", default, deserialize_with = "de_seconds")]
    pub duration_seconds: Option<u64>,
    #[serde(rename = "uploader", default, deserialize_with = "de_text")]
    pub uploader_name: String,
    #[serde(rename = "thumbnail", default, deserialize_with = "de_text")]
    pub thumbnail_url: String,
}

impl VideoMetadata {
    /// Duration as `h:mm:ss` or `m:ss`
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

// Durations arrive as integers or floats depending on the extractor
fn de_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.round() as u64))
}

fn de_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Format a duration in seconds the way the video page shows it
pub fn format_duration(seconds: Option<u64>) -> String {
    let seconds = match seconds {
        Some(s) if s > 0 => s,
        _ => return "Unknown".to_string(),
    };

    let hrs = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hrs > 0 {
        format!("{}:{:02}:{:02}", hrs, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

/// Server-side file produced by the acquisition stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acquisition {
    #[serde(rename = "filename")]
    pub file_handle: String,
    #[serde(rename = "video_id")]
    pub item_id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub title: String,
}

/// A folder the storage provider can upload into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationFolder {
    #[serde(rename = "id")]
    pub folder_id: String,
    #[serde(rename = "name")]
    pub folder_name: String,
}

/// Result of a successful storage upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageResult {
    #[serde(rename = "file_id")]
    pub remote_file_id: String,
}

/// Result of a successful platform upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    #[serde(rename = "youtube_video_id")]
    pub remote_video_id: String,
}

/// Fully-resolved platform upload fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUploadRequest {
    pub title: String,
    pub description: String,
    pub tags: String,
    #[serde(rename = "privacy_status")]
    pub privacy_level: String,
}

/// User-supplied platform fields; absent or blank fields take defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformUploadDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub privacy_level: Option<String>,
}

impl PlatformUploadDraft {
    /// Fill absent fields with the given defaults
    pub fn resolve(self, default_title: &str, default_privacy: &str) -> PlatformUploadRequest {
        fn pick(value: Option<String>, fallback: &str) -> String {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string())
        }

        PlatformUploadRequest {
            title: pick(self.title, default_title),
            description: self.description.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            privacy_level: pick(self.privacy_level, default_privacy),
        }
    }
}

/// Connection to the relay backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Resolve a reference to video metadata
    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata>;

    /// Ask the backend to acquire the video
    async fn initiate_acquisition(&self, reference: &str) -> Result<Acquisition>;

    /// List folders available in the storage provider
    async fn list_folders(&self) -> Result<Vec<DestinationFolder>>;

    /// Copy an acquired file to `dest`, returning the bytes written
    async fn retrieve_file(&self, file_handle: &str, dest: &Path) -> Result<u64>;

    /// Upload an acquired file into a storage folder
    async fn upload_to_storage(
        &self,
        acquisition: &Acquisition,
        folder_id: &str,
    ) -> Result<StorageResult>;

    /// Upload an acquired file to the sharing platform
    ///
    /// Fails with [`crate::Error::AuthorizationExpired`] when the backend
    /// reports that the grant must be renewed.
    async fn upload_to_platform(
        &self,
        acquisition: &Acquisition,
        request: &PlatformUploadRequest,
    ) -> Result<PlatformResult>;

    /// Navigation target that starts authorization
    fn begin_auth_url(&self) -> String;

    /// Navigation target that ends the session so it can be re-authorized
    fn end_session_url(&self) -> String;
}
