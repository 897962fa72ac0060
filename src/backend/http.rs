//! HTTP backend implementation
//!
//! Talks JSON to the relay service. Every response body is an envelope:
//! an `error` field means failure, anything else is decoded into the
//! stage's success payload. Requests are bounded by the configured
//! request timeout.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    Acquisition, Backend, DestinationFolder, PlatformResult, PlatformUploadRequest,
    StorageResult, VideoMetadata,
};
use crate::config::Config;
use crate::{Error, Result};

/// Marker the platform endpoint sets when the grant must be renewed
const REAUTH_MARKER: &str = "reauth";

/// HTTP backend for the relay service
pub struct HttpBackend {
    /// Resolved endpoint configuration
    config: Config,
    /// HTTP client
    client: reqwest::Client,
    /// Upper bound on a single exchange
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ReferenceBody<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct StorageUploadBody<'a> {
    filename: &'a str,
    folder_id: &'a str,
    video_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PlatformUploadBody<'a> {
    filename: &'a str,
    video_id: &'a str,
    #[serde(flatten)]
    request: &'a PlatformUploadRequest,
}

#[derive(Debug, Deserialize)]
struct FolderList {
    #[serde(default)]
    folders: Vec<DestinationFolder>,
}

/// Error envelope carried by failed responses
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<serde_json::Value>,
    #[serde(default)]
    action_required: Option<String>,
}

impl HttpBackend {
    /// Create a new HTTP backend
    pub fn new(config: &Config) -> Result<Self> {
        Url::parse(&config.backend.base_url)
            .map_err(|e| Error::Config(format!("Invalid backend base_url: {}", e)))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            client,
            timeout: config.backend.request_timeout,
        })
    }

    /// Run a request future under the configured timeout
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", what, self.timeout);
                Err(Error::Transport(format!(
                    "{} timed out after {}",
                    what,
                    humantime::format_duration(self.timeout)
                )))
            }
        }
    }

    /// Send a request and decode the JSON envelope
    async fn exchange<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.config.endpoint(path);
        debug!("{} {}", method, url);

        self.bounded(path, async move {
            let mut request = self.client.request(method, &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Transport(format!("Request to {} failed: {}", path, e)))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("Reading {} failed: {}", path, e)))?;

            decode_envelope(status, &text)
        })
        .await
    }
}

/// Decode a response body into `T`, honouring the `error` envelope
fn decode_envelope<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<T> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) if status.is_success() => {
            return Err(Error::Transport(format!("Malformed response: {}", e)));
        }
        Err(_) => {
            return Err(Error::backend(format!("Server returned {}", status)));
        }
    };

    if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(value.clone()) {
        if let Some(error) = envelope.error.filter(|e| !e.is_null()) {
            let message = match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            if envelope.action_required.as_deref() == Some(REAUTH_MARKER) {
                return Err(Error::AuthorizationExpired { message });
            }
            return Err(Error::Backend { message });
        }
    }

    if !status.is_success() {
        return Err(Error::backend(format!("Server returned {}", status)));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::Transport(format!("Unexpected response shape: {}", e)))
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_metadata(&self, reference: &str) -> Result<VideoMetadata> {
        let paths = &self.config.backend.paths;
        self.exchange(
            Method::POST,
            &paths.metadata,
            Some(&ReferenceBody { url: reference }),
        )
        .await
    }

    async fn initiate_acquisition(&self, reference: &str) -> Result<Acquisition> {
        let paths = &self.config.backend.paths;
        let acquisition: Acquisition = self
            .exchange(
                Method::POST,
                &paths.acquire,
                Some(&ReferenceBody { url: reference }),
            )
            .await?;
        info!(
            "Backend acquired {} as {}",
            acquisition.item_id, acquisition.file_handle
        );
        Ok(acquisition)
    }

    async fn list_folders(&self) -> Result<Vec<DestinationFolder>> {
        let paths = &self.config.backend.paths;
        let list: FolderList = self
            .exchange::<(), _>(Method::GET, &paths.folders, None)
            .await?;
        Ok(list.folders)
    }

    async fn retrieve_file(&self, file_handle: &str, dest: &Path) -> Result<u64> {
        let mut url = Url::parse(&self.config.endpoint(&self.config.backend.paths.retrieve))
            .map_err(|e| Error::Config(format!("Invalid retrieve endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("Retrieve endpoint cannot take a path".into()))?
            .pop_if_empty()
            .push(file_handle);

        debug!("GET {}", url);

        self.bounded("retrieve", async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Transport(format!("Download failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(Error::backend(format!(
                    "Download failed ({})",
                    response.status()
                )));
            }

            let mut file = tokio::fs::File::create(dest).await?;
            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| Error::Transport(format!("Download interrupted: {}", e)))?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;

            Ok(written)
        })
        .await
    }

    async fn upload_to_storage(
        &self,
        acquisition: &Acquisition,
        folder_id: &str,
    ) -> Result<StorageResult> {
        let paths = &self.config.backend.paths;
        let body = StorageUploadBody {
            filename: &acquisition.file_handle,
            folder_id,
            video_id: &acquisition.item_id,
        };
        self.exchange(Method::POST, &paths.storage_upload, Some(&body))
            .await
    }

    async fn upload_to_platform(
        &self,
        acquisition: &Acquisition,
        request: &PlatformUploadRequest,
    ) -> Result<PlatformResult> {
        let paths = &self.config.backend.paths;
        let body = PlatformUploadBody {
            filename: &acquisition.file_handle,
            video_id: &acquisition.item_id,
            request,
        };
        self.exchange(Method::POST, &paths.platform_upload, Some(&body))
            .await
    }

    fn begin_auth_url(&self) -> String {
        self.config.endpoint(&self.config.backend.paths.begin_auth)
    }

    fn end_session_url(&self) -> String {
        self.config.endpoint(&self.config.backend.paths.end_session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_decode_success() {
        let result: StorageResult =
            decode_envelope(StatusCode::OK, r#"{"file_id": "R1"}"#).unwrap();
        assert_eq!(result.remote_file_id, "R1");
    }

    #[test]
    fn test_decode_error_payload() {
        let err = decode_envelope::<StorageResult>(
            StatusCode::OK,
            r#"{"error": "Folder not found"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.to_string(), "Folder not found");
    }

    #[test]
    fn test_decode_error_payload_with_failure_status() {
        let err = decode_envelope::<StorageResult>(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error": "Drive quota exceeded"}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Drive quota exceeded");
    }

    #[test]
    fn test_decode_reauth_marker() {
        let err = decode_envelope::<PlatformResult>(
            StatusCode::FORBIDDEN,
            r#"{"error": "YouTube permissions missing", "action_required": "reauth"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationExpired);
    }

    #[test]
    fn test_decode_null_error_is_success() {
        let result: PlatformResult = decode_envelope(
            StatusCode::OK,
            r#"{"error": null, "youtube_video_id": "V1"}"#,
        )
        .unwrap();
        assert_eq!(result.remote_video_id, "V1");
    }

    #[test]
    fn test_decode_non_json() {
        let err = decode_envelope::<StorageResult>(StatusCode::OK, "<html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err =
            decode_envelope::<StorageResult>(StatusCode::BAD_GATEWAY, "<html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let err = decode_envelope::<StorageResult>(StatusCode::OK, r#"{"id": 3}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_folder_list_missing_is_empty() {
        let list: FolderList = decode_envelope(StatusCode::OK, "{}").unwrap();
        assert!(list.folders.is_empty());
    }

    #[test]
    fn test_platform_body_flattens_request() {
        let acquisition = Acquisition {
            file_handle: "f1".into(),
            item_id: "abc123".into(),
            title: "Test".into(),
        };
        let request = PlatformUploadRequest {
            title: "Test".into(),
            description: String::new(),
            tags: "a".into(),
            privacy_level: "private".into(),
        };
        let body = PlatformUploadBody {
            filename: &acquisition.file_handle,
            video_id: &acquisition.item_id,
            request: &request,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["filename"], "f1");
        assert_eq!(json["video_id"], "abc123");
        assert_eq!(json["privacy_status"], "private");
    }

    #[test]
    fn test_navigation_urls() {
        let backend = HttpBackend::new(&Config::default()).unwrap();
        assert_eq!(backend.begin_auth_url(), "http://127.0.0.1:5000/google_login");
        assert_eq!(backend.end_session_url(), "http://127.0.0.1:5000/logout");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let mut config = Config::default();
        config.backend.base_url = "not a url".into();
        assert!(matches!(HttpBackend::new(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let mut config = Config::default();
        // Port 9 (discard) on localhost is closed in test environments
        config.backend.base_url = "http://127.0.0.1:9".into();
        config.backend.request_timeout = Duration::from_secs(5);
        let backend = HttpBackend::new(&config).unwrap();
        let err = backend.list_folders().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let mut config = Config::default();
        config.backend.request_timeout = Duration::from_secs(30);
        let backend = HttpBackend::new(&config).unwrap();

        let err = backend
            .bounded("get_folders", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "get_folders timed out after 30s");
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = Config::default();
        config.backend.base_url = format!("http://{}", addr);
        config.backend.request_timeout = Duration::from_millis(200);
        let backend = HttpBackend::new(&config).unwrap();

        let err = backend.list_folders().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("timed out"));
        server.abort();
    }
}
