//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where retrieved files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Backend connection settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Synthetic progress cadence
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Sharing-platform upload defaults
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Artifact link templates
    #[serde(default)]
    pub links: LinkConfig,
}

fn default_download_dir() -> String {
    ".".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            backend: BackendConfig::default(),
            progress: ProgressConfig::default(),
            platform: PlatformConfig::default(),
            links: LinkConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .vidrelay/config.toml in current directory
            let local = PathBuf::from(".vidrelay/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.vidrelay/config.toml
            dirs::home_dir().map(|h| h.join(".vidrelay/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                Self::parse(&content)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(Error::Config("backend.base_url must not be empty".into()));
        }
        if self.backend.request_timeout.is_zero() {
            return Err(Error::Config("backend.request_timeout must be > 0".into()));
        }
        for (name, stage) in [
            ("acquisition", &self.progress.acquisition),
            ("storage", &self.progress.storage),
            ("platform", &self.progress.platform),
        ] {
            if stage.tick.is_zero() {
                return Err(Error::Config(format!("progress.{}.tick must be > 0", name)));
            }
            if !(0.0..=100.0).contains(&stage.ceiling) {
                return Err(Error::Config(format!(
                    "progress.{}.ceiling must be within 0..=100",
                    name
                )));
            }
            if !stage.max_step.is_finite() || stage.max_step < 0.0 {
                return Err(Error::Config(format!(
                    "progress.{}.max_step must be a finite number >= 0",
                    name
                )));
            }
        }
        // The platform ticker must stop short of 100 until the backend answers
        if self.progress.platform.ceiling >= 100.0 {
            return Err(Error::Config(
                "progress.platform.ceiling must be below 100".into(),
            ));
        }
        Ok(())
    }

    /// Download directory with `~` and environment variables expanded
    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.download_dir).into_owned())
    }

    /// Absolute URL for a backend path
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.backend.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Backend endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound on any single request
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Endpoint paths
    #[serde(default)]
    pub paths: EndpointPaths,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            paths: EndpointPaths::default(),
        }
    }
}

/// Paths of the individual backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub metadata: String,
    pub acquire: String,
    pub folders: String,
    /// Retrieval prefix; the file handle is appended as a path segment
    pub retrieve: String,
    pub storage_upload: String,
    pub platform_upload: String,
    pub begin_auth: String,
    pub end_session: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            metadata: "/get_video_info".to_string(),
            acquire: "/download".to_string(),
            folders: "/get_drive_folders".to_string(),
            retrieve: "/download_file".to_string(),
            storage_upload: "/upload_to_drive".to_string(),
            platform_upload: "/upload_to_youtube".to_string(),
            begin_auth: "/google_login".to_string(),
            end_session: "/logout".to_string(),
        }
    }
}

/// Progress cadence for every synthesized stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_acquisition_progress")]
    pub acquisition: StageProgressConfig,
    #[serde(default = "default_storage_progress")]
    pub storage: StageProgressConfig,
    #[serde(default = "default_platform_progress")]
    pub platform: StageProgressConfig,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            acquisition: default_acquisition_progress(),
            storage: default_storage_progress(),
            platform: default_platform_progress(),
        }
    }
}

/// Cadence of one progress ticker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageProgressConfig {
    /// Interval between ticks
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Largest random increment per tick
    pub max_step: f64,
    /// Highest percentage reachable by ticking alone
    pub ceiling: f64,
}

fn default_acquisition_progress() -> StageProgressConfig {
    StageProgressConfig {
        tick: Duration::from_secs(1),
        max_step: 10.0,
        ceiling: 100.0,
    }
}

fn default_storage_progress() -> StageProgressConfig {
    StageProgressConfig {
        tick: Duration::from_millis(1500),
        max_step: 8.0,
        ceiling: 100.0,
    }
}

fn default_platform_progress() -> StageProgressConfig {
    StageProgressConfig {
        tick: Duration::from_secs(1),
        max_step: 5.0,
        ceiling: 95.0,
    }
}

/// Defaults applied to platform uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Title used when none is given
    #[serde(default = "default_platform_title")]
    pub default_title: String,

    /// Privacy level used when none is given
    #[serde(default = "default_privacy")]
    pub default_privacy: String,

    /// Description prefilled by the platform form; `{reference}` is replaced
    #[serde(default = "default_description_template")]
    pub description_template: String,
}

fn default_platform_title() -> String {
    "Uploaded video".to_string()
}

fn default_privacy() -> String {
    "private".to_string()
}

fn default_description_template() -> String {
    "Uploaded via vidrelay\nOriginal video: {reference}".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default_title: default_platform_title(),
            default_privacy: default_privacy(),
            description_template: default_description_template(),
        }
    }
}

/// Templates for links to finished artifacts; `{id}` is replaced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub storage: String,
    pub platform: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            storage: "https://drive.google.com/file/d/{id}/view".to_string(),
            platform: "https://www.youtube.com/watch?v={id}".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn storage_link(&self, remote_file_id: &str) -> String {
        self.storage.replace("{id}", remote_file_id)
    }

    pub fn platform_link(&self, remote_video_id: &str) -> String {
        self.platform.replace("{id}", remote_video_id)
    }
}

/// Initialize .vidrelay directory with a default config
pub fn init(force: bool) -> Result<PathBuf> {
    let dir = PathBuf::from(".vidrelay");

    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }

    let config_path = dir.join("config.toml");
    if !config_path.exists() || force {
        let config_str = toml::to_string_pretty(&Config::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
    }

    Ok(config_path)
}

// Duration fields are written as humantime strings ("1s", "1500ms", "15m")
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
