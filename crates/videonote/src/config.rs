use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::limits::Limits;
use crate::transcode::TranscodeProfile;

/// Configuration for the video note converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteConfig {
    /// Declared-metadata thresholds checked before any I/O
    pub limits: Limits,
    /// Fixed encoding profile every note is converted to
    pub profile: TranscodeProfile,
    /// Path to the ffmpeg binary (bare names are looked up on PATH)
    pub ffmpeg_bin: PathBuf,
    /// Directory holding per-request input/output slots
    pub work_dir: PathBuf,
    /// Watchdog for a single ffmpeg run in seconds (0 disables it)
    pub transcode_timeout_secs: u64,
    /// Whole-request timeout for downloads in seconds
    pub fetch_timeout_secs: u64,
    /// Base URL of the bot API used to resolve file handles
    pub bot_api_base: String,
    /// User agent sent with every download
    pub user_agent: String,
}

impl Default for NoteConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl NoteConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            limits: Limits::default(),
            profile: TranscodeProfile::default(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            work_dir: std::env::temp_dir().join("video-notes"),
            transcode_timeout_secs: 300,
            fetch_timeout_secs: 60,
            bot_api_base: "https://api.telegram.org".to_string(),
            user_agent: format!("videonote/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn transcode_timeout(&self) -> Option<Duration> {
        match self.transcode_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
