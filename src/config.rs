use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Relay configuration, loadable from CLI args with an optional TOML file
/// merged underneath.
///
/// Example configuration file content
/// # Live Relay Configuration
///
/// ingest_port = 1935
/// http_port = 8080
/// app_name = "live"
/// segment_duration = 4
/// window_size = 6
/// allow_origin = "*"
/// transcoder_path = "ffmpeg"
/// retry_limit = 3
/// drain_timeout_secs = 5
/// workspace = "./data"
/// public_host = "relay.example.com"
///
/// # Optional: restrict publishing to these keys (file-only setting)
/// allowed_keys = ["mystream"]
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port the RTMP ingest listener binds
    #[arg(short, long, default_value_t = 1935)]
    #[serde(default = "default_ingest_port")]
    pub ingest_port: u16,

    /// Port the HTTP manifest/segment server binds
    #[arg(short = 'p', long, default_value_t = 8080)]
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Application namespace publishers and players address (`/<app>/<key>`)
    #[arg(short, long, default_value = "live")]
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Target segment duration in seconds
    #[arg(short, long, default_value_t = 4)]
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,

    /// Number of segments advertised in the sliding window
    #[arg(short = 'n', long, default_value_t = 6)]
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Allowed CORS origin for HTTP responses ("*" for any)
    #[arg(long, default_value = "*")]
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,

    /// Path to the transcoder binary
    #[arg(short, long, default_value = "ffmpeg")]
    #[serde(default = "default_transcoder_path")]
    pub transcoder_path: String,

    /// Consecutive transcoder failures tolerated before the session is closed
    #[arg(short, long, default_value_t = 3)]
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Seconds to wait for the transcoder to flush and exit after ingest ends
    #[arg(short = 'd', long, default_value_t = 5)]
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Working directory for per-session transcoder output
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Hostname used when computing ingest/playback URLs for clients
    #[arg(long, default_value = "localhost")]
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Stream keys allowed to publish; absent means any well-formed key
    #[arg(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_keys: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest_port: default_ingest_port(),
            http_port: default_http_port(),
            app_name: default_app_name(),
            segment_duration: default_segment_duration(),
            window_size: default_window_size(),
            allow_origin: default_allow_origin(),
            transcoder_path: default_transcoder_path(),
            retry_limit: default_retry_limit(),
            drain_timeout_secs: default_drain_timeout(),
            workspace: default_workspace(),
            public_host: default_public_host(),
            config: None,
            allowed_keys: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        if self.ingest_port == default_ingest_port() {
            self.ingest_port = file_config.ingest_port;
        }
        if self.http_port == default_http_port() {
            self.http_port = file_config.http_port;
        }
        if self.app_name == default_app_name() {
            self.app_name = file_config.app_name;
        }
        if self.segment_duration == default_segment_duration() {
            self.segment_duration = file_config.segment_duration;
        }
        if self.window_size == default_window_size() {
            self.window_size = file_config.window_size;
        }
        if self.allow_origin == default_allow_origin() {
            self.allow_origin = file_config.allow_origin;
        }
        if self.transcoder_path == default_transcoder_path() {
            self.transcoder_path = file_config.transcoder_path;
        }
        if self.retry_limit == default_retry_limit() {
            self.retry_limit = file_config.retry_limit;
        }
        if self.drain_timeout_secs == default_drain_timeout() {
            self.drain_timeout_secs = file_config.drain_timeout_secs;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.public_host == default_public_host() {
            self.public_host = file_config.public_host;
        }
        if self.allowed_keys.is_none() {
            self.allowed_keys = file_config.allowed_keys;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.segment_duration == 0 {
            return Err(anyhow::anyhow!("segment_duration must be at least 1"));
        }
        if self.window_size == 0 {
            return Err(anyhow::anyhow!("window_size must be at least 1"));
        }
        if self.app_name.is_empty() || self.app_name.contains('/') {
            return Err(anyhow::anyhow!("app_name must be a single path segment"));
        }
        if self.transcoder_path.is_empty() {
            return Err(anyhow::anyhow!("transcoder_path cannot be empty"));
        }
        if let Some(keys) = &self.allowed_keys
            && keys.iter().any(|k| !is_well_formed_key(k))
        {
            return Err(anyhow::anyhow!(
                "allowed_keys entries may only contain alphanumerics, '-' and '_'"
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Ingest URL a publisher should push to, for a given key
    pub fn ingest_url(&self, key: &str) -> String {
        format!(
            "rtmp://{}:{}/{}/{key}",
            self.public_host, self.ingest_port, self.app_name
        )
    }

    /// Playback URL a viewer should load, for a given key
    pub fn playback_url(&self, key: &str) -> String {
        format!(
            "http://{}:{}/{}/{key}.m3u8",
            self.public_host, self.http_port, self.app_name
        )
    }
}

/// Key policy shared by ingest validation and config validation.
pub fn is_well_formed_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// Default value functions
fn default_ingest_port() -> u16 {
    1935
}

fn default_http_port() -> u16 {
    8080
}

fn default_app_name() -> String {
    "live".to_string()
}

fn default_segment_duration() -> u32 {
    4
}

fn default_window_size() -> usize {
    6
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_transcoder_path() -> String {
    "ffmpeg".to_string()
}

fn default_retry_limit() -> u32 {
    3
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingest_port, 1935);
        assert_eq!(config.window_size, 6);
    }

    #[test]
    fn zero_window_rejected() {
        let config = Config {
            window_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_allow_list_rejected() {
        let config = Config {
            allowed_keys: Some(vec!["ok-key".into(), "bad/key".into()]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_settings_fill_cli_defaults() {
        let file = Config {
            ingest_port: 2935,
            allowed_keys: Some(vec!["mystream".into()]),
            ..Default::default()
        };
        let merged = Config::default().merge_with_file(file);
        assert_eq!(merged.ingest_port, 2935);
        assert_eq!(
            merged.allowed_keys.as_deref(),
            Some(&["mystream".to_string()][..])
        );
    }

    #[test]
    fn computed_urls() {
        let config = Config {
            public_host: "relay.example.com".into(),
            ..Default::default()
        };
        assert_eq!(
            config.ingest_url("mystream"),
            "rtmp://relay.example.com:1935/live/mystream"
        );
        assert_eq!(
            config.playback_url("mystream"),
            "http://relay.example.com:8080/live/mystream.m3u8"
        );
    }

    #[test]
    fn key_charset() {
        assert!(is_well_formed_key("abc_123-XYZ"));
        assert!(!is_well_formed_key(""));
        assert!(!is_well_formed_key("a/b"));
        assert!(!is_well_formed_key("a b"));
        assert!(!is_well_formed_key("a.b"));
    }
}
