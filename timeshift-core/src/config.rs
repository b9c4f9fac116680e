//! Centralized configuration for timeshift streaming.
//!
//! Every tunable the buffering strategies consume lives here and is passed
//! explicitly through [`StreamContext`](crate::timeshift::StreamContext);
//! nothing reads process-wide state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Central configuration for all timeshift components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeshiftConfig {
    pub backend: BackendConfig,
    pub streaming: StreamingConfig,
    pub ring: RingConfig,
}

/// How live television is delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMethod {
    /// Direct read of the live HTTP stream, no buffering
    #[default]
    RealTime,
    /// Remote ring buffer driven by the block-window socket protocol
    Timeshift,
    /// Remote rotating segment files
    RollingFile,
    /// One growing remote file seeked within a retention window
    ClientTimeshift,
    /// Remote transcoding session with lease keep-alive
    Transcoded,
}

impl std::str::FromStr for StreamingMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "real_time" | "realtime" => Ok(Self::RealTime),
            "timeshift" => Ok(Self::Timeshift),
            "rolling_file" | "rolling" => Ok(Self::RollingFile),
            "client_timeshift" | "client" => Ok(Self::ClientTimeshift),
            "transcoded" | "transcode" => Ok(Self::Transcoded),
            _ => Err(ConfigError::Invalid {
                reason: format!("unknown streaming method: {s}"),
            }),
        }
    }
}

impl std::fmt::Display for StreamingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RealTime => write!(f, "real_time"),
            Self::Timeshift => write!(f, "timeshift"),
            Self::RollingFile => write!(f, "rolling_file"),
            Self::ClientTimeshift => write!(f, "client_timeshift"),
            Self::Transcoded => write!(f, "transcoded"),
        }
    }
}

/// Remote backend location and control-plane behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend host name or address
    pub host: String,
    /// HTTP service port
    pub port: u16,
    /// Session id issued by the backend after login
    pub session_id: String,
    /// Use HTTPS for service and stream URLs
    pub use_tls: bool,
    /// Timeout for each control-plane request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Seconds the backend clock runs ahead of ours
    pub server_time_offset_secs: i64,
    /// Transcode profile requested for transcoded playback
    pub transcode_profile: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8866,
            session_id: String::new(),
            use_tls: false,
            request_timeout: Duration::from_secs(10),
            user_agent: "timeshift/0.1.0".to_string(),
            server_time_offset_secs: 0,
            transcode_profile: "720p-2mbps".to_string(),
        }
    }
}

impl BackendConfig {
    /// Base URL of the backend web service, without trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Streaming and buffering behaviour shared by all strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Selected delivery method for live television
    pub method: StreamingMethod,
    /// Host read chunk size for live streams
    pub live_chunk_size: usize,
    /// Host read chunk size for recordings
    pub recording_chunk_size: usize,
    /// Minimum buffered duration before handing a stream to the host
    #[serde(with = "duration_secs")]
    pub prebuffer: Duration,
    /// Give up waiting for the prebuffer after this long
    #[serde(with = "duration_secs")]
    pub prebuffer_timeout: Duration,
    /// How far back the timeshift window reaches
    #[serde(with = "duration_secs")]
    pub timeshift_buffer: Duration,
    /// Longest a single host read may block
    #[serde(with = "duration_millis")]
    pub read_timeout: Duration,
    /// Cadence of metadata polls while a stream is active
    #[serde(with = "duration_millis")]
    pub refresh_interval: Duration,
    /// Keep-alive cadence for leased sessions
    #[serde(with = "duration_secs")]
    pub lease_interval: Duration,
    /// Keep-alive retry cadence after a failed lease
    #[serde(with = "duration_secs")]
    pub lease_retry_interval: Duration,
    /// Consecutive metadata failures tolerated before the stream is closed
    pub max_poll_failures: u32,
    /// Segments retained by the rolling-file strategy
    pub max_segments: usize,
    /// Rotation interval used when the backend does not rotate on EPG boundaries
    #[serde(with = "duration_secs")]
    pub rollover_interval: Duration,
    /// Client timeshift streams count as real-time for this long after start
    #[serde(with = "duration_secs")]
    pub real_time_grace: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            method: StreamingMethod::RealTime,
            live_chunk_size: 64 * 1024,
            recording_chunk_size: 32 * 1024,
            prebuffer: Duration::from_secs(1),
            prebuffer_timeout: Duration::from_secs(10),
            timeshift_buffer: Duration::from_secs(3600),
            read_timeout: Duration::from_millis(2500),
            refresh_interval: Duration::from_millis(1000),
            lease_interval: Duration::from_secs(7),
            lease_retry_interval: Duration::from_secs(1),
            max_poll_failures: 5,
            max_segments: 4,
            rollover_interval: Duration::from_secs(900),
            real_time_grace: Duration::from_secs(10),
        }
    }
}

/// Block-window socket protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Port of the backend's block-request listener
    pub port: u16,
    /// Bytes per requested block
    pub block_size: usize,
    /// Maximum outstanding block requests
    pub window_size: usize,
    /// Circular buffer capacity in blocks
    pub block_count: usize,
    /// Socket connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            port: 16891,
            block_size: 32768, // 32 KiB
            window_size: 6,
            block_count: 48,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RingConfig {
    /// Circular buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Bytes that must be buffered before `open` succeeds.
    pub fn prebuffer_bytes(&self) -> usize {
        self.block_size * self.window_size
    }
}

impl TimeshiftConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("TIMESHIFT_HOST") {
            config.backend.host = host;
        }

        if let Ok(port) = std::env::var("TIMESHIFT_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.backend.port = port;
        }

        if let Ok(sid) = std::env::var("TIMESHIFT_SID") {
            config.backend.session_id = sid;
        }

        if let Ok(method) = std::env::var("TIMESHIFT_METHOD")
            && let Ok(method) = method.parse::<StreamingMethod>()
        {
            config.streaming.method = method;
        }

        if let Ok(secs) = std::env::var("TIMESHIFT_PREBUFFER_SECS")
            && let Ok(secs) = secs.parse::<u64>()
        {
            config.streaming.prebuffer = Duration::from_secs(secs);
        }

        if let Ok(secs) = std::env::var("TIMESHIFT_BUFFER_SECS")
            && let Ok(secs) = secs.parse::<u64>()
        {
            config.streaming.timeshift_buffer = Duration::from_secs(secs);
        }

        if let Ok(kb) = std::env::var("TIMESHIFT_CHUNK_KB")
            && let Ok(kb) = kb.parse::<usize>()
        {
            config.streaming.live_chunk_size = kb * 1024;
        }

        config
    }

    /// Loads configuration from a JSON file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - File cannot be read
    /// - `ConfigError::Parse` - File is not valid configuration JSON
    /// - `ConfigError::Invalid` - Values fail [`TimeshiftConfig::validate`]
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            streaming: StreamingConfig {
                prebuffer: Duration::from_secs(1),
                prebuffer_timeout: Duration::from_secs(5),
                read_timeout: Duration::from_millis(500),
                refresh_interval: Duration::from_millis(200),
                lease_interval: Duration::from_secs(2),
                lease_retry_interval: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Checks values the buffering strategies rely on.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - A block, window or buffer size is unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring.block_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "block size must be greater than zero".to_string(),
            });
        }
        if self.ring.window_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "window size must be greater than zero".to_string(),
            });
        }
        // One block of slack keeps the block behind the read cursor intact.
        if self.ring.block_count < self.ring.window_size + 2 {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "buffer of {} blocks cannot hold a window of {} plus two spare blocks",
                    self.ring.block_count, self.ring.window_size
                ),
            });
        }
        if self.streaming.live_chunk_size == 0 || self.streaming.recording_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "read chunk sizes must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TimeshiftConfig::default();

        assert_eq!(config.backend.port, 8866);
        assert_eq!(config.ring.block_size, 32768);
        assert_eq!(config.ring.window_size, 6);
        assert_eq!(config.ring.prebuffer_bytes(), 6 * 32768);
        assert_eq!(config.streaming.method, StreamingMethod::RealTime);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_streaming_method_parsing() {
        assert_eq!(
            "rolling-file".parse::<StreamingMethod>().unwrap(),
            StreamingMethod::RollingFile
        );
        assert_eq!(
            "Timeshift".parse::<StreamingMethod>().unwrap(),
            StreamingMethod::Timeshift
        );
        assert!("carrier-pigeon".parse::<StreamingMethod>().is_err());
        assert_eq!(StreamingMethod::ClientTimeshift.to_string(), "client_timeshift");
    }

    #[test]
    fn test_validate_rejects_small_buffer() {
        let mut config = TimeshiftConfig::default();
        config.ring.block_count = config.ring.window_size + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_base_url() {
        let mut backend = BackendConfig::default();
        backend.host = "dvr.local".to_string();
        assert_eq!(backend.base_url(), "http://dvr.local:8866");
        backend.use_tls = true;
        assert_eq!(backend.base_url(), "https://dvr.local:8866");
    }

    #[test]
    fn test_json_file_keeps_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": {{"host": "{}"}}, "streaming": {{"method": "{}", "prebuffer": 4}}}}"#,
            "10.0.0.2",
            "rolling_file"
        )
        .unwrap();

        let config = TimeshiftConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.backend.host, "10.0.0.2");
        assert_eq!(config.backend.port, 8866);
        assert_eq!(config.streaming.method, StreamingMethod::RollingFile);
        assert_eq!(config.streaming.prebuffer, Duration::from_secs(4));
        assert_eq!(config.ring.block_size, 32768);
    }

    #[test]
    fn test_json_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ring": {{"block_size": 0}}}}"#).unwrap();

        assert!(matches!(
            TimeshiftConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
