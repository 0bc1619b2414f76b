use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Fixed PCM layout of every stream handled by this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub channels: u16,
    /// Bytes per sample (1..=4).
    pub sample_width: u16,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Bytes of one sample frame across all channels.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_width as usize
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.sample_width * 8
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(invalid("AUDIO_CHANNELS", "must be at least 1"));
        }
        if !(1..=4).contains(&self.sample_width) {
            return Err(invalid(
                "AUDIO_SAMPLE_WIDTH",
                format!("{} bytes is not supported (1..=4)", self.sample_width),
            ));
        }
        if self.sample_rate == 0 {
            return Err(invalid("AUDIO_SAMPLE_RATE", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    /// mono / 16-bit / 48 kHz
    fn default() -> Self {
        Self {
            channels: 1,
            sample_width: 2,
            sample_rate: 48_000,
        }
    }
}

/// Settings consumed by sessions, jitter buffers, playout workers and the
/// segment writer. Injected into the registry; nothing in the engine reads
/// the environment directly.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub prefill_threshold: usize,
    pub max_wait: Duration,
    pub inactivity_timeout: Duration,
    pub segment_duration: Duration,
    pub poll_interval: Duration,
    pub format: AudioFormat,
    pub recordings_dir: PathBuf,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefill_threshold == 0 {
            return Err(invalid("JITTER_PREFILL_PACKETS", "must be at least 1"));
        }
        if self.segment_duration < Duration::from_secs(1) {
            return Err(invalid("SEGMENT_SECONDS", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("PLAYOUT_POLL_MS", "must be at least 1"));
        }
        self.format.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefill_threshold: 20,
            max_wait: Duration::from_millis(80),
            inactivity_timeout: Duration::from_secs(5),
            segment_duration: Duration::from_secs(180),
            poll_interval: Duration::from_millis(5),
            format: AudioFormat::default(),
            recordings_dir: PathBuf::from("records"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    /// UDP port of the label side channel; 0 disables it.
    pub metadata_port: u16,
    pub receive_buffer_bytes: usize,
    pub max_datagram_bytes: usize,
    pub shutdown_grace: Duration,
    /// Period of the buffer-size report; zero disables it.
    pub diagnostics_interval: Duration,
    pub engine: EngineConfig,
}

impl Config {
    /// Builds the process configuration from environment variables, falling
    /// back to the deployment defaults for anything unset or unparsable.
    ///
    /// Recognized keys: `RTP_LISTEN_ADDRESS`, `RTP_LISTEN_PORT`, `METADATA_PORT`,
    /// `JITTER_PREFILL_PACKETS`, `JITTER_MAX_WAIT_MS`, `INACTIVITY_TIMEOUT_SEC`,
    /// `SEGMENT_SECONDS`, `RECV_BUFFER_BYTES`, `MAX_DATAGRAM_BYTES`,
    /// `PLAYOUT_POLL_MS`, `AUDIO_CHANNELS`, `AUDIO_SAMPLE_WIDTH`,
    /// `AUDIO_SAMPLE_RATE`, `RECORDINGS_DIR`, `SHUTDOWN_GRACE_SEC`,
    /// `DIAG_INTERVAL_SEC`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_address = match env_non_empty("RTP_LISTEN_ADDRESS") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|e| invalid("RTP_LISTEN_ADDRESS", e.to_string()))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            prefill_threshold: env_usize("JITTER_PREFILL_PACKETS", defaults.prefill_threshold),
            max_wait: env_duration_ms("JITTER_MAX_WAIT_MS", 80),
            inactivity_timeout: env_duration_sec("INACTIVITY_TIMEOUT_SEC", 5),
            segment_duration: env_duration_sec("SEGMENT_SECONDS", 180),
            poll_interval: env_duration_ms("PLAYOUT_POLL_MS", 5),
            format: AudioFormat {
                channels: env_u16("AUDIO_CHANNELS", 1),
                sample_width: env_u16("AUDIO_SAMPLE_WIDTH", 2),
                sample_rate: env_u32("AUDIO_SAMPLE_RATE", 48_000),
            },
            recordings_dir: env_non_empty("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.recordings_dir),
        };

        let cfg = Self {
            listen_address,
            listen_port: env_u16("RTP_LISTEN_PORT", 6001),
            metadata_port: env_u16("METADATA_PORT", 6002),
            receive_buffer_bytes: env_usize("RECV_BUFFER_BYTES", 8 << 20),
            max_datagram_bytes: env_usize("MAX_DATAGRAM_BYTES", 8192),
            shutdown_grace: env_duration_sec("SHUTDOWN_GRACE_SEC", 5),
            diagnostics_interval: env_duration_sec("DIAG_INTERVAL_SEC", 30),
            engine,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_datagram_bytes < crate::protocol::rtp::parser::RTP_HEADER_LEN {
            return Err(invalid("MAX_DATAGRAM_BYTES", "smaller than an RTP header"));
        }
        self.engine.validate()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    pub fn metadata_addr(&self) -> Option<SocketAddr> {
        (self.metadata_port != 0).then(|| SocketAddr::new(self.listen_address, self.metadata_port))
    }
}

#[derive(Clone, Debug)]
pub enum LogMode {
    Stdout,
    File,
}

#[derive(Clone, Debug)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub mode: LogMode,
    pub format: LogFormat,
    pub dir: Option<String>,
    pub file_name: String,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let dir_env = env_non_empty("LOG_DIR");
        let mode_env = env_non_empty("LOG_MODE");
        let format_env = env_non_empty("LOG_FORMAT");

        let format = match format_env.as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let mode = match mode_env.as_deref() {
            Some("file") => LogMode::File,
            Some("stdout") => LogMode::Stdout,
            _ => {
                if dir_env.is_some() {
                    LogMode::File
                } else {
                    LogMode::Stdout
                }
            }
        };

        let dir = match mode {
            LogMode::File => Some(dir_env.unwrap_or_else(|| "logs".to_string())),
            LogMode::Stdout => None,
        };

        let file_name = env_non_empty("LOG_FILE_NAME").unwrap_or_else(|| "app.log".to_string());

        Self {
            mode,
            format,
            dir,
            file_name,
        }
    }
}

static LOGGING: OnceLock<LoggingConfig> = OnceLock::new();

pub fn logging_config() -> &'static LoggingConfig {
    LOGGING.get_or_init(LoggingConfig::from_env)
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_ms))
}

fn env_duration_sec(key: &str, default_sec: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_sec))
}

fn env_u16(key: &str, default_value: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default_value)
}

fn env_u32(key: &str, default_value: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
