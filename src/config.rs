//! Bridge configuration
//!
//! Everything here is a static input: the signaling listener, session timing, frame pipe
//! tuning and the encoder profile used to build the subprocess argument list. The
//! configuration is read once from YAML and never mutated afterwards.
//!
//! ```rust
//! use hlsbridge::BridgeConfig;
//!
//! let config = BridgeConfig::from_yaml_str(
//!     r#"
//! session:
//!   grace_window_ms: 5000
//! pipe:
//!   decimation: 3
//! encoder:
//!   output_dir: /var/lib/hls
//!   width: 1280
//!   height: 720
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.pipe.decimation, 3);
//! assert_eq!(config.pipe.max_buffer_size, 10); // untouched keys keep their defaults
//! assert_eq!(config.encoder.width, 1280);
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::SessionId;
use crate::{BridgeError, Result};

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub pipe: PipeConfig,
    pub encoder: EncoderConfig,
}

impl BridgeConfig {
    /// Parse and validate a YAML configuration document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BridgeConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| BridgeError::ConfigFile { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.pipe.decimation == 0 {
            return Err(BridgeError::config("pipe.decimation must be at least 1"));
        }
        if self.pipe.max_buffer_size == 0 {
            return Err(BridgeError::config("pipe.max_buffer_size must be at least 1"));
        }
        if self.pipe.write_queue == 0 {
            return Err(BridgeError::config("pipe.write_queue must be at least 1"));
        }
        if self.pipe.pending_frames == 0 {
            return Err(BridgeError::config("pipe.pending_frames must be at least 1"));
        }
        if self.pipe.drains_to_direct == 0 {
            return Err(BridgeError::config("pipe.drains_to_direct must be at least 1"));
        }
        if self.encoder.width == 0 || self.encoder.height == 0 {
            return Err(BridgeError::config(format!(
                "encoder output size {}x{} is invalid",
                self.encoder.width, self.encoder.height
            )));
        }
        if self.encoder.frame_rate == 0 {
            return Err(BridgeError::config("encoder.frame_rate must be at least 1"));
        }
        if self.session.stats_interval_ms == 0 {
            return Err(BridgeError::config("session.stats_interval_ms must be at least 1"));
        }
        if self.signaling.outbound_queue == 0 {
            return Err(BridgeError::config("signaling.outbound_queue must be at least 1"));
        }
        Ok(())
    }
}

/// Signaling listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalingConfig {
    /// WebSocket listen address
    pub listen: SocketAddr,

    /// Outbound messages buffered per channel before new ones are dropped
    pub outbound_queue: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self { listen: SocketAddr::from(([0, 0, 0, 0], 8080)), outbound_queue: 128 }
    }
}

/// Session lifecycle timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How long a session survives transport loss before its resources are released
    pub grace_window_ms: u64,

    /// Interval between diagnostic statistics log lines
    pub stats_interval_ms: u64,
}

impl SessionConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { grace_window_ms: 10_000, stats_interval_ms: 5_000 }
    }
}

/// Frame pipe tuning
///
/// The decimation factor and the drain hysteresis are empirical constants; they are kept
/// configurable rather than baked in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeConfig {
    /// Capacity of the buffered-mode frame queue
    pub max_buffer_size: usize,

    /// Forward one frame out of every `decimation` arrivals
    pub decimation: u32,

    /// Consecutive full drains without overflow before returning to direct mode
    pub drains_to_direct: u32,

    /// Frames allowed in flight toward the encoder's stdin before writes report backpressure
    pub write_queue: usize,

    /// Decoded frames a session may have queued toward the core before new ones are shed
    pub pending_frames: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self { max_buffer_size: 10, decimation: 2, drains_to_direct: 3, write_queue: 2, pending_frames: 16 }
    }
}

/// Encoder subprocess profile
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderConfig {
    /// Encoder executable
    pub program: PathBuf,

    /// Directory receiving the playlist and segment files
    pub output_dir: PathBuf,

    /// Playlist file name inside `output_dir`
    pub playlist_name: String,

    /// Segment file name pattern inside `output_dir`
    pub segment_pattern: String,

    /// Target output width
    pub width: u32,

    /// Target output height
    pub height: u32,

    /// Declared input frame rate
    pub frame_rate: u32,

    /// Pixel format of the raw frames written to stdin
    pub input_pixel_format: String,

    pub preset: String,
    pub tune: String,
    pub crf: u32,
    pub gop_size: u32,
    pub keyint_min: u32,
    pub max_bitrate: String,
    pub bufsize: String,
    pub threads: u32,
    pub profile: String,
    pub level: String,

    /// Target segment duration in seconds
    pub segment_duration: u32,

    /// Number of segments kept in the playlist
    pub playlist_size: u32,

    /// Grace period between SIGINT and a forced kill
    pub stop_timeout_ms: u64,
}

impl EncoderConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Directory owned by one session's encoder
    pub fn session_dir(&self, session: SessionId) -> PathBuf {
        self.output_dir.join(session.to_string())
    }

    pub fn playlist_path(&self, session: SessionId) -> PathBuf {
        self.session_dir(session).join(&self.playlist_name)
    }

    pub fn segment_path(&self, session: SessionId) -> PathBuf {
        self.session_dir(session).join(&self.segment_pattern)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            output_dir: PathBuf::from("output"),
            playlist_name: "stream.m3u8".to_string(),
            segment_pattern: "segment%03d.ts".to_string(),
            width: 640,
            height: 360,
            frame_rate: 15,
            input_pixel_format: "yuv420p".to_string(),
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            crf: 28,
            gop_size: 30,
            keyint_min: 15,
            max_bitrate: "1500k".to_string(),
            bufsize: "500k".to_string(),
            threads: 8,
            profile: "baseline".to_string(),
            level: "3.0".to_string(),
            segment_duration: 1,
            playlist_size: 5,
            stop_timeout_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().expect("defaults must validate");

        assert_eq!(config.signaling.listen.port(), 8080);
        assert_eq!(config.session.grace_window(), Duration::from_secs(10));
        assert_eq!(config.encoder.stop_timeout(), Duration::from_secs(2));
        assert_eq!(
            config.encoder.playlist_path(SessionId::new(1)),
            PathBuf::from("output/session-1/stream.m3u8")
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = BridgeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.pipe.drains_to_direct, 3);
        assert_eq!(config.encoder.program, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn rejects_zero_decimation() {
        let err = BridgeConfig::from_yaml_str("pipe:\n  decimation: 0\n").unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
        assert!(err.to_string().contains("decimation"));
    }

    #[test]
    fn rejects_zero_stats_interval() {
        let err = BridgeConfig::from_yaml_str("session:\n  stats_interval_ms: 0\n").unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
        assert!(err.to_string().contains("stats_interval_ms"));
    }

    #[test]
    fn sessions_write_to_separate_directories() {
        let encoder = EncoderConfig::default();
        let first = encoder.playlist_path(SessionId::new(1));
        let second = encoder.playlist_path(SessionId::new(2));

        assert_ne!(first, second);
        assert_ne!(encoder.segment_path(SessionId::new(1)), encoder.segment_path(SessionId::new(2)));
        assert!(first.starts_with(&encoder.output_dir));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = BridgeConfig::from_yaml_str("pipe:\n  decimate: 2\n").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigParse { .. }));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BridgeConfig::load("/nonexistent/hlsbridge.yaml").unwrap_err();
        match err {
            BridgeError::ConfigFile { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/hlsbridge.yaml"));
            }
            other => panic!("Expected ConfigFile error, got {other:?}"),
        }
    }
}
