// ABOUTME: Service configuration
// ABOUTME: Socket endpoints, enabled roles, peer limits, codec defaults and timer settings

use crate::error::Error;
use crate::peer::Role;
use crate::streaming::{AudioConfig, CodecConfig, DEFAULT_SINK_QUEUE, DEFAULT_SOURCE_QUEUE};
use crate::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Control channel socket path
    pub control_path: PathBuf,
    /// Audio data channel socket path
    pub data_path: PathBuf,
    /// Enabled local roles; the first one speaks on the control channel
    pub roles: Vec<Role>,
    /// Peer slots per role
    pub max_peers: usize,
    /// Peers allowed to be connecting or connected at once, per role
    pub max_connected: usize,
    /// Codec frame interval in milliseconds
    pub codec_interval_ms: u64,
    /// PCM parameters used until a peer negotiates its own
    pub audio: AudioConfig,
    /// Outbound frame queue bound
    pub source_queue_frames: usize,
    /// Inbound frame queue bound
    pub sink_queue_frames: usize,
    /// How long a control payload read may wait, in milliseconds
    pub control_poll_timeout_ms: u64,
    /// How long a data read may wait, in milliseconds
    pub data_poll_timeout_ms: u64,
    /// Wait after a remote opens signaling without media before connecting, in milliseconds
    pub signaling_grace_ms: u64,
    /// Demo tone frequency in Hz (0 for silence)
    pub tone_frequency: f64,
    /// Whether a hardware offload path is available
    pub offload: bool,
}

impl ServiceConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON file; absent fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the control socket path
    pub fn control_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = path.into();
        self
    }

    /// Set the data socket path
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Set the enabled roles
    pub fn roles(mut self, roles: impl Into<Vec<Role>>) -> Self {
        self.roles = roles.into();
        self
    }

    /// Set the peer slot count
    pub fn max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    /// Set the admission limit
    pub fn max_connected(mut self, max: usize) -> Self {
        self.max_connected = max;
        self
    }

    /// Set the codec interval in milliseconds
    pub fn codec_interval_ms(mut self, ms: u64) -> Self {
        self.codec_interval_ms = ms;
        self
    }

    /// Set the default PCM parameters
    pub fn audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    /// Set the outbound and inbound queue bounds
    pub fn queue_frames(mut self, source: usize, sink: usize) -> Self {
        self.source_queue_frames = source;
        self.sink_queue_frames = sink;
        self
    }

    /// Set the signaling grace period in milliseconds
    pub fn signaling_grace_ms(mut self, ms: u64) -> Self {
        self.signaling_grace_ms = ms;
        self
    }

    /// Set the demo tone frequency
    pub fn tone_frequency(mut self, hz: f64) -> Self {
        self.tone_frequency = hz;
        self
    }

    /// Enable or disable the offload path
    pub fn offload(mut self, enabled: bool) -> Self {
        self.offload = enabled;
        self
    }

    /// Codec configuration used when a peer has not negotiated one
    pub fn default_codec(&self) -> CodecConfig {
        CodecConfig {
            audio: self.audio,
            interval_ms: self.codec_interval_ms,
        }
    }

    /// Role the control channel speaks for
    pub fn control_role(&self) -> Option<Role> {
        self.roles.first().copied()
    }

    /// Signaling grace period
    pub fn signaling_grace(&self) -> Duration {
        Duration::from_millis(self.signaling_grace_ms)
    }

    /// Check the values for consistency
    pub fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(Error::Config("at least one role must be enabled".to_string()));
        }
        if self.roles.len() == 2 && self.roles[0] == self.roles[1] {
            return Err(Error::Config(format!("role {} listed twice", self.roles[0])));
        }
        if self.roles.len() > 2 {
            return Err(Error::Config("at most two roles can be enabled".to_string()));
        }
        if self.max_peers == 0 {
            return Err(Error::Config("max_peers must be positive".to_string()));
        }
        if self.codec_interval_ms == 0 {
            return Err(Error::Config("codec_interval_ms must be positive".to_string()));
        }
        if self.source_queue_frames == 0 || self.sink_queue_frames == 0 {
            return Err(Error::Config("queue bounds must be positive".to_string()));
        }
        if self.control_path == self.data_path {
            return Err(Error::Config(
                "control and data channels need distinct paths".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let runtime = std::env::temp_dir();
        Self {
            control_path: runtime.join(".a2dp_ctrl"),
            data_path: runtime.join(".a2dp_data"),
            roles: vec![Role::Source],
            max_peers: 6,
            max_connected: 1,
            codec_interval_ms: 20,
            audio: AudioConfig::default(),
            source_queue_frames: DEFAULT_SOURCE_QUEUE,
            sink_queue_frames: DEFAULT_SINK_QUEUE,
            control_poll_timeout_ms: 250,
            data_poll_timeout_ms: 0,
            signaling_grace_ms: 3000,
            tone_frequency: 440.0,
            offload: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ChannelMode;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_peers, 6);
        assert_eq!(config.max_connected, 1);
        assert_eq!(config.codec_interval_ms, 20);
        assert_eq!(config.source_queue_frames, 18);
        assert_eq!(config.sink_queue_frames, 80);
        assert_eq!(config.signaling_grace(), Duration::from_secs(3));
        assert_eq!(config.control_role(), Some(Role::Source));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServiceConfig::new()
            .roles([Role::Sink, Role::Source])
            .codec_interval_ms(10)
            .queue_frames(4, 8);
        assert_eq!(config.control_role(), Some(Role::Sink));
        assert_eq!(config.default_codec().interval_ms, 10);
        assert_eq!(config.source_queue_frames, 4);
        assert_eq!(config.sink_queue_frames, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServiceConfig::new().roles(Vec::new()).validate().is_err());
        assert!(ServiceConfig::new()
            .roles([Role::Sink, Role::Sink])
            .validate()
            .is_err());
        assert!(ServiceConfig::new().codec_interval_ms(0).validate().is_err());
        assert!(ServiceConfig::new().queue_frames(0, 1).validate().is_err());
        assert!(ServiceConfig::new()
            .control_path("/tmp/same")
            .data_path("/tmp/same")
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_overrides_keep_defaults() {
        let json = r#"{
            "roles": ["sink"],
            "codec_interval_ms": 10,
            "audio": { "sample_rate": 44100, "bits_per_sample": 16, "channel_mode": "mono" }
        }"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.roles, vec![Role::Sink]);
        assert_eq!(config.codec_interval_ms, 10);
        assert_eq!(config.audio.channel_mode, ChannelMode::Mono);
        assert_eq!(config.max_peers, 6);
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("a2dp-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "max_connected": 2, "offload": true }"#).unwrap();
        let config = ServiceConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.max_connected, 2);
        assert!(config.offload);

        assert!(ServiceConfig::from_json_file("/nonexistent/a2dp.json").is_err());
    }
}
