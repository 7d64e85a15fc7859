// ABOUTME: Codec provider seam used by the streaming engine
// ABOUTME: Codec configuration types plus a 16-bit PCM passthrough provider

use crate::peer::PeerAddress;
use crate::streaming::queue::Frame;
use crate::streaming::source::{PcmSink, PcmSource};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Codec provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Initialization rejected the configuration
    #[error("Codec initialization failed: {0}")]
    Init(String),

    /// Configuration not supported by this provider
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// Encoding a tick failed
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// Decoding a frame failed
    #[error("Decoding failed: {0}")]
    Decode(String),

    /// Provider used before init
    #[error("Codec not initialized")]
    NotInitialized,
}

/// Channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// One channel
    Mono,
    /// Two interleaved channels
    Stereo,
}

impl ChannelMode {
    /// Number of interleaved channels
    pub fn channels(&self) -> u8 {
        match self {
            ChannelMode::Mono => 1,
            ChannelMode::Stereo => 2,
        }
    }

    /// Wire byte (channel count)
    pub fn as_byte(&self) -> u8 {
        self.channels()
    }

    /// Parse the wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ChannelMode::Mono),
            2 => Some(ChannelMode::Stereo),
            _ => None,
        }
    }
}

/// PCM-side audio parameters (what the audio subsystem feeds or receives)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample
    pub bits_per_sample: u8,
    /// Channel layout
    pub channel_mode: ChannelMode,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            bits_per_sample: 16,
            channel_mode: ChannelMode::Stereo,
        }
    }
}

/// Negotiated codec result consumed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// PCM parameters
    pub audio: AudioConfig,
    /// Frame interval in milliseconds
    pub interval_ms: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            interval_ms: 20,
        }
    }
}

/// Peer-specific parameters handed to the codec at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerParams {
    /// Remote peer address
    pub address: PeerAddress,
    /// Peer supports EDR
    pub is_edr: bool,
    /// Peer supports the 3 Mbps EDR rate
    pub supports_3mbps: bool,
}

/// Trait for codec providers
///
/// One provider instance serves one role. The engine calls `init` when a
/// session starts and `cleanup` when it stops; in between it drives
/// `encode_tick` (source) or `decode` (sink) from the streaming worker.
pub trait CodecProvider: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Prepare for a session with the given peer and configuration
    fn init(&mut self, peer: &PeerParams, config: &CodecConfig) -> Result<(), CodecError>;

    /// Produce up to one interval's worth of frames into `out`; returns the count
    fn encode_tick(&mut self, now: Instant, out: &mut Vec<Frame>) -> Result<usize, CodecError>;

    /// Decode one received frame
    fn decode(&mut self, frame: &Frame) -> Result<(), CodecError>;

    /// Reset internal buffering state (after a (re)start)
    fn feeding_reset(&mut self);

    /// Drop any buffered input
    fn feeding_flush(&mut self);

    /// Frame interval in milliseconds (0 before init)
    fn interval_ms(&self) -> u64;

    /// Largest frame payload this provider produces or expects
    fn max_frame_bytes(&self) -> usize;

    /// Hint about the current outbound queue depth
    fn set_queue_depth_hint(&mut self, _depth: usize) {}

    /// Apply a new PCM feeding configuration from the audio subsystem
    fn update_feeding(&mut self, _audio: AudioConfig) {}

    /// Release session resources
    fn cleanup(&mut self) {}
}

/// 16-bit PCM passthrough provider
///
/// Packs one interval of little-endian samples per frame on the source side
/// and unpacks frames into a [`PcmSink`] on the sink side.
pub struct PcmCodec {
    config: Option<CodecConfig>,
    source: Box<dyn PcmSource>,
    sink: Box<dyn PcmSink>,
    frames_produced: u64,
}

impl PcmCodec {
    /// Create a provider reading from `source` and writing decoded audio to `sink`
    pub fn new(source: Box<dyn PcmSource>, sink: Box<dyn PcmSink>) -> Self {
        Self {
            config: None,
            source,
            sink,
            frames_produced: 0,
        }
    }

    /// Frames produced since the last feeding reset
    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    fn samples_per_channel(config: &CodecConfig) -> usize {
        (u64::from(config.audio.sample_rate) * config.interval_ms / 1000) as usize
    }
}

impl CodecProvider for PcmCodec {
    fn name(&self) -> &str {
        "pcm"
    }

    fn init(&mut self, peer: &PeerParams, config: &CodecConfig) -> Result<(), CodecError> {
        if config.audio.bits_per_sample != 16 {
            return Err(CodecError::Unsupported(format!(
                "{} bits per sample",
                config.audio.bits_per_sample
            )));
        }
        if config.interval_ms == 0 {
            return Err(CodecError::Init("zero frame interval".to_string()));
        }

        log::debug!(
            "PCM codec init for {}: {} Hz, {} channels, {} ms",
            peer.address,
            config.audio.sample_rate,
            config.audio.channel_mode.channels(),
            config.interval_ms
        );
        self.config = Some(*config);
        Ok(())
    }

    fn encode_tick(&mut self, now: Instant, out: &mut Vec<Frame>) -> Result<usize, CodecError> {
        let config = self.config.ok_or(CodecError::NotInitialized)?;
        let samples_per_channel = Self::samples_per_channel(&config);

        let samples = match self.source.read_chunk(&config.audio, samples_per_channel) {
            Some(samples) => samples,
            None => return Ok(0),
        };

        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }

        out.push(Frame::new(payload, 1, now));
        self.frames_produced += 1;
        Ok(1)
    }

    fn decode(&mut self, frame: &Frame) -> Result<(), CodecError> {
        if self.config.is_none() {
            return Err(CodecError::NotInitialized);
        }
        if frame.payload.len() % 2 != 0 {
            return Err(CodecError::Decode(format!(
                "odd payload length {}",
                frame.payload.len()
            )));
        }

        let samples: Vec<i16> = frame
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.sink.write(&samples);
        Ok(())
    }

    fn feeding_reset(&mut self) {
        self.source.reset();
        self.frames_produced = 0;
    }

    fn feeding_flush(&mut self) {
        self.sink.flush();
    }

    fn interval_ms(&self) -> u64 {
        self.config.map(|c| c.interval_ms).unwrap_or(0)
    }

    fn max_frame_bytes(&self) -> usize {
        match self.config {
            Some(config) => {
                Self::samples_per_channel(&config)
                    * config.audio.channel_mode.channels() as usize
                    * 2
            }
            None => 0,
        }
    }

    fn update_feeding(&mut self, audio: AudioConfig) {
        if let Some(config) = self.config.as_mut() {
            config.audio = audio;
        }
    }

    fn cleanup(&mut self) {
        self.config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::{CountingSink, SilenceSource, ToneSource};

    fn params() -> PeerParams {
        PeerParams {
            address: PeerAddress::new([1, 2, 3, 4, 5, 6]),
            is_edr: false,
            supports_3mbps: false,
        }
    }

    #[test]
    fn test_encode_one_interval() {
        let mut codec = PcmCodec::new(Box::new(ToneSource::new(440.0)), Box::new(CountingSink::new()));
        codec.init(&params(), &CodecConfig::default()).unwrap();

        let mut out = Vec::new();
        let produced = codec.encode_tick(Instant::now(), &mut out).unwrap();

        assert_eq!(produced, 1);
        // 48000 Hz * 20ms = 960 samples per channel, stereo, 2 bytes each
        assert_eq!(out[0].payload.len(), 3840);
        assert_eq!(codec.max_frame_bytes(), 3840);
        assert_eq!(codec.interval_ms(), 20);
    }

    #[test]
    fn test_decode_counts_samples() {
        let sink = CountingSink::new();
        let mut codec = PcmCodec::new(Box::new(SilenceSource), Box::new(sink.clone()));
        codec.init(&params(), &CodecConfig::default()).unwrap();

        let frame = Frame::new(vec![0; 64], 1, Instant::now());
        codec.decode(&frame).unwrap();
        assert_eq!(sink.samples(), 32);

        let odd = Frame::new(vec![0; 3], 1, Instant::now());
        assert!(codec.decode(&odd).is_err());
    }

    #[test]
    fn test_rejects_unsupported_depth() {
        let mut codec = PcmCodec::new(Box::new(SilenceSource), Box::new(CountingSink::new()));
        let mut config = CodecConfig::default();
        config.audio.bits_per_sample = 24;
        assert!(matches!(
            codec.init(&params(), &config),
            Err(CodecError::Unsupported(_))
        ));
        assert_eq!(codec.interval_ms(), 0);
    }

    #[test]
    fn test_encode_before_init_fails() {
        let mut codec = PcmCodec::new(Box::new(SilenceSource), Box::new(CountingSink::new()));
        let mut out = Vec::new();
        assert_eq!(
            codec.encode_tick(Instant::now(), &mut out),
            Err(CodecError::NotInitialized)
        );
    }

    #[test]
    fn test_channel_mode_bytes() {
        assert_eq!(ChannelMode::from_byte(2), Some(ChannelMode::Stereo));
        assert_eq!(ChannelMode::from_byte(1), Some(ChannelMode::Mono));
        assert_eq!(ChannelMode::from_byte(7), None);
        assert_eq!(ChannelMode::Stereo.as_byte(), 2);
    }
}
