// ABOUTME: Control channel wire format
// ABOUTME: One-byte command codes in, one-byte ack codes out, fixed-width little-endian payloads

use crate::error::Error;
use crate::streaming::{AudioConfig, ChannelMode};
use crate::Result;
use serde::Serialize;
use std::fmt;

/// Length of an encoded audio configuration
pub const AUDIO_CONFIG_LEN: usize = 6;
/// Length of an encoded presentation position
pub const POSITION_LEN: usize = 18;

/// Command codes sent by the audio subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Is some peer ready to stream
    CheckReady = 1,
    /// Start streaming
    Start = 2,
    /// Stop streaming
    Stop = 3,
    /// Suspend streaming
    Suspend = 4,
    /// Read the input (sink side) audio configuration
    GetInputAudioConfig = 5,
    /// Read the output (source side) audio configuration
    GetOutputAudioConfig = 6,
    /// Replace the output feeding configuration
    SetOutputAudioConfig = 7,
    /// Start the hardware offload path
    OffloadStart = 8,
    /// Read bytes transferred, delay and timestamp
    GetPresentationPosition = 9,
}

impl CommandCode {
    /// Every command code
    pub const ALL: [CommandCode; 9] = [
        CommandCode::CheckReady,
        CommandCode::Start,
        CommandCode::Stop,
        CommandCode::Suspend,
        CommandCode::GetInputAudioConfig,
        CommandCode::GetOutputAudioConfig,
        CommandCode::SetOutputAudioConfig,
        CommandCode::OffloadStart,
        CommandCode::GetPresentationPosition,
    ];

    /// Parse a wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == byte)
    }

    /// Wire byte
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Kebab-case name, as accepted by the control client
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCode::CheckReady => "check-ready",
            CommandCode::Start => "start",
            CommandCode::Stop => "stop",
            CommandCode::Suspend => "suspend",
            CommandCode::GetInputAudioConfig => "get-input-config",
            CommandCode::GetOutputAudioConfig => "get-output-config",
            CommandCode::SetOutputAudioConfig => "set-output-config",
            CommandCode::OffloadStart => "offload-start",
            CommandCode::GetPresentationPosition => "get-position",
        }
    }

    /// Bytes of payload that follow the command byte
    pub fn request_payload_len(&self) -> usize {
        match self {
            CommandCode::SetOutputAudioConfig => AUDIO_CONFIG_LEN,
            _ => 0,
        }
    }

    /// Bytes of payload that follow a successful ack
    pub fn reply_payload_len(&self) -> usize {
        match self {
            CommandCode::GetInputAudioConfig | CommandCode::GetOutputAudioConfig => {
                AUDIO_CONFIG_LEN
            }
            CommandCode::GetPresentationPosition => POSITION_LEN,
            _ => 0,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ack codes written back to the audio subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AckCode {
    /// Command succeeded
    Success = 0,
    /// Command failed
    Failure = 1,
    /// Refused because a voice call is active
    InCallFailure = 2,
    /// Command not supported
    Unsupported = 3,
    /// Outcome follows later
    Pending = 4,
    /// Refused because the link is closing
    DisconnectInProgress = 5,
}

impl AckCode {
    /// Parse a wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AckCode::Success),
            1 => Some(AckCode::Failure),
            2 => Some(AckCode::InCallFailure),
            3 => Some(AckCode::Unsupported),
            4 => Some(AckCode::Pending),
            5 => Some(AckCode::DisconnectInProgress),
            _ => None,
        }
    }

    /// Wire byte
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckCode::Success => "success",
            AckCode::Failure => "failure",
            AckCode::InCallFailure => "in-call failure",
            AckCode::Unsupported => "unsupported",
            AckCode::Pending => "pending",
            AckCode::DisconnectInProgress => "disconnect in progress",
        };
        f.write_str(name)
    }
}

/// A decoded control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// See [`CommandCode::CheckReady`]
    CheckReady,
    /// See [`CommandCode::Start`]
    Start,
    /// See [`CommandCode::Stop`]
    Stop,
    /// See [`CommandCode::Suspend`]
    Suspend,
    /// See [`CommandCode::GetInputAudioConfig`]
    GetInputAudioConfig,
    /// See [`CommandCode::GetOutputAudioConfig`]
    GetOutputAudioConfig,
    /// See [`CommandCode::SetOutputAudioConfig`]
    SetOutputAudioConfig(AudioConfig),
    /// See [`CommandCode::OffloadStart`]
    OffloadStart,
    /// See [`CommandCode::GetPresentationPosition`]
    GetPresentationPosition,
    /// Known code whose payload could not be read or parsed
    Malformed(CommandCode),
    /// Unrecognized code
    Unknown(u8),
}

impl ControlCommand {
    /// Decode a command from its code and request payload
    ///
    /// Never fails: bad input becomes `Unknown` or `Malformed`, which the
    /// handler answers with `Failure`.
    pub fn decode(code: u8, payload: &[u8]) -> Self {
        let Some(command) = CommandCode::from_byte(code) else {
            return ControlCommand::Unknown(code);
        };

        match command {
            CommandCode::CheckReady => ControlCommand::CheckReady,
            CommandCode::Start => ControlCommand::Start,
            CommandCode::Stop => ControlCommand::Stop,
            CommandCode::Suspend => ControlCommand::Suspend,
            CommandCode::GetInputAudioConfig => ControlCommand::GetInputAudioConfig,
            CommandCode::GetOutputAudioConfig => ControlCommand::GetOutputAudioConfig,
            CommandCode::SetOutputAudioConfig => match decode_audio_config(payload) {
                Ok(config) => ControlCommand::SetOutputAudioConfig(config),
                Err(e) => {
                    log::warn!("Bad {} payload: {}", command, e);
                    ControlCommand::Malformed(command)
                }
            },
            CommandCode::OffloadStart => ControlCommand::OffloadStart,
            CommandCode::GetPresentationPosition => ControlCommand::GetPresentationPosition,
        }
    }

    /// Wire byte of the command
    pub fn code(&self) -> u8 {
        match self {
            ControlCommand::CheckReady => CommandCode::CheckReady.as_byte(),
            ControlCommand::Start => CommandCode::Start.as_byte(),
            ControlCommand::Stop => CommandCode::Stop.as_byte(),
            ControlCommand::Suspend => CommandCode::Suspend.as_byte(),
            ControlCommand::GetInputAudioConfig => CommandCode::GetInputAudioConfig.as_byte(),
            ControlCommand::GetOutputAudioConfig => CommandCode::GetOutputAudioConfig.as_byte(),
            ControlCommand::SetOutputAudioConfig(_) => CommandCode::SetOutputAudioConfig.as_byte(),
            ControlCommand::OffloadStart => CommandCode::OffloadStart.as_byte(),
            ControlCommand::GetPresentationPosition => {
                CommandCode::GetPresentationPosition.as_byte()
            }
            ControlCommand::Malformed(code) => code.as_byte(),
            ControlCommand::Unknown(code) => *code,
        }
    }

    /// Command byte followed by its request payload
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.code()];
        if let ControlCommand::SetOutputAudioConfig(config) = self {
            bytes.extend_from_slice(&encode_audio_config(config));
        }
        bytes
    }
}

/// Encode an audio configuration: u32 sample rate, u8 bits, u8 channel count
pub fn encode_audio_config(config: &AudioConfig) -> [u8; AUDIO_CONFIG_LEN] {
    let mut out = [0u8; AUDIO_CONFIG_LEN];
    out[..4].copy_from_slice(&config.sample_rate.to_le_bytes());
    out[4] = config.bits_per_sample;
    out[5] = config.channel_mode.as_byte();
    out
}

/// Decode an audio configuration
pub fn decode_audio_config(bytes: &[u8]) -> Result<AudioConfig> {
    if bytes.len() < AUDIO_CONFIG_LEN {
        return Err(Error::Protocol(format!(
            "audio config needs {} bytes, got {}",
            AUDIO_CONFIG_LEN,
            bytes.len()
        )));
    }

    let sample_rate = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if sample_rate == 0 {
        return Err(Error::Protocol("zero sample rate".to_string()));
    }
    let channel_mode = ChannelMode::from_byte(bytes[5])
        .ok_or_else(|| Error::Protocol(format!("invalid channel mode {}", bytes[5])))?;

    Ok(AudioConfig {
        sample_rate,
        bits_per_sample: bytes[4],
        channel_mode,
    })
}

/// Playback position reported by `GetPresentationPosition`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresentationPosition {
    /// Bytes moved through the data channel
    pub bytes: u64,
    /// Reported sink delay in 1/10 ms
    pub delay: u16,
    /// Microseconds on the stream clock when sampled
    pub timestamp_us: u64,
}

impl PresentationPosition {
    /// Encode as u64 bytes, u16 delay, u64 timestamp
    pub fn encode(&self) -> [u8; POSITION_LEN] {
        let mut out = [0u8; POSITION_LEN];
        out[..8].copy_from_slice(&self.bytes.to_le_bytes());
        out[8..10].copy_from_slice(&self.delay.to_le_bytes());
        out[10..].copy_from_slice(&self.timestamp_us.to_le_bytes());
        out
    }

    /// Decode a position payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < POSITION_LEN {
            return Err(Error::Protocol(format!(
                "position needs {} bytes, got {}",
                POSITION_LEN,
                bytes.len()
            )));
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let total = u64::from_le_bytes(word);
        let delay = u16::from_le_bytes([bytes[8], bytes[9]]);
        word.copy_from_slice(&bytes[10..18]);
        let timestamp_us = u64::from_le_bytes(word);

        Ok(Self {
            bytes: total,
            delay,
            timestamp_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for code in CommandCode::ALL {
            assert_eq!(CommandCode::from_byte(code.as_byte()), Some(code));
        }
        assert_eq!(CommandCode::from_byte(0), None);
        assert_eq!(CommandCode::from_byte(10), None);
        assert_eq!(CommandCode::Start.as_byte(), 2);
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(AckCode::Success.as_byte(), 0);
        assert_eq!(AckCode::DisconnectInProgress.as_byte(), 5);
        assert_eq!(AckCode::from_byte(2), Some(AckCode::InCallFailure));
        assert_eq!(AckCode::from_byte(6), None);
    }

    #[test]
    fn test_audio_config_layout() {
        let config = AudioConfig {
            sample_rate: 44100,
            bits_per_sample: 16,
            channel_mode: ChannelMode::Mono,
        };
        let bytes = encode_audio_config(&config);
        assert_eq!(bytes, [0x44, 0xAC, 0x00, 0x00, 16, 1]);
        assert_eq!(decode_audio_config(&bytes).unwrap(), config);
    }

    #[test]
    fn test_audio_config_rejects_bad_input() {
        assert!(decode_audio_config(&[0x44, 0xAC, 0, 0, 16]).is_err());
        assert!(decode_audio_config(&[0, 0, 0, 0, 16, 2]).is_err());
        assert!(decode_audio_config(&[0x44, 0xAC, 0, 0, 16, 7]).is_err());
    }

    #[test]
    fn test_decode_commands() {
        assert_eq!(ControlCommand::decode(2, &[]), ControlCommand::Start);
        assert_eq!(ControlCommand::decode(0xEE, &[]), ControlCommand::Unknown(0xEE));
        assert_eq!(
            ControlCommand::decode(7, &[1, 2]),
            ControlCommand::Malformed(CommandCode::SetOutputAudioConfig)
        );

        let set = ControlCommand::SetOutputAudioConfig(AudioConfig::default());
        let wire = set.encode();
        assert_eq!(wire.len(), 1 + AUDIO_CONFIG_LEN);
        assert_eq!(ControlCommand::decode(wire[0], &wire[1..]), set);
    }

    #[test]
    fn test_position_layout() {
        let position = PresentationPosition {
            bytes: 0x0102,
            delay: 1500,
            timestamp_us: 7,
        };
        let bytes = position.encode();
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(&bytes[8..10], &1500u16.to_le_bytes());
        assert_eq!(bytes[10], 7);
        assert_eq!(PresentationPosition::decode(&bytes).unwrap(), position);
        assert!(PresentationPosition::decode(&bytes[..10]).is_err());
    }
}
