// ABOUTME: Control protocol spoken with the local audio subsystem
// ABOUTME: Wire codes plus the handler that turns commands into peer requests and acks

mod handler;
mod protocol;

pub use handler::{ControlChannel, ControlContext, ControlHandler, TransportControl, MAX_DEFERRED};
pub use protocol::{
    decode_audio_config, encode_audio_config, AckCode, CommandCode, ControlCommand,
    PresentationPosition, AUDIO_CONFIG_LEN, POSITION_LEN,
};
