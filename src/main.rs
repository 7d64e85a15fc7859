// ABOUTME: Control channel client
// ABOUTME: Sends one command to a running link daemon and prints the ack and any payload

use a2dp_link::control::{
    decode_audio_config, AckCode, CommandCode, ControlCommand, PresentationPosition,
};
use a2dp_link::streaming::{AudioConfig, ChannelMode};
use a2dp_link::ServiceConfig;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[command(name = "a2dp-ctl")]
#[command(author, version, about = "Send a control command to a2dp-linkd", long_about = None)]
struct Args {
    /// Control socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Seconds to wait for the ack
    #[arg(short, long, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask whether a peer is ready to stream
    CheckReady,
    /// Start streaming
    Start,
    /// Stop streaming
    Stop,
    /// Suspend streaming
    Suspend,
    /// Print the input audio configuration
    GetInputConfig,
    /// Print the output audio configuration
    GetOutputConfig,
    /// Replace the output audio configuration
    SetOutputConfig {
        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,
        /// Bits per sample
        #[arg(long, default_value = "16")]
        bits: u8,
        /// Channel count (1 or 2)
        #[arg(long, default_value = "2")]
        channels: u8,
    },
    /// Start the hardware offload path
    OffloadStart,
    /// Print bytes transferred, delay and timestamp
    GetPosition,
}

impl Command {
    fn to_control(&self) -> Result<ControlCommand, String> {
        let command = match self {
            Command::CheckReady => ControlCommand::CheckReady,
            Command::Start => ControlCommand::Start,
            Command::Stop => ControlCommand::Stop,
            Command::Suspend => ControlCommand::Suspend,
            Command::GetInputConfig => ControlCommand::GetInputAudioConfig,
            Command::GetOutputConfig => ControlCommand::GetOutputAudioConfig,
            Command::SetOutputConfig {
                sample_rate,
                bits,
                channels,
            } => {
                let channel_mode = ChannelMode::from_byte(*channels)
                    .ok_or_else(|| format!("unsupported channel count {}", channels))?;
                ControlCommand::SetOutputAudioConfig(AudioConfig {
                    sample_rate: *sample_rate,
                    bits_per_sample: *bits,
                    channel_mode,
                })
            }
            Command::OffloadStart => ControlCommand::OffloadStart,
            Command::GetPosition => ControlCommand::GetPresentationPosition,
        };
        Ok(command)
    }
}

async fn exchange(
    socket: &Path,
    command: ControlCommand,
) -> Result<(AckCode, Vec<u8>), Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(socket).await?;
    stream.write_all(&command.encode()).await?;

    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await?;
    let ack = AckCode::from_byte(ack[0]).ok_or_else(|| format!("unknown ack code {}", ack[0]))?;

    let reply_len = CommandCode::from_byte(command.code())
        .map(|c| c.reply_payload_len())
        .unwrap_or(0);
    let mut payload = vec![0u8; if ack == AckCode::Success { reply_len } else { 0 }];
    stream.read_exact(&mut payload).await?;

    Ok((ack, payload))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| ServiceConfig::default().control_path);
    let command = args.command.to_control()?;

    println!("Sending {:?} to {}", command, socket.display());

    let (ack, payload) = tokio::time::timeout(
        Duration::from_secs(args.timeout),
        exchange(&socket, command),
    )
    .await
    .map_err(|_| format!("no ack within {} s", args.timeout))??;

    println!("Ack: {} ({})", ack, ack.as_byte());

    match command {
        ControlCommand::GetInputAudioConfig | ControlCommand::GetOutputAudioConfig
            if !payload.is_empty() =>
        {
            let config = decode_audio_config(&payload)?;
            println!(
                "  {} Hz, {} bit, {:?}",
                config.sample_rate, config.bits_per_sample, config.channel_mode
            );
        }
        ControlCommand::GetPresentationPosition if !payload.is_empty() => {
            let position = PresentationPosition::decode(&payload)?;
            println!(
                "  {} bytes, delay {} (1/10 ms), at {} us",
                position.bytes, position.delay, position.timestamp_us
            );
        }
        _ => {}
    }

    if ack != AckCode::Success {
        std::process::exit(1);
    }
    Ok(())
}
