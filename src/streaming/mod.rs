// ABOUTME: Streaming module: frame queue, codec seam and the streaming engine
// ABOUTME: Re-exports the types the service and external codec providers use

mod clock;
mod codec;
mod engine;
mod queue;
mod source;

pub use clock::StreamClock;
pub use codec::{
    AudioConfig, ChannelMode, CodecConfig, CodecError, CodecProvider, PcmCodec, PeerParams,
};
pub use engine::{
    SessionDirectory, SessionStats, SharedCodec, SinkInbound, StreamingEngine,
    DEFAULT_SINK_QUEUE, DEFAULT_SOURCE_QUEUE,
};
pub use queue::{EnqueueOutcome, Frame, FrameQueue, OverflowPolicy, QueueCounters};
pub use source::{CountingSink, PcmSink, PcmSource, SilenceSource, ToneSource};
