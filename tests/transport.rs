// ABOUTME: Integration tests for the multiplexed socket transport
// ABOUTME: Exercises client replacement, inbound reads and full shutdown over real Unix sockets

use a2dp_link::transport::{
    ChannelEvent, ChannelId, ChannelListener, ChannelOption, ChannelState, ChannelTarget,
    Transport, AUDIO_CHANNEL, CONTROL_CHANNEL,
};
use parking_lot::Mutex;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ChannelEvent>>,
}

impl Recorder {
    fn wait_for(&self, count: usize) -> Vec<ChannelEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let events = self.events.lock().clone();
            if events.len() >= count {
                return events;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.events.lock().clone()
    }
}

impl ChannelListener for Recorder {
    fn on_opened(&self, _channel: ChannelId) {
        self.events.lock().push(ChannelEvent::Opened);
    }

    fn on_closed(&self, _channel: ChannelId) {
        self.events.lock().push(ChannelEvent::Closed);
    }

    fn on_data_ready(&self, _channel: ChannelId) {
        self.events.lock().push(ChannelEvent::InboundDataReady);
    }
}

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("a2dp-it-{}-{}", std::process::id(), name))
}

fn wait_state(transport: &Transport, channel: ChannelId, state: ChannelState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if transport.state(channel) == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_second_client_replaces_first() {
    let transport = Transport::new();
    let recorder = Arc::new(Recorder::default());
    let path = socket_path("replace");
    assert!(transport.open(CONTROL_CHANNEL, recorder.clone(), &path));

    let _first = UnixStream::connect(&path).unwrap();
    assert_eq!(recorder.wait_for(1), vec![ChannelEvent::Opened]);

    let _second = UnixStream::connect(&path).unwrap();
    assert_eq!(
        recorder.wait_for(3),
        vec![ChannelEvent::Opened, ChannelEvent::Closed, ChannelEvent::Opened]
    );
    assert_eq!(transport.state(CONTROL_CHANNEL), ChannelState::Connected);

    transport.close(ChannelTarget::All);
}

#[test]
fn test_inbound_bytes_are_readable() {
    let transport = Transport::new();
    let recorder = Arc::new(Recorder::default());
    let path = socket_path("inbound");
    assert!(transport.open(AUDIO_CHANNEL, recorder.clone(), &path));
    transport.configure(
        AUDIO_CHANNEL,
        ChannelOption::SetReadPollTimeout(Duration::from_millis(500)),
    );

    let mut client = UnixStream::connect(&path).unwrap();
    assert!(wait_state(&transport, AUDIO_CHANNEL, ChannelState::Connected));
    client.write_all(&[1, 2, 3, 4]).unwrap();

    let mut buf = [0u8; 8];
    let mut received = Vec::new();
    while received.len() < 4 {
        let n = transport.read(AUDIO_CHANNEL, &mut buf);
        assert!(n > 0, "read timed out after {} bytes", received.len());
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, vec![1, 2, 3, 4]);
    assert!(recorder
        .wait_for(2)
        .contains(&ChannelEvent::InboundDataReady));

    transport.close(ChannelTarget::All);
}

#[test]
fn test_close_all_releases_everything() {
    let transport = Transport::new();
    let recorder = Arc::new(Recorder::default());
    let control = socket_path("all-ctrl");
    let data = socket_path("all-data");
    assert!(transport.open(CONTROL_CHANNEL, recorder.clone(), &control));
    assert!(transport.open(AUDIO_CHANNEL, recorder.clone(), &data));

    let _client = UnixStream::connect(&control).unwrap();
    assert!(wait_state(&transport, CONTROL_CHANNEL, ChannelState::Connected));

    transport.close(ChannelTarget::All);

    assert_eq!(transport.state(CONTROL_CHANNEL), ChannelState::Disconnected);
    assert_eq!(transport.state(AUDIO_CHANNEL), ChannelState::Disconnected);
    assert!(!control.exists());
    assert!(!data.exists());
    assert!(!transport.send(CONTROL_CHANNEL, &[0]));

    // Channels can be reopened after a full close
    assert!(transport.open(CONTROL_CHANNEL, recorder, &control));
    transport.close(ChannelTarget::All);
}
