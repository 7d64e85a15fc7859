// ABOUTME: Integration tests for streaming session teardown
// ABOUTME: Verifies stop waits for an in-flight codec tick before releasing the codec

use a2dp_link::peer::{PeerAddress, Role};
use a2dp_link::streaming::{
    AudioConfig, CodecConfig, CodecError, CodecProvider, Frame, PeerParams, StreamingEngine,
};
use a2dp_link::transport::{Transport, AUDIO_CHANNEL};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Codec whose first tick blocks until the test opens the gate
struct GatedCodec {
    interval_ms: u64,
    first: bool,
    entered: Sender<()>,
    gate: Receiver<()>,
    finished: Arc<AtomicBool>,
    cleanups: Arc<AtomicUsize>,
}

impl CodecProvider for GatedCodec {
    fn name(&self) -> &str {
        "gated"
    }

    fn init(&mut self, _peer: &PeerParams, config: &CodecConfig) -> Result<(), CodecError> {
        self.interval_ms = config.interval_ms;
        Ok(())
    }

    fn encode_tick(&mut self, _now: Instant, _out: &mut Vec<Frame>) -> Result<usize, CodecError> {
        if self.first {
            self.first = false;
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            self.finished.store(true, Ordering::SeqCst);
        }
        Ok(0)
    }

    fn decode(&mut self, _frame: &Frame) -> Result<(), CodecError> {
        Ok(())
    }

    fn feeding_reset(&mut self) {}

    fn feeding_flush(&mut self) {}

    fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn max_frame_bytes(&self) -> usize {
        0
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn peer() -> PeerParams {
    let _ = env_logger::builder().is_test(true).try_init();
    PeerParams {
        address: PeerAddress::new([7; 6]),
        is_edr: false,
        supports_3mbps: false,
    }
}

#[test]
fn test_stop_waits_for_tick_in_progress() {
    let (entered_tx, entered_rx) = channel::bounded(1);
    let (gate_tx, gate_rx) = channel::bounded(1);
    let finished = Arc::new(AtomicBool::new(false));
    let cleanups = Arc::new(AtomicUsize::new(0));

    let mut engine = StreamingEngine::new(Arc::new(Transport::new()), AUDIO_CHANNEL);
    engine.register_codec(
        Role::Source,
        Box::new(GatedCodec {
            interval_ms: 0,
            first: true,
            entered: entered_tx,
            gate: gate_rx,
            finished: finished.clone(),
            cleanups: cleanups.clone(),
        }),
    );

    let config = CodecConfig {
        audio: AudioConfig::default(),
        interval_ms: 5,
    };
    engine.start_session(Role::Source, &peer(), &config).unwrap();
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first tick never ran");

    let (done_tx, done_rx) = channel::bounded(1);
    let flag = finished.clone();
    let stopper = std::thread::spawn(move || {
        engine.stop_session(Role::Source);
        let _ = done_tx.send(flag.load(Ordering::SeqCst));
        engine
    });

    assert!(
        done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "stop returned while a tick was still running"
    );
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);

    gate_tx.send(()).unwrap();
    let finished_at_return = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(finished_at_return);

    let engine = stopper.join().unwrap();
    assert!(!engine.has_session(Role::Source));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_without_session_is_noop() {
    let mut engine = StreamingEngine::new(Arc::new(Transport::new()), AUDIO_CHANNEL);
    engine.stop_session(Role::Source);
    engine.stop_all();
    assert!(!engine.has_session(Role::Source));
    assert!(engine.session_stats(Role::Sink).is_none());
}
