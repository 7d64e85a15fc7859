// ABOUTME: PCM input and output endpoints for the built-in codec
// ABOUTME: Provides test tone and silence inputs plus a counting output

use crate::streaming::codec::AudioConfig;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for PCM inputs feeding a source-side codec
pub trait PcmSource: Send {
    /// Read the next chunk of interleaved 16-bit samples
    /// Returns None when the source is exhausted
    fn read_chunk(&mut self, format: &AudioConfig, samples_per_channel: usize) -> Option<Vec<i16>>;

    /// Check if the source is exhausted
    fn is_exhausted(&self) -> bool;

    /// Reset the source to its initial state (if supported)
    fn reset(&mut self) {}
}

/// Trait for PCM outputs receiving decoded audio on the sink side
pub trait PcmSink: Send {
    /// Accept a block of interleaved 16-bit samples
    fn write(&mut self, samples: &[i16]);

    /// Drop anything buffered
    fn flush(&mut self) {}
}

/// Test tone source (generates a sine wave on every channel)
pub struct ToneSource {
    frequency: f64,
    phase: f64,
    amplitude: f64,
}

impl ToneSource {
    /// Create a new test tone source
    ///
    /// # Arguments
    /// * `frequency` - Tone frequency in Hz (e.g., 440.0 for A4)
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            phase: 0.0,
            // Use 50% amplitude to avoid clipping
            amplitude: 0.5 * f64::from(i16::MAX),
        }
    }

    /// Set the amplitude (0.0 to 1.0)
    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0) * f64::from(i16::MAX);
        self
    }
}

impl PcmSource for ToneSource {
    fn read_chunk(&mut self, format: &AudioConfig, samples_per_channel: usize) -> Option<Vec<i16>> {
        let channels = format.channel_mode.channels() as usize;
        let mut samples = Vec::with_capacity(samples_per_channel * channels);

        let phase_increment = 2.0 * PI * self.frequency / f64::from(format.sample_rate.max(1));

        for _ in 0..samples_per_channel {
            let value = (self.phase.sin() * self.amplitude) as i16;
            for _ in 0..channels {
                samples.push(value);
            }

            self.phase += phase_increment;
            if self.phase >= 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }

        Some(samples)
    }

    fn is_exhausted(&self) -> bool {
        false // Test tone never exhausts
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// Silence source
#[derive(Debug, Default)]
pub struct SilenceSource;

impl PcmSource for SilenceSource {
    fn read_chunk(&mut self, format: &AudioConfig, samples_per_channel: usize) -> Option<Vec<i16>> {
        Some(vec![0; samples_per_channel * format.channel_mode.channels() as usize])
    }

    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Sink that counts the samples it receives and otherwise discards them
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    samples: Arc<AtomicU64>,
}

impl CountingSink {
    /// Create a new counting sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Total samples written so far (all channels)
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl PcmSink for CountingSink {
    fn write(&mut self, samples: &[i16]) {
        self.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
    }
}
