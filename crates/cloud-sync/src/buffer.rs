//! In-memory sample buffer

use obd_protocol::TelemetrySample;
use tracing::warn;

/// Samples waiting for the next upload
#[derive(Debug)]
pub struct TelemetryBuffer {
    samples: Vec<TelemetrySample>,
    ceiling: usize,
}

impl TelemetryBuffer {
    pub fn new(ceiling: usize) -> Self {
        Self {
            samples: Vec::new(),
            ceiling: ceiling.max(1),
        }
    }

    /// Append a sample. A full buffer is cleared first; returns the number
    /// of samples discarded that way.
    pub fn push(&mut self, sample: TelemetrySample) -> usize {
        let mut discarded = 0;
        if self.samples.len() >= self.ceiling {
            discarded = self.samples.len();
            warn!("Telemetry buffer reached {} samples, discarding", discarded);
            self.samples.clear();
        }
        self.samples.push(sample);
        discarded
    }

    pub fn take(&mut self) -> Vec<TelemetrySample> {
        std::mem::take(&mut self.samples)
    }

    /// Put samples back ahead of anything buffered since they were taken
    pub fn restore(&mut self, mut samples: Vec<TelemetrySample>) {
        samples.append(&mut self.samples);
        self.samples = samples;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
