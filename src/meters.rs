//! Thread-safe metering for the processing thread.
//!
//! Atomic cells shared between the processing thread (single writer) and any
//! observer without locks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Default)]
pub struct Meters {
    input_peak: AtomicU32,
    output_peak: AtomicU32,
    ein_db_spl: AtomicU32,
    frames_processed: AtomicU64,
    neural_failures: AtomicU64,
    short_reads: AtomicU64,
    dropped_output_samples: AtomicU64,
    guarded_panics: AtomicU64,
}

impl Meters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every cell. Called at session start.
    pub fn reset(&self) {
        for cell in [&self.input_peak, &self.output_peak, &self.ein_db_spl] {
            cell.store(0.0f32.to_bits(), Ordering::Relaxed);
        }
        for counter in [
            &self.frames_processed,
            &self.neural_failures,
            &self.short_reads,
            &self.dropped_output_samples,
            &self.guarded_panics,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn set_input_peak(&self, val: f32) {
        self.input_peak.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn set_output_peak(&self, val: f32) {
        self.output_peak.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn set_ein_db_spl(&self, val: f32) {
        self.ein_db_spl.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn add_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_neural_failure(&self) {
        self.neural_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped_output(&self, samples: usize) {
        self.dropped_output_samples
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn add_guarded_panic(&self) {
        self.guarded_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_input_peak(&self) -> f32 {
        f32::from_bits(self.input_peak.load(Ordering::Relaxed))
    }

    pub fn get_output_peak(&self) -> f32 {
        f32::from_bits(self.output_peak.load(Ordering::Relaxed))
    }

    /// Rolling equivalent input noise estimate (dB SPL).
    pub fn get_ein_db_spl(&self) -> f32 {
        f32::from_bits(self.ein_db_spl.load(Ordering::Relaxed))
    }

    pub fn get_frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn get_neural_failures(&self) -> u64 {
        self.neural_failures.load(Ordering::Relaxed)
    }

    pub fn get_short_reads(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }

    pub fn get_dropped_output_samples(&self) -> u64 {
        self.dropped_output_samples.load(Ordering::Relaxed)
    }

    pub fn get_guarded_panics(&self) -> u64 {
        self.guarded_panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_counters() {
        let meters = Meters::new();
        meters.set_output_peak(0.7);
        meters.add_frame();
        meters.add_dropped_output(12);
        assert_eq!(meters.get_dropped_output_samples(), 12);
        meters.reset();
        assert_eq!(meters.get_output_peak(), 0.0);
        assert_eq!(meters.get_frames_processed(), 0);
        assert_eq!(meters.get_dropped_output_samples(), 0);
    }
}
