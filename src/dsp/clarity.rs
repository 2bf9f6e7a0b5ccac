//! Multi-Band Voice Clarity Enhancer
//!
//! Splits a frame into three crude bands with short recursive filters,
//! compresses each band, re-weights them toward the mid/high region as
//! clarity rises and blends the result back over the input.
//!
//! # Bands
//! - Low: one-pole smoother `y[i] = 0.15 x[i] + 0.85 y[i-1]` (fundamental and
//!   low resonances).
//! - Mid: `0.4 (x[i] - x[i-2])` (vowel formants).
//! - High: third difference scaled by `0.25 + 0.15 clarity` (consonants), plus
//!   a fourth difference above clarity 0.6 for the top octave.
//!
//! Filter state restarts at every frame, so the overlap crossfade hides the
//! start-up transient.

use crate::dsp::compressor::BandCompressor;

// Constants for band decomposition

// Low band smoothing (input weight / feedback weight).
// Increasing LOW_ALPHA: brighter low band; decreasing: darker.
const LOW_ALPHA: f32 = 0.15;
const LOW_BETA: f32 = 0.85;
// Mid band difference gain.
const MID_ALPHA: f32 = 0.4;
// High band gain at zero clarity and its rise per unit clarity.
const HIGH_ALPHA_BASE: f32 = 0.25;
const HIGH_ALPHA_PER_CLARITY: f32 = 0.15;
// Clarity above which the fourth-difference term is added.
const ULTRA_HIGH_START: f32 = 0.6;
// Fourth-difference gain at full clarity.
const ULTRA_HIGH_ALPHA: f32 = 0.15;

// Constants for band weighting

const LOW_WEIGHT_BASE: f32 = 0.25;
const LOW_WEIGHT_PER_CLARITY: f32 = -0.1;
const MID_WEIGHT_BASE: f32 = 0.5;
const MID_WEIGHT_PER_CLARITY: f32 = 0.05;
const HIGH_WEIGHT_BASE: f32 = 0.25;
const HIGH_WEIGHT_PER_CLARITY: f32 = 0.15;
// Extra wet mix per unit clarity, relative to the voice level.
const CLARITY_MIX_BOOST: f32 = 0.2;

/// Normalised (low, mid, high) band weights for a clarity level.
pub fn band_weights(clarity: f32) -> [f32; 3] {
    let low = LOW_WEIGHT_BASE + clarity * LOW_WEIGHT_PER_CLARITY;
    let mid = MID_WEIGHT_BASE + clarity * MID_WEIGHT_PER_CLARITY;
    let high = HIGH_WEIGHT_BASE + clarity * HIGH_WEIGHT_PER_CLARITY;
    let total = low + mid + high;
    [low / total, mid / total, high / total]
}

/// Wet/dry blend ratio for the enhanced signal.
pub fn blend_ratio(voice_level: f32, clarity: f32) -> f32 {
    (voice_level + clarity * CLARITY_MIX_BOOST * voice_level).min(1.0)
}

pub struct VoiceClarityEnhancer {
    bands: [Vec<f32>; 3],
}

impl VoiceClarityEnhancer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            bands: [
                vec![0.0; frame_size],
                vec![0.0; frame_size],
                vec![0.0; frame_size],
            ],
        }
    }

    /// Band buffers from the last call, in (low, mid, high) order.
    pub fn bands(&self) -> &[Vec<f32>; 3] {
        &self.bands
    }

    fn split(&mut self, x: &[f32], clarity: f32) {
        let n = x.len();
        let [low, mid, high] = &mut self.bands;
        low.fill(0.0);
        mid.fill(0.0);
        high.fill(0.0);
        if n == 0 {
            return;
        }

        low[0] = x[0] * LOW_ALPHA;
        for i in 1..n {
            low[i] = LOW_ALPHA * x[i] + LOW_BETA * low[i - 1];
        }

        for i in 2..n {
            mid[i] = MID_ALPHA * (x[i] - x[i - 2]);
        }

        let high_alpha = HIGH_ALPHA_BASE + clarity * HIGH_ALPHA_PER_CLARITY;
        for i in 3..n {
            high[i] = high_alpha * (x[i] - 3.0 * x[i - 1] + 3.0 * x[i - 2] - x[i - 3]);
        }

        if clarity > ULTRA_HIGH_START {
            let ultra = ULTRA_HIGH_ALPHA * ((clarity - ULTRA_HIGH_START) / (1.0 - ULTRA_HIGH_START));
            for i in 4..n {
                high[i] += ultra
                    * (x[i] - 4.0 * x[i - 1] + 6.0 * x[i - 2] - 4.0 * x[i - 3] + x[i - 4]);
            }
        }
    }

    /// Enhance `frame` in place. No-op when `voice_level` is zero.
    pub fn process(&mut self, frame: &mut [f32], voice_level: f32, clarity: f32) {
        if voice_level <= 0.0 || frame.len() > self.bands[0].len() {
            return;
        }
        let n = frame.len();
        self.split(frame, clarity);

        let comp = BandCompressor::for_voice_bands(clarity);
        for band in self.bands.iter_mut() {
            comp.process(&mut band[..n]);
        }

        let weights = band_weights(clarity);
        let mix = blend_ratio(voice_level, clarity);
        let [low, mid, high] = &self.bands;
        for i in 0..n {
            let enhanced = low[i] * weights[0] + mid[i] * weights[1] + high[i] * weights[2];
            frame[i] = frame[i] * (1.0 - mix) + enhanced * mix;
        }
    }
}
