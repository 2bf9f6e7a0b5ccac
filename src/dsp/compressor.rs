//! Static band compressor
//!
//! # Perceptual Contract
//! - **Target Source**: One band (or the full-band output) of a speech frame.
//! - **Intended Effect**: Pull loud samples toward the threshold and lift
//!   quiet-but-audible samples, narrowing dynamic range so weak consonants
//!   survive next to strong vowels.
//! - **Will Not Do**:
//!   - Touch samples at or below the noise floor (they stay untouched so the
//!     floor is not raised).
//!   - Track an envelope. The curve is memoryless and applied per sample.
//!
//! # Distortion budget
//! The compression ratio applied to the voice bands is capped at
//! `MAX_THD_PERCENT / 10`, so the knee never bends harder than the declared
//! distortion ceiling allows.

use crate::dsp::gain::MAX_THD_PERCENT;

// Constants: unless marked "Must not change", these are tunable for behavior.
// Threshold for the multi-band voice compressor.
// Increasing: fewer samples compressed; decreasing: denser output.
const BAND_THRESHOLD: f32 = 0.3;
// Base ratio for the voice bands (fraction of the excess kept above threshold).
// Increasing: gentler compression; decreasing: harder compression.
const BAND_RATIO_BASE: f32 = 0.6;
// Ratio added per unit of clarity.
const BAND_RATIO_PER_CLARITY: f32 = 0.1;
// Boost slope for samples below threshold.
// Increasing: stronger lift of quiet detail; decreasing: flatter response.
const BAND_BOOST: f32 = 0.5;
// Samples at or below this magnitude are left alone.
// Must not change: shared with the neural refinement curve.
const NOISE_FLOOR: f32 = 0.01;
// Neural refinement threshold at zero clarity, and its drop per unit clarity.
const REFINE_THRESHOLD_BASE: f32 = 0.2;
const REFINE_THRESHOLD_PER_CLARITY: f32 = 0.05;
// Neural refinement ratio at zero clarity, and its drop per unit clarity.
const REFINE_RATIO_BASE: f32 = 0.7;
const REFINE_RATIO_PER_CLARITY: f32 = 0.2;
// Neural refinement boost slope at zero clarity, and its rise per unit clarity.
const REFINE_BOOST_BASE: f32 = 0.3;
const REFINE_BOOST_PER_CLARITY: f32 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BandCompressor {
    threshold: f32,
    ratio: f32,
    boost: f32,
    floor: f32,
}

impl BandCompressor {
    pub fn new(threshold: f32, ratio: f32, boost: f32) -> Self {
        Self {
            threshold,
            ratio,
            boost,
            floor: NOISE_FLOOR,
        }
    }

    /// Compressor for the three clarity bands.
    pub fn for_voice_bands(clarity: f32) -> Self {
        let ratio = (BAND_RATIO_BASE + clarity * BAND_RATIO_PER_CLARITY).min(MAX_THD_PERCENT / 10.0);
        Self::new(BAND_THRESHOLD, ratio, BAND_BOOST)
    }

    /// Full-band refinement applied after a neural pass. Higher clarity lowers
    /// the threshold and the ratio and raises the boost.
    pub fn for_neural_refinement(clarity: f32) -> Self {
        Self::new(
            REFINE_THRESHOLD_BASE - clarity * REFINE_THRESHOLD_PER_CLARITY,
            REFINE_RATIO_BASE - clarity * REFINE_RATIO_PER_CLARITY,
            REFINE_BOOST_BASE + clarity * REFINE_BOOST_PER_CLARITY,
        )
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    #[inline]
    pub fn process_sample(&self, x: f32) -> f32 {
        let mag = x.abs();
        if mag > self.threshold {
            let target = self.threshold + (mag - self.threshold) * self.ratio;
            x * (target / mag)
        } else if mag > self.floor {
            x * (1.0 + (self.threshold - mag) * self.boost)
        } else {
            x
        }
    }

    pub fn process(&self, buf: &mut [f32]) {
        for x in buf.iter_mut() {
            *x = self.process_sample(*x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loud_samples_pulled_toward_threshold() {
        let comp = BandCompressor::for_voice_bands(0.5);
        let y = comp.process_sample(0.9);
        assert!(y < 0.9 && y > comp.threshold());
        assert!((comp.process_sample(-0.9) + y).abs() < 1e-6);
    }

    #[test]
    fn test_quiet_samples_boosted_floor_untouched() {
        let comp = BandCompressor::for_voice_bands(0.0);
        assert!(comp.process_sample(0.1) > 0.1);
        assert_eq!(comp.process_sample(0.005), 0.005);
    }

    #[test]
    fn test_ratio_respects_distortion_budget() {
        for i in 0..=10 {
            let comp = BandCompressor::for_voice_bands(i as f32 / 10.0);
            assert!(comp.ratio() <= MAX_THD_PERCENT / 10.0);
        }
    }

    #[test]
    fn test_refinement_tracks_clarity() {
        let soft = BandCompressor::for_neural_refinement(0.0);
        let sharp = BandCompressor::for_neural_refinement(1.0);
        assert!(sharp.threshold() < soft.threshold());
        assert!(sharp.ratio() < soft.ratio());
    }
}
