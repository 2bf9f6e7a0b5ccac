//! Gain & Distortion Controller
//!
//! Maps the user-facing enhancement level onto a bounded acoustic gain and
//! applies it with a soft-saturation knee above 0.8 so peaks are rounded off
//! instead of hard-clipped.
//!
//! # Distortion contract
//! A sine whose gained peak stays at or below [`THD_SAFE_PEAK`] comes out
//! under [`MAX_THD_PERCENT`]. Past that the curve keeps rising toward unit
//! magnitude and overload distortion grows like any limiter's.
//!
//! # Gain mapping
//! `dB = 40 + level * 15`, clamped to the [40, 70] dB window. The linear
//! multiplier is taken relative to the window floor, so 40 dB is unity gain on
//! the normalised signal.

use crate::dsp::utils::db_to_gain;

/// Lower edge of the output gain window (dB).
pub const MIN_GAIN_DB: f32 = 40.0;
/// Upper edge of the output gain window (dB).
pub const MAX_GAIN_DB: f32 = 70.0;
/// dB added per unit of enhancement level.
pub const GAIN_DB_PER_LEVEL: f32 = 15.0;
/// Enhancement level range accepted by the setter.
pub const MIN_ENHANCEMENT_LEVEL: f32 = 0.0;
pub const MAX_ENHANCEMENT_LEVEL: f32 = 2.0;
/// Declared harmonic distortion ceiling (%).
pub const MAX_THD_PERCENT: f32 = 9.5;

/// Largest gained sine peak for which the THD ceiling holds.
pub const THD_SAFE_PEAK: f32 = 1.2;

// Magnitude where saturation starts.
const KNEE_START: f32 = 0.8;
// Headroom between the knee and unit magnitude.
const KNEE_HEADROOM: f32 = 1.0 - KNEE_START;

/// Target gain in dB for an enhancement level.
pub fn gain_db_for_level(level: f32) -> f32 {
    let level = level.clamp(MIN_ENHANCEMENT_LEVEL, MAX_ENHANCEMENT_LEVEL);
    (MIN_GAIN_DB + level * GAIN_DB_PER_LEVEL).clamp(MIN_GAIN_DB, MAX_GAIN_DB)
}

/// Linear multiplier for a gain expressed inside the dB window.
pub fn linear_gain_for_db(gain_db: f32) -> f32 {
    db_to_gain(gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB) - MIN_GAIN_DB)
}

/// Soft saturation for one already-gained sample.
///
/// Below the knee the sample is untouched. Above it the excess is squeezed
/// into the remaining headroom with `0.8 + 0.2 * tanh((|x| - 0.8) / 0.2)`.
/// Slope is 1 at the knee, the curve is strictly increasing and it never
/// reaches past unit magnitude.
#[inline]
pub fn soft_saturate(x: f32) -> f32 {
    let mag = x.abs();
    if mag <= KNEE_START {
        return x;
    }
    x.signum() * (KNEE_START + KNEE_HEADROOM * ((mag - KNEE_START) / KNEE_HEADROOM).tanh())
}

/// Stateless per-frame gain stage.
#[derive(Clone, Copy, Debug)]
pub struct GainController {
    linear_gain: f32,
}

impl GainController {
    pub fn new(linear_gain: f32) -> Self {
        Self { linear_gain }
    }

    pub fn for_level(level: f32) -> Self {
        Self::new(linear_gain_for_db(gain_db_for_level(level)))
    }

    pub fn set_linear_gain(&mut self, linear_gain: f32) {
        self.linear_gain = linear_gain;
    }

    pub fn linear_gain(&self) -> f32 {
        self.linear_gain
    }

    pub fn process(&self, frame: &mut [f32]) {
        for s in frame.iter_mut() {
            *s = soft_saturate(*s * self.linear_gain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::analysis::total_harmonic_distortion;
    use std::f32::consts::PI;

    #[test]
    fn test_gain_window_holds_for_all_levels() {
        for i in 0..=200 {
            let level = i as f32 / 100.0;
            let db = gain_db_for_level(level);
            assert!((MIN_GAIN_DB..=MAX_GAIN_DB).contains(&db), "level {level} -> {db} dB");
        }
    }

    #[test]
    fn test_out_of_range_levels_clamp() {
        assert_eq!(gain_db_for_level(100.0), MAX_GAIN_DB);
        assert_eq!(gain_db_for_level(-3.0), MIN_GAIN_DB);
        assert!((linear_gain_for_db(MIN_GAIN_DB) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_saturation_is_continuous_at_knee() {
        let below = soft_saturate(0.8);
        let above = soft_saturate(0.800_01);
        assert!((below - above).abs() < 1e-3);
        assert!((soft_saturate(-0.8) + below).abs() < 1e-6);
    }

    #[test]
    fn test_output_never_exceeds_unit_magnitude() {
        let gain = GainController::for_level(2.0);
        let mut frame: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.01).sin()).collect();
        gain.process(&mut frame);
        for v in &frame {
            assert!(v.abs() <= 1.0 + 1e-6);
        }
    }

    fn gained_sine(peak: f32) -> Vec<f32> {
        let n = 4096;
        let bin = 93;
        (0..n)
            .map(|i| soft_saturate(peak * (2.0 * PI * bin as f32 * i as f32 / n as f32).sin()))
            .collect()
    }

    #[test]
    fn test_sine_thd_stays_under_ceiling() {
        let n = 4096;
        let bin = 93;
        for &level in &[0.0, 0.5, 1.0, 1.5, 2.0] {
            let gain = GainController::for_level(level);
            let mut frame: Vec<f32> = (0..n)
                .map(|i| 0.02 * (2.0 * PI * bin as f32 * i as f32 / n as f32).sin())
                .collect();
            gain.process(&mut frame);
            let thd = total_harmonic_distortion(&frame);
            assert!(thd < MAX_THD_PERCENT, "level {level}: THD {thd}%");
        }
    }

    #[test]
    fn test_thd_ceiling_holds_through_the_knee() {
        for &peak in &[0.9, 1.0, THD_SAFE_PEAK] {
            let out = gained_sine(peak);
            let thd = total_harmonic_distortion(&out);
            assert!(thd < MAX_THD_PERCENT, "gained peak {peak}: THD {thd}%");
        }
    }

    #[test]
    fn test_overload_is_rounded_not_folded() {
        let out = gained_sine(1.5);
        let peak = out.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(peak > 0.99 && peak <= 1.0, "peak {peak}");
        assert!(soft_saturate(1.0) > soft_saturate(0.9));
    }

    #[test]
    fn test_saturation_is_monotonic_and_bounded() {
        let mut prev = 0.0f32;
        for i in 1..=400 {
            let x = i as f32 * 0.01;
            let y = soft_saturate(x);
            assert!(y >= prev, "curve folds back at {x}");
            assert!(y <= 1.0);
            prev = y;
        }
    }
}
