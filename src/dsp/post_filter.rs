//! Clarity post-filter for frames that came back from the neural path.
//!
//! Adds back mid and high band detail the model tends to smooth away. Boosts
//! shrink as the sample level rises relative to the frame RMS, so loud
//! passages pick up less extra distortion than quiet ones.

use crate::dsp::gain::MAX_THD_PERCENT;
use crate::dsp::utils::{frame_rms, hard_ceiling, RMS_FLOOR};

// Below this clarity the filter is skipped.
pub const MIN_CLARITY: f32 = 0.1;

const MID_ALPHA_BASE: f32 = 0.4;
const MID_ALPHA_PER_CLARITY: f32 = 0.1;
const HIGH_ALPHA_BASE: f32 = 0.7;
const HIGH_ALPHA_PER_CLARITY: f32 = 0.2;
// Boost per unit clarity before level adaptation.
const HIGH_BOOST_PER_CLARITY: f32 = 0.5;
const MID_BOOST_PER_CLARITY: f32 = 0.3;
// Mid boost is capped lower than high boost.
const MID_BOOST_CAP_SCALE: f32 = 0.8;
// Level sensitivity of the adaptive boost.
const HIGH_LEVEL_SENSITIVITY: f32 = 2.0;
const MID_LEVEL_SENSITIVITY: f32 = 1.5;
// Soft limiter knee and headroom above it.
const LIMIT_KNEE: f32 = 0.9;
const LIMIT_HEADROOM: f32 = 0.1;
const LIMIT_DRIVE: f32 = 5.0;
// Harmonic detail: only above this clarity and below this RMS.
const DETAIL_CLARITY: f32 = 0.7;
const DETAIL_MAX_RMS: f32 = 0.3;
const DETAIL_SCALE: f32 = 0.5;
const DETAIL_SLOPE: f32 = 0.3;
const DETAIL_MAX: f32 = 0.1;

/// Boost applied to one sample: `boost` at silence, shrinking as the sample
/// grows relative to the frame RMS (`level_ref`).
#[inline]
fn adaptive_boost(boost: f32, sample: f32, level_ref: f32, sensitivity: f32) -> f32 {
    boost / (1.0 + sample.abs() / level_ref * sensitivity)
}

#[inline]
fn soft_limit(x: f32) -> f32 {
    let mag = x.abs();
    if mag <= LIMIT_KNEE {
        return x;
    }
    x.signum() * (LIMIT_KNEE + LIMIT_HEADROOM * ((mag - LIMIT_KNEE) * LIMIT_DRIVE).tanh())
}

pub struct ClarityPostFilter {
    scratch: Vec<f32>,
}

impl ClarityPostFilter {
    pub fn new(frame_size: usize) -> Self {
        Self {
            scratch: vec![0.0; frame_size],
        }
    }

    pub fn process(&mut self, frame: &mut [f32], clarity: f32) {
        if clarity <= MIN_CLARITY || frame.len() > self.scratch.len() {
            return;
        }
        let n = frame.len();
        let rms = frame_rms(frame);
        let level_ref = rms.max(RMS_FLOOR);

        let max_boost = MAX_THD_PERCENT / 20.0;
        let high_boost = (clarity * HIGH_BOOST_PER_CLARITY).min(max_boost);
        let mid_boost = (clarity * MID_BOOST_PER_CLARITY).min(max_boost * MID_BOOST_CAP_SCALE);
        let mid_alpha = MID_ALPHA_BASE + clarity * MID_ALPHA_PER_CLARITY;
        let high_alpha = HIGH_ALPHA_BASE + clarity * HIGH_ALPHA_PER_CLARITY;

        // Band extraction reads the unfiltered input.
        let x = &mut self.scratch[..n];
        x.copy_from_slice(frame);

        for i in 0..n {
            let mid = if i >= 2 {
                mid_alpha * (x[i] - x[i - 2])
            } else {
                0.0
            };
            let high = if i >= 3 {
                high_alpha * (x[i] - 3.0 * x[i - 1] + 3.0 * x[i - 2] - x[i - 3])
            } else {
                0.0
            };
            let hb = adaptive_boost(high_boost, x[i], level_ref, HIGH_LEVEL_SENSITIVITY);
            let mb = adaptive_boost(mid_boost, x[i], level_ref, MID_LEVEL_SENSITIVITY);
            frame[i] = soft_limit(x[i] + high * hb + mid * mb);
        }

        if clarity > DETAIL_CLARITY && rms < DETAIL_MAX_RMS {
            let amount = ((clarity - DETAIL_CLARITY) * DETAIL_SLOPE).min(DETAIL_MAX);
            for i in 0..n.saturating_sub(1) {
                frame[i] += (x[i + 1] - x[i]) * DETAIL_SCALE * amount;
            }
        }

        hard_ceiling(frame);
    }
}
