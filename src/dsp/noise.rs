//! Noise Floor Estimator & Suppressor
//!
//! Two stages share this module:
//!
//! - [`NoiseSuppressor`] tracks a per-sample noise profile on frames that look
//!   like noise only, keeps a short history of their levels in dB SPL and
//!   derives the equivalent input noise (EIN) from it. While the EIN sits
//!   above the ceiling, a Wiener-style gain scaled down by the excess is
//!   applied to every sample.
//! - [`AdaptiveSubtractor`] is the level-adaptive cleanup used on the classical
//!   path. It estimates the instantaneous noise floor from the quietest of 16
//!   sub-windows and attenuates samples that sit close to it.
//!
//! Every division is guarded by an energy floor, so neither stage can fail.

use crate::config::NoiseConfig;
use crate::dsp::utils::{frame_rms, mean_energy, rms_to_db_spl, ENERGY_EPS};

/// Initial value of every noise profile bin.
const PROFILE_INIT: f32 = 1e-4;
/// Number of short-term energy windows per frame.
const SUB_WINDOWS: usize = 16;
/// Floor for the instantaneous noise estimate.
const SUBTRACTOR_NOISE_FLOOR: f32 = 1e-4;
// SNR tiers and the threshold scale used in each.
const SNR_HIGH: f32 = 10.0;
const SNR_MID: f32 = 5.0;
const THRESHOLD_SCALE_HIGH_SNR: f32 = 0.01;
const THRESHOLD_SCALE_MID_SNR: f32 = 0.015;
const THRESHOLD_SCALE_LOW_SNR: f32 = 0.02;
// Samples below this multiple of the threshold are attenuated.
const ATTENUATION_SPAN: f32 = 3.0;
// Gain at the bottom of the linear ramp.
const RAMP_FLOOR: f32 = 0.25;

/// Smoothed noise energy per frame position plus a ring of recent noise
/// floor levels.
pub struct NoiseProfile {
    energy: Vec<f32>,
    history: Vec<f32>,
    cursor: usize,
    ceiling_db: f32,
}

impl NoiseProfile {
    pub fn new(frame_size: usize, history_len: usize, ceiling_db: f32) -> Self {
        Self {
            energy: vec![PROFILE_INIT; frame_size],
            history: vec![ceiling_db; history_len.max(1)],
            cursor: 0,
            ceiling_db,
        }
    }

    pub fn reset(&mut self) {
        self.energy.fill(PROFILE_INIT);
        self.history.fill(self.ceiling_db);
        self.cursor = 0;
    }

    /// Fold a noise-only frame into the profile.
    pub fn update(&mut self, frame: &[f32], smoothing: f32, level_db: f32) {
        for (e, &x) in self.energy.iter_mut().zip(frame) {
            let updated = *e * smoothing + x * x * (1.0 - smoothing);
            *e = updated.max(ENERGY_EPS);
        }
        self.history[self.cursor] = level_db;
        self.cursor = (self.cursor + 1) % self.history.len();
    }

    /// Mean of the rolling noise floor history (dB SPL).
    pub fn equivalent_input_noise(&self) -> f32 {
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }

    pub fn energy(&self) -> &[f32] {
        &self.energy
    }
}

/// Outcome of one pass of the EIN suppressor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NoiseFrameReport {
    pub level_db_spl: f32,
    pub noise_only: bool,
    pub ein_db_spl: f32,
    pub extra_suppression: f32,
}

pub struct NoiseSuppressor {
    profile: NoiseProfile,
    config: NoiseConfig,
}

impl NoiseSuppressor {
    pub fn new(frame_size: usize, config: NoiseConfig) -> Self {
        Self {
            profile: NoiseProfile::new(frame_size, config.history_len, config.ein_ceiling_db_spl),
            config,
        }
    }

    pub fn reset(&mut self) {
        self.profile.reset();
    }

    pub fn profile(&self) -> &NoiseProfile {
        &self.profile
    }

    pub fn equivalent_input_noise(&self) -> f32 {
        self.profile.equivalent_input_noise()
    }

    /// A frame is noise only when no sample's energy rises above
    /// `presence_threshold` times the frame's mean energy.
    pub fn is_noise_only(&self, frame: &[f32], mean: f32) -> bool {
        let limit = self.config.presence_threshold * mean;
        !frame.iter().any(|&x| x * x > limit)
    }

    pub fn process(&mut self, frame: &mut [f32]) -> NoiseFrameReport {
        let mean = mean_energy(frame);
        let level_db = rms_to_db_spl(frame_rms(frame), self.config.reference_pressure);
        let noise_only = self.is_noise_only(frame, mean);
        if noise_only {
            self.profile.update(frame, self.config.smoothing, level_db);
        }

        let ein = self.profile.equivalent_input_noise();
        let mut extra = 0.0;
        if ein > self.config.ein_ceiling_db_spl {
            extra = ((ein - self.config.ein_ceiling_db_spl) / self.config.excess_db_per_unit)
                .min(self.config.max_extra_suppression);
            let keep = 1.0 - extra;
            for (x, &noise) in frame.iter_mut().zip(self.profile.energy()) {
                let snr = (*x * *x) / (noise + ENERGY_EPS);
                *x *= snr / (1.0 + snr) * keep;
            }
        }

        NoiseFrameReport {
            level_db_spl: level_db,
            noise_only,
            ein_db_spl: ein,
            extra_suppression: extra,
        }
    }
}

/// Short-term-energy driven attenuation of near-floor samples.
pub struct AdaptiveSubtractor {
    window_energy: [f32; SUB_WINDOWS],
}

impl Default for AdaptiveSubtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveSubtractor {
    pub fn new() -> Self {
        Self {
            window_energy: [0.0; SUB_WINDOWS],
        }
    }

    /// Dynamic threshold for a frame, or `None` when the frame carries no
    /// energy at all.
    pub fn threshold(&mut self, frame: &[f32]) -> Option<f32> {
        let window = (frame.len() / SUB_WINDOWS).max(1);
        self.window_energy.fill(0.0);
        for (slot, chunk) in self
            .window_energy
            .iter_mut()
            .zip(frame.chunks(window).take(SUB_WINDOWS))
        {
            *slot = mean_energy(chunk);
        }
        let signal = self.window_energy.iter().sum::<f32>() / SUB_WINDOWS as f32;

        let noise = self
            .window_energy
            .iter()
            .copied()
            .filter(|&e| e > 0.0)
            .fold(f32::INFINITY, f32::min);
        if !noise.is_finite() {
            return None;
        }
        let noise = noise.max(SUBTRACTOR_NOISE_FLOOR);
        let snr = signal / noise;
        let scale = if snr > SNR_HIGH {
            THRESHOLD_SCALE_HIGH_SNR
        } else if snr > SNR_MID {
            THRESHOLD_SCALE_MID_SNR
        } else {
            THRESHOLD_SCALE_LOW_SNR
        };
        Some(scale * noise.sqrt())
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        let Some(threshold) = self.threshold(frame) else {
            return;
        };
        for x in frame.iter_mut() {
            *x *= attenuation(x.abs(), threshold);
        }
    }
}

/// Gain for a sample of magnitude `mag` against `threshold`: quadratic below
/// the threshold, a linear 0.25..1.0 ramp up to three times it, unity above.
#[inline]
pub fn attenuation(mag: f32, threshold: f32) -> f32 {
    if mag >= threshold * ATTENUATION_SPAN {
        return 1.0;
    }
    if mag < threshold {
        let r = mag / threshold;
        r * r
    } else {
        let t = (mag - threshold) / (threshold * (ATTENUATION_SPAN - 1.0));
        RAMP_FLOOR + (1.0 - RAMP_FLOOR) * t
    }
}
