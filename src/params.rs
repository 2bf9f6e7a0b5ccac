//! Live enhancement parameters shared between the controller and the
//! processing thread.
//!
//! Each field lives in its own atomic cell. Setters clamp before storing, so
//! a reader can never observe an out-of-range value. The processing thread
//! takes one [`ParamSnapshot`] at the top of each frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::ParameterDefaults;
use crate::dsp::gain::{
    gain_db_for_level, linear_gain_for_db, MAX_ENHANCEMENT_LEVEL, MIN_ENHANCEMENT_LEVEL,
};

struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(val: f32) -> Self {
        Self(AtomicU32::new(val.to_bits()))
    }

    #[inline]
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    fn store(&self, val: f32) {
        self.0.store(val.to_bits(), Ordering::Relaxed);
    }
}

/// Clamp that also maps NaN onto the lower bound.
#[inline]
fn clamp_param(val: f32, min: f32, max: f32) -> f32 {
    if val.is_nan() {
        min
    } else {
        val.clamp(min, max)
    }
}

/// Values used for one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamSnapshot {
    pub gain_db: f32,
    pub linear_gain: f32,
    pub voice_level: f32,
    pub clarity: f32,
    pub noise_reduction: bool,
}

pub struct EnhancementParameters {
    enhancement_level: AtomicF32,
    voice_level: AtomicF32,
    clarity: AtomicF32,
    noise_reduction: AtomicBool,
}

impl Default for EnhancementParameters {
    fn default() -> Self {
        Self::from_defaults(&ParameterDefaults::default())
    }
}

impl EnhancementParameters {
    pub fn from_defaults(defaults: &ParameterDefaults) -> Self {
        let params = Self {
            enhancement_level: AtomicF32::new(MIN_ENHANCEMENT_LEVEL),
            voice_level: AtomicF32::new(0.0),
            clarity: AtomicF32::new(0.0),
            noise_reduction: AtomicBool::new(defaults.noise_reduction),
        };
        params.set_enhancement_level(defaults.enhancement_level);
        params.set_voice_level(defaults.voice_level);
        params.set_clarity(defaults.clarity);
        params
    }

    pub fn set_enhancement_level(&self, level: f32) {
        self.enhancement_level.store(clamp_param(
            level,
            MIN_ENHANCEMENT_LEVEL,
            MAX_ENHANCEMENT_LEVEL,
        ));
    }

    pub fn set_voice_level(&self, level: f32) {
        self.voice_level.store(clamp_param(level, 0.0, 1.0));
    }

    pub fn set_clarity(&self, level: f32) {
        self.clarity.store(clamp_param(level, 0.0, 1.0));
    }

    pub fn set_noise_reduction(&self, enabled: bool) {
        self.noise_reduction.store(enabled, Ordering::Relaxed);
    }

    pub fn enhancement_level(&self) -> f32 {
        self.enhancement_level.load()
    }

    pub fn voice_level(&self) -> f32 {
        self.voice_level.load()
    }

    pub fn clarity(&self) -> f32 {
        self.clarity.load()
    }

    pub fn noise_reduction(&self) -> bool {
        self.noise_reduction.load(Ordering::Relaxed)
    }

    /// Target output gain for the current enhancement level.
    pub fn gain_db(&self) -> f32 {
        gain_db_for_level(self.enhancement_level())
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        let gain_db = self.gain_db();
        ParamSnapshot {
            gain_db,
            linear_gain: linear_gain_for_db(gain_db),
            voice_level: self.voice_level(),
            clarity: self.clarity(),
            noise_reduction: self.noise_reduction(),
        }
    }
}
