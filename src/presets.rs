use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::params::EnhancementParameters;

// =============================================================================
// LISTENING PRESETS
// =============================================================================

/// Factory presets for common listening situations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListeningPreset {
    #[default]
    #[serde(rename = "Manual")]
    Manual,
    #[serde(rename = "Conversation")]
    Conversation,
    #[serde(rename = "Noisy Room")]
    NoisyRoom,
    #[serde(rename = "Lecture")]
    Lecture,
    #[serde(rename = "Television")]
    Television,
}

impl ListeningPreset {
    pub fn all() -> [ListeningPreset; 5] {
        [
            ListeningPreset::Manual,
            ListeningPreset::Conversation,
            ListeningPreset::NoisyRoom,
            ListeningPreset::Lecture,
            ListeningPreset::Television,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ListeningPreset::Manual => "Manual",
            ListeningPreset::Conversation => "Conversation",
            ListeningPreset::NoisyRoom => "Noisy Room",
            ListeningPreset::Lecture => "Lecture",
            ListeningPreset::Television => "Television",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ListeningPreset::Manual => "Custom settings - no preset applied",
            ListeningPreset::Conversation => "One-to-one speech in a quiet room",
            ListeningPreset::NoisyRoom => "Speech over steady background noise",
            ListeningPreset::Lecture => "Distant single talker, extra consonant detail",
            ListeningPreset::Television => "Gentle lift for broadcast audio, no noise gating",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all()
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Baked values for this preset. `Manual` has none.
    pub fn values(&self) -> Option<&'static PresetValues> {
        PRESETS.get(self.name())
    }

    /// Write this preset's values into the live parameter cells. Returns
    /// false (and leaves the cells alone) for `Manual` or a missing entry.
    pub fn apply(&self, params: &EnhancementParameters) -> bool {
        let Some(values) = self.values() else {
            return false;
        };
        params.set_enhancement_level(values.enhancement_level);
        params.set_voice_level(values.voice_level);
        params.set_clarity(values.clarity);
        params.set_noise_reduction(values.noise_reduction);
        true
    }
}

/// Parameter values for a listening preset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresetValues {
    pub enhancement_level: f32,
    pub voice_level: f32,
    pub clarity: f32,
    pub noise_reduction: bool,
}

/// Presets parsed from the baked-in JSON. A malformed file yields an empty
/// table, which leaves every preset behaving like `Manual`.
static PRESETS: Lazy<HashMap<String, PresetValues>> = Lazy::new(|| {
    let presets_str = include_str!("../presets.json");
    match serde_json::from_str::<HashMap<String, PresetValues>>(presets_str) {
        Ok(presets) => presets,
        Err(e) => {
            log::warn!("baked preset table is malformed: {e}");
            HashMap::new()
        }
    }
});
