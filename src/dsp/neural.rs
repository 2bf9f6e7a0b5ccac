//! Neural Enhancement Adapter
//!
//! Runs two sequence-model stages back to back on a gain-adjusted frame.
//! Each stage owns a pair of recurrent state tensors (`[1, 2, 128]`) that
//! persist across frames and are zeroed at session start.
//!
//! Failures never escape as panics. A failed frame is left untouched so the
//! caller can run the classical path on it instead. After `failure_limit`
//! consecutive failures the adapter disables itself for the session and
//! zeroes its state; `reset` re-arms it. A frame that fails in either stage
//! leaves both stages' state as it was before the frame.

use std::fmt;

use anyhow::Context;

use crate::config::NeuralConfig;
use crate::dsp::stage_core::LstmStage;
use crate::dsp::stage_weights::StageWeights;

/// Hidden units per recurrent state tensor.
pub const STATE_HIDDEN: usize = 128;
/// Floats in one `[1, 2, 128]` state tensor (hidden then cell).
pub const STATE_LEN: usize = 2 * STATE_HIDDEN;

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceError {
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    NonFinite,
    Backend(String),
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::ShapeMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} has {actual} elements, expected {expected}"),
            InferenceError::NonFinite => write!(f, "model produced non-finite samples"),
            InferenceError::Backend(msg) => write!(f, "inference backend error: {msg}"),
        }
    }
}

impl std::error::Error for InferenceError {}

/// One inference stage: a frame of audio plus two recurrent state tensors in,
/// an enhanced frame out. State tensors are updated in place.
pub trait StageModel: Send {
    fn frame_size(&self) -> usize;

    fn run(
        &mut self,
        audio: &[f32],
        state_a: &mut [f32],
        state_b: &mut [f32],
        output: &mut [f32],
    ) -> Result<(), InferenceError>;
}

/// Which chain a frame goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessingPath {
    Neural = 0,
    Classical = 1,
}

impl ProcessingPath {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcessingPath::Neural,
            _ => ProcessingPath::Classical,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessingPath::Neural => "neural",
            ProcessingPath::Classical => "classical",
        }
    }
}

/// Fixed arenas for both stages' state tensors. Allocated once, never resized.
pub struct RecurrentState {
    tensors: [[Box<[f32]>; 2]; 2],
}

impl Default for RecurrentState {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurrentState {
    pub fn new() -> Self {
        let zeros = || vec![0.0f32; STATE_LEN].into_boxed_slice();
        Self {
            tensors: [[zeros(), zeros()], [zeros(), zeros()]],
        }
    }

    pub fn reset(&mut self) {
        for stage in self.tensors.iter_mut() {
            for tensor in stage.iter_mut() {
                tensor.fill(0.0);
            }
        }
    }

    pub fn stage(&self, stage: usize) -> (&[f32], &[f32]) {
        let [a, b] = &self.tensors[stage];
        (&a[..], &b[..])
    }

    pub fn stage_mut(&mut self, stage: usize) -> (&mut [f32], &mut [f32]) {
        let [a, b] = &mut self.tensors[stage];
        (&mut a[..], &mut b[..])
    }

    pub fn copy_from(&mut self, other: &RecurrentState) {
        for (dst, src) in self.tensors.iter_mut().zip(other.tensors.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                d.copy_from_slice(s);
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.tensors
            .iter()
            .flat_map(|stage| stage.iter())
            .all(|t| t.iter().all(|&v| v == 0.0))
    }
}

pub struct NeuralEnhancer {
    stages: [Box<dyn StageModel>; 2],
    state: RecurrentState,
    // state before the current frame, restored when it fails
    saved: RecurrentState,
    stage1_out: Vec<f32>,
    stage2_out: Vec<f32>,
    failure_limit: u32,
    consecutive_failures: u32,
    disabled: bool,
}

impl NeuralEnhancer {
    pub fn new(
        stage1: Box<dyn StageModel>,
        stage2: Box<dyn StageModel>,
        frame_size: usize,
        failure_limit: u32,
    ) -> anyhow::Result<Self> {
        for (idx, stage) in [&stage1, &stage2].into_iter().enumerate() {
            if stage.frame_size() != frame_size {
                anyhow::bail!(
                    "stage {} expects frame size {}, engine uses {}",
                    idx + 1,
                    stage.frame_size(),
                    frame_size
                );
            }
        }
        Ok(Self {
            stages: [stage1, stage2],
            state: RecurrentState::new(),
            saved: RecurrentState::new(),
            stage1_out: vec![0.0; frame_size],
            stage2_out: vec![0.0; frame_size],
            failure_limit: failure_limit.max(1),
            consecutive_failures: 0,
            disabled: false,
        })
    }

    /// Load both native stages named in the config.
    pub fn load(config: &NeuralConfig, frame_size: usize) -> anyhow::Result<Self> {
        let (Some(path1), Some(path2)) = (&config.stage1_model, &config.stage2_model) else {
            anyhow::bail!("both stage model paths must be configured");
        };
        let stage1 = LstmStage::new(StageWeights::load(path1)?, frame_size)
            .context("stage 1 model")?;
        let stage2 = LstmStage::new(StageWeights::load(path2)?, frame_size)
            .context("stage 2 model")?;
        Self::new(
            Box::new(stage1),
            Box::new(stage2),
            frame_size,
            config.failure_limit,
        )
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn path(&self) -> ProcessingPath {
        if self.disabled {
            ProcessingPath::Classical
        } else {
            ProcessingPath::Neural
        }
    }

    pub fn state(&self) -> &RecurrentState {
        &self.state
    }

    /// Zero the recurrent state and re-arm the neural path.
    pub fn reset(&mut self) {
        self.state.reset();
        self.stage1_out.fill(0.0);
        self.stage2_out.fill(0.0);
        self.consecutive_failures = 0;
        self.disabled = false;
    }

    /// Run both stages. On success the frame holds the enhanced audio; on
    /// error it is left as it came in.
    pub fn process(&mut self, frame: &mut [f32]) -> Result<(), InferenceError> {
        if self.disabled {
            return Err(InferenceError::Backend("neural path disabled".into()));
        }
        self.saved.copy_from(&self.state);
        match self.run_stages(frame) {
            Ok(()) => {
                self.consecutive_failures = 0;
                frame.copy_from_slice(&self.stage2_out);
                Ok(())
            }
            Err(e) => {
                self.state.copy_from(&self.saved);
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_limit {
                    self.disabled = true;
                    self.state.reset();
                }
                Err(e)
            }
        }
    }

    fn run_stages(&mut self, frame: &[f32]) -> Result<(), InferenceError> {
        if frame.len() != self.stage1_out.len() {
            return Err(InferenceError::ShapeMismatch {
                what: "frame",
                expected: self.stage1_out.len(),
                actual: frame.len(),
            });
        }
        let [stage1, stage2] = &mut self.stages;
        {
            let (a, b) = self.state.stage_mut(0);
            stage1.run(frame, a, b, &mut self.stage1_out)?;
        }
        {
            let (a, b) = self.state.stage_mut(1);
            stage2.run(&self.stage1_out, a, b, &mut self.stage2_out)?;
        }
        if self.stage2_out.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_stages::{CountingStage, FailingStage};
    use super::*;

    fn counting(frame_size: usize, scale: f32) -> Box<dyn StageModel> {
        Box::new(CountingStage { frame_size, scale })
    }

    #[test]
    fn test_state_persists_across_frames() {
        let mut nn = NeuralEnhancer::new(counting(64, 1.0), counting(64, 0.5), 64, 1).unwrap();
        let mut frame = vec![0.4f32; 64];
        for _ in 0..3 {
            frame.fill(0.4);
            nn.process(&mut frame).unwrap();
        }
        assert!((frame[0] - 0.2).abs() < 1e-6);
        assert_eq!(nn.state().stage(0).0[0], 3.0);
        assert_eq!(nn.state().stage(1).0[0], 3.0);
        nn.reset();
        assert!(nn.state().is_zero());
    }

    #[test]
    fn test_failure_leaves_frame_and_disables_path() {
        let stage2 = Box::new(FailingStage {
            frame_size: 64,
            ok_calls: 1,
        });
        let mut nn = NeuralEnhancer::new(counting(64, 2.0), stage2, 64, 1).unwrap();
        let mut frame = vec![0.1f32; 64];
        nn.process(&mut frame).unwrap();
        assert_eq!(nn.path(), ProcessingPath::Neural);

        frame.fill(0.1);
        assert!(nn.process(&mut frame).is_err());
        assert!(frame.iter().all(|&v| v == 0.1));
        assert_eq!(nn.path(), ProcessingPath::Classical);
        assert!(nn.state().is_zero());
        assert!(nn.process(&mut frame).is_err());

        nn.reset();
        assert_eq!(nn.path(), ProcessingPath::Neural);
    }

    #[test]
    fn test_failure_limit_tolerates_isolated_errors() {
        let stage2 = Box::new(FailingStage {
            frame_size: 32,
            ok_calls: 0,
        });
        let mut nn = NeuralEnhancer::new(counting(32, 1.0), stage2, 32, 3).unwrap();
        let mut frame = vec![0.0f32; 32];
        assert!(nn.process(&mut frame).is_err());
        assert!(nn.process(&mut frame).is_err());
        assert!(!nn.is_disabled());
        assert!(nn.process(&mut frame).is_err());
        assert!(nn.is_disabled());
    }

    #[test]
    fn test_stage_two_failure_rolls_back_stage_one_state() {
        let stage2 = Box::new(FailingStage {
            frame_size: 32,
            ok_calls: 1,
        });
        let mut nn = NeuralEnhancer::new(counting(32, 1.0), stage2, 32, 3).unwrap();
        let mut frame = vec![0.2f32; 32];
        nn.process(&mut frame).unwrap();
        assert_eq!(nn.state().stage(0).0[0], 1.0);

        // stage 1 runs and advances its state, then stage 2 fails
        assert!(nn.process(&mut frame).is_err());
        assert!(!nn.is_disabled());
        assert_eq!(nn.state().stage(0).0[0], 1.0);
        assert!(nn.process(&mut frame).is_err());
        assert_eq!(nn.state().stage(0).0[0], 1.0);
    }

    #[test]
    fn test_non_finite_output_is_an_error() {
        let mut nn =
            NeuralEnhancer::new(counting(16, 1.0), counting(16, f32::INFINITY), 16, 1).unwrap();
        let mut frame = vec![0.5f32; 16];
        assert_eq!(nn.process(&mut frame), Err(InferenceError::NonFinite));
        assert!(frame.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_frame_size_mismatch_rejected_at_construction() {
        assert!(NeuralEnhancer::new(counting(64, 1.0), counting(32, 1.0), 64, 1).is_err());
    }

    #[test]
    fn test_load_without_paths_fails() {
        assert!(NeuralEnhancer::load(&NeuralConfig::default(), 1024).is_err());
    }

    #[test]
    fn test_load_native_stages_from_disk() {
        let dir = std::env::temp_dir().join(format!("vxhear-nn-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let blob = StageWeights::passthrough(64, STATE_HIDDEN).to_bytes();
        let p1 = dir.join("stage1.vxst");
        let p2 = dir.join("stage2.vxst");
        std::fs::write(&p1, &blob).unwrap();
        std::fs::write(&p2, &blob).unwrap();
        let config = NeuralConfig {
            stage1_model: Some(p1),
            stage2_model: Some(p2),
            failure_limit: 1,
        };
        let mut nn = NeuralEnhancer::load(&config, 64).unwrap();
        let mut frame: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).cos() * 0.3).collect();
        let before = frame.clone();
        nn.process(&mut frame).unwrap();
        for (a, b) in before.iter().zip(&frame) {
            assert!((a - b).abs() < 1e-4);
        }
        assert!(NeuralEnhancer::load(&config, 128).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
