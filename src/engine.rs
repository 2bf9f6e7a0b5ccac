//! Per-frame enhancement chain and the block wrapper around it.
//!
//! Frame order:
//! 1. Snapshot the live parameters once.
//! 2. EIN noise suppression (when noise reduction is on).
//! 3. Gain with soft saturation.
//! 4. Neural path: both stages, then the clarity post-filter and the
//!    voice refinement compressor. A failed frame drops through to 5.
//! 5. Classical path: adaptive subtraction (when noise reduction is on),
//!    then the multi-band voice clarity enhancer.
//! 6. Hard ceiling at unit magnitude.
//!
//! Everything here runs on the processing thread and allocates nothing after
//! construction.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use assert_no_alloc::permit_alloc;

use crate::config::EngineConfig;
use crate::dsp::assembler::FrameAssembler;
use crate::dsp::clarity::VoiceClarityEnhancer;
use crate::dsp::compressor::BandCompressor;
use crate::dsp::gain::GainController;
use crate::dsp::neural::{NeuralEnhancer, ProcessingPath};
use crate::dsp::noise::{AdaptiveSubtractor, NoiseFrameReport, NoiseSuppressor};
use crate::dsp::post_filter::{ClarityPostFilter, MIN_CLARITY};
use crate::dsp::utils::{hard_ceiling, peak_abs};
use crate::meters::Meters;
use crate::params::{EnhancementParameters, ParamSnapshot};
use crate::vx_log;

/// Voice level above which neural output gets the refinement compressor.
const REFINEMENT_MIN_VOICE: f32 = 0.3;

pub struct FrameProcessor {
    gain: GainController,
    suppressor: NoiseSuppressor,
    subtractor: AdaptiveSubtractor,
    neural: Option<NeuralEnhancer>,
    clarity: VoiceClarityEnhancer,
    post_filter: ClarityPostFilter,
    params: Arc<EnhancementParameters>,
    meters: Arc<Meters>,
    path: Arc<AtomicU8>,
    last_noise: NoiseFrameReport,
}

impl FrameProcessor {
    pub fn new(
        config: &EngineConfig,
        neural: Option<NeuralEnhancer>,
        params: Arc<EnhancementParameters>,
        meters: Arc<Meters>,
        path: Arc<AtomicU8>,
    ) -> Self {
        let frame_size = config.frame_size;
        let processor = Self {
            gain: GainController::new(1.0),
            suppressor: NoiseSuppressor::new(frame_size, config.noise.clone()),
            subtractor: AdaptiveSubtractor::new(),
            neural,
            clarity: VoiceClarityEnhancer::new(frame_size),
            post_filter: ClarityPostFilter::new(frame_size),
            params,
            meters,
            path,
            last_noise: NoiseFrameReport::default(),
        };
        processor.publish_path();
        processor
    }

    pub fn path(&self) -> ProcessingPath {
        match &self.neural {
            Some(nn) => nn.path(),
            None => ProcessingPath::Classical,
        }
    }

    pub fn neural(&self) -> Option<&NeuralEnhancer> {
        self.neural.as_ref()
    }

    /// Noise report of the most recent frame that ran the suppressor.
    pub fn last_noise_report(&self) -> NoiseFrameReport {
        self.last_noise
    }

    fn publish_path(&self) {
        self.path.store(self.path() as u8, Ordering::Relaxed);
    }

    /// Session start: zero the noise profile and the recurrent state.
    pub fn reset(&mut self) {
        self.suppressor.reset();
        if let Some(nn) = self.neural.as_mut() {
            nn.reset();
        }
        self.last_noise = NoiseFrameReport::default();
        self.publish_path();
    }

    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let p = self.params.snapshot();

        if p.noise_reduction {
            self.last_noise = self.suppressor.process(frame);
            self.meters.set_ein_db_spl(self.last_noise.ein_db_spl);
        }

        self.gain.set_linear_gain(p.linear_gain);
        self.gain.process(frame);

        if !self.run_neural(frame, &p) {
            self.run_classical(frame, &p);
        }

        hard_ceiling(frame);
        self.meters.set_output_peak(peak_abs(frame));
        self.meters.add_frame();
    }

    /// Returns false when the frame still needs the classical path.
    fn run_neural(&mut self, frame: &mut [f32], p: &ParamSnapshot) -> bool {
        let Some(nn) = self.neural.as_mut() else {
            return false;
        };
        if nn.is_disabled() {
            return false;
        }
        match nn.process(frame) {
            Ok(()) => {
                if p.clarity > MIN_CLARITY {
                    self.post_filter.process(frame, p.clarity);
                }
                if p.voice_level > REFINEMENT_MIN_VOICE {
                    BandCompressor::for_neural_refinement(p.clarity).process(frame);
                }
                true
            }
            Err(e) => {
                self.meters.add_neural_failure();
                vx_log!("neural frame failed: {}", e);
                if nn.is_disabled() {
                    permit_alloc(|| {
                        log::warn!("neural path disabled for this session after: {e}");
                    });
                    self.publish_path();
                }
                false
            }
        }
    }

    fn run_classical(&mut self, frame: &mut [f32], p: &ParamSnapshot) {
        if p.noise_reduction {
            self.subtractor.process(frame);
        }
        if p.voice_level > 0.0 {
            self.clarity.process(frame, p.voice_level, p.clarity);
        }
    }
}

/// Frame assembler plus frame processor: captured block in, playback block
/// out.
pub struct EnhancementEngine {
    assembler: FrameAssembler,
    processor: FrameProcessor,
    meters: Arc<Meters>,
    out: Vec<f32>,
}

impl EnhancementEngine {
    pub fn new(
        config: &EngineConfig,
        neural: Option<NeuralEnhancer>,
        params: Arc<EnhancementParameters>,
        meters: Arc<Meters>,
        path: Arc<AtomicU8>,
    ) -> Self {
        let assembler = FrameAssembler::new(config.frame_size, config.overlap);
        let out = Vec::with_capacity(assembler.max_output(config.block_size));
        Self {
            processor: FrameProcessor::new(config, neural, params, Arc::clone(&meters), path),
            assembler,
            meters,
            out,
        }
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    pub fn path(&self) -> ProcessingPath {
        self.processor.path()
    }

    /// Drop buffered input, zero the overlap tail, the noise profile and the
    /// recurrent state.
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.processor.reset();
        self.out.clear();
    }

    /// Samples produced by the last `process_block` call.
    pub fn output(&self) -> &[f32] {
        &self.out
    }

    pub fn process_block(&mut self, block: &[f32]) -> &[f32] {
        self.out.clear();
        self.meters.set_input_peak(peak_abs(block));
        let processor = &mut self.processor;
        self.assembler
            .push_block(block, &mut self.out, |frame| processor.process_frame(frame));
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::analysis::total_harmonic_distortion;
    use crate::dsp::gain::MAX_THD_PERCENT;
    use crate::dsp::neural::test_stages::{CountingStage, FailingStage};
    use crate::dsp::neural::StageModel;
    use crate::dsp::utils::frame_rms;

    fn engine_with(
        config: &EngineConfig,
        neural: Option<NeuralEnhancer>,
    ) -> (EnhancementEngine, Arc<EnhancementParameters>, Arc<Meters>) {
        let params = Arc::new(EnhancementParameters::from_defaults(&config.initial));
        let meters = Arc::new(Meters::new());
        let path = Arc::new(AtomicU8::new(ProcessingPath::Classical as u8));
        let engine = EnhancementEngine::new(
            config,
            neural,
            Arc::clone(&params),
            Arc::clone(&meters),
            path,
        );
        (engine, params, meters)
    }

    fn run(engine: &mut EnhancementEngine, input: &[f32], block: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for chunk in input.chunks(block) {
            out.extend_from_slice(engine.process_block(chunk));
        }
        out
    }

    #[test]
    fn test_sine_burst_then_silence_classical() {
        let config = EngineConfig::default();
        let (mut engine, params, meters) = engine_with(&config, None);
        params.set_clarity(0.5);
        params.set_voice_level(0.4);
        params.set_noise_reduction(true);
        assert_eq!(engine.path(), ProcessingPath::Classical);

        // 1002.27 Hz at 44.1 kHz: exactly 44 samples per period.
        let burst = 8800;
        let mut input: Vec<f32> = (0..burst)
            .map(|i| 0.05 * (2.0 * std::f32::consts::PI * i as f32 / 44.0).sin())
            .collect();
        input.extend(std::iter::repeat(0.0).take(16384));

        let out = run(&mut engine, &input, 4096);
        assert!(out.len() > burst + config.frame_size);
        assert!(out.iter().all(|v| v.abs() <= 1.0));

        let tail = &out[burst + config.frame_size..];
        assert!(tail.iter().all(|v| v.abs() < 1e-6));

        let sine_rms = frame_rms(&out[config.overlap..burst]);
        assert!(sine_rms > 1e-4, "sine rms {sine_rms}");
        assert!(sine_rms > 100.0 * frame_rms(tail).max(1e-9));

        let peak = peak_abs(&out[..burst]);
        let max_jump = out[config.overlap..burst]
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(max_jump <= 0.6 * peak, "jump {max_jump} vs peak {peak}");
        assert!(meters.get_frames_processed() > 0);
    }

    #[test]
    fn test_classical_sine_distortion_bounded() {
        let config = EngineConfig::default();
        let (mut engine, params, _) = engine_with(&config, None);
        params.set_noise_reduction(false);
        params.set_voice_level(0.0);
        params.set_enhancement_level(1.0);
        let n = 16384;
        let input: Vec<f32> = (0..n)
            .map(|i| 0.01 * (2.0 * std::f32::consts::PI * 93.0 * i as f32 / 4096.0).sin())
            .collect();
        let out = run(&mut engine, &input, 4096);
        let steady = &out[4096..8192];
        assert!(total_harmonic_distortion(steady) < MAX_THD_PERCENT);
    }

    #[test]
    fn test_neural_path_runs_post_processing() {
        let mut config = EngineConfig::default();
        config.frame_size = 256;
        config.overlap = 128;
        let stage = |scale| -> Box<dyn StageModel> {
            Box::new(CountingStage {
                frame_size: 256,
                scale,
            })
        };
        let nn = NeuralEnhancer::new(stage(1.0), stage(1.0), 256, 1).unwrap();
        let (mut engine, params, meters) = engine_with(&config, Some(nn));
        params.set_noise_reduction(false);
        assert_eq!(engine.path(), ProcessingPath::Neural);

        let input: Vec<f32> = (0..2048).map(|i| 0.05 * (i as f32 * 0.07).sin()).collect();
        let out = run(&mut engine, &input, 512);
        assert!(out.iter().all(|v| v.abs() <= 1.0));
        assert_eq!(meters.get_neural_failures(), 0);
        let nn = engine.processor().neural().unwrap();
        assert!(nn.state().stage(0).0[0] > 0.0);
    }

    #[test]
    fn test_neural_failure_falls_back_and_publishes_path() {
        let mut config = EngineConfig::default();
        config.frame_size = 256;
        config.overlap = 128;
        let stage1: Box<dyn StageModel> = Box::new(CountingStage {
            frame_size: 256,
            scale: 1.0,
        });
        let stage2: Box<dyn StageModel> = Box::new(FailingStage {
            frame_size: 256,
            ok_calls: 2,
        });
        let nn = NeuralEnhancer::new(stage1, stage2, 256, 1).unwrap();
        let params = Arc::new(EnhancementParameters::default());
        let meters = Arc::new(Meters::new());
        let path = Arc::new(AtomicU8::new(ProcessingPath::Classical as u8));
        let mut engine = EnhancementEngine::new(
            &config,
            Some(nn),
            params,
            Arc::clone(&meters),
            Arc::clone(&path),
        );
        assert_eq!(ProcessingPath::from_u8(path.load(Ordering::Relaxed)), ProcessingPath::Neural);

        let input: Vec<f32> = (0..4096).map(|i| 0.05 * (i as f32 * 0.05).sin()).collect();
        let out = run(&mut engine, &input, 1024);
        assert!(!out.is_empty());
        assert_eq!(meters.get_neural_failures(), 1);
        assert_eq!(engine.path(), ProcessingPath::Classical);
        assert_eq!(
            ProcessingPath::from_u8(path.load(Ordering::Relaxed)),
            ProcessingPath::Classical
        );

        engine.reset();
        assert_eq!(engine.path(), ProcessingPath::Neural);
    }

    #[test]
    fn test_silence_in_silence_out() {
        let config = EngineConfig::default();
        let (mut engine, _, meters) = engine_with(&config, None);
        let out = run(&mut engine, &vec![0.0; 20_000], 4096);
        assert!(out.iter().all(|&v| v == 0.0));
        assert!(meters.get_ein_db_spl() <= config.noise.ein_ceiling_db_spl);
    }

    #[test]
    fn test_output_capacity_holds_for_configured_block() {
        let config = EngineConfig::default();
        let (mut engine, _, _) = engine_with(&config, None);
        let block = vec![0.1f32; config.block_size];
        let cap = engine.out.capacity();
        for _ in 0..8 {
            engine.process_block(&block);
            assert_eq!(engine.out.capacity(), cap);
        }
    }
}
