//! Streaming hearing-assistance enhancement engine.
//!
//! Captured mono audio is cut into overlapping frames, amplified, cleaned of
//! steady background noise and sharpened for speech, then stitched back
//! together and written to an output device. A two-stage recurrent model
//! handles the enhancement when its weights are available; a classical DSP
//! chain takes over otherwise, per frame, and for good once the model keeps
//! failing.
//!
//! [`AudioEnhancer`] is the entry point: it owns the devices, runs the
//! processing thread and exposes the live parameters, meters and lifecycle
//! events.

pub mod config;
pub mod debug;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod events;
pub mod meters;
pub mod params;
pub mod pipeline;
pub mod presets;

pub use config::{EngineConfig, NeuralConfig, NoiseConfig, ParameterDefaults};
pub use device::{AudioBackend, CaptureDevice, MemoryBackend, OutputDevice, WavBackend};
pub use dsp::neural::{InferenceError, ProcessingPath, StageModel};
pub use engine::{EnhancementEngine, FrameProcessor};
pub use events::{EnhancementCallback, EnhancementEvent};
pub use meters::Meters;
pub use params::{EnhancementParameters, ParamSnapshot};
pub use pipeline::{AudioEnhancer, LoopExit, PipelineState};
pub use presets::ListeningPreset;

#[cfg(feature = "assert_process_allocs")]
#[global_allocator]
static ALLOCATOR: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;
