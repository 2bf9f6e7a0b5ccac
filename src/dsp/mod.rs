pub mod analysis;
pub mod assembler;
pub mod clarity;
pub mod compressor;
pub mod gain;
pub mod neural;
pub mod noise;
pub mod post_filter;
pub mod stage_core;
pub mod stage_weights;
pub mod utils;

pub use assembler::FrameAssembler;
pub use clarity::VoiceClarityEnhancer;
pub use compressor::BandCompressor;
pub use gain::GainController;
pub use neural::{NeuralEnhancer, RecurrentState};
pub use noise::{AdaptiveSubtractor, NoiseSuppressor};
pub use post_filter::ClarityPostFilter;
pub use stage_core::LstmStage;
pub use stage_weights::StageWeights;
