use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ebur128::{EbuR128, Mode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vxhear::device::{is_end_of_stream, CaptureDevice, WavCapture};
use vxhear::dsp::analysis::total_harmonic_distortion;
use vxhear::{AudioEnhancer, EngineConfig, ListeningPreset, WavBackend};

#[derive(Parser, Debug)]
#[command(name = "vx_enhance", about = "Run a WAV file through the hearing enhancement engine")]
struct Cli {
    /// Input WAV file (mixed down to mono)
    input: PathBuf,

    /// Output WAV file (mono, 32-bit float)
    #[arg(short, long, default_value = "enhanced.wav")]
    output: PathBuf,

    /// Engine configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening preset (Conversation, "Noisy Room", Lecture, Television)
    #[arg(short, long)]
    preset: Option<String>,

    /// Enhancement level (0-2, maps to 40-70 dB)
    #[arg(long)]
    level: Option<f32>,

    /// Voice enhancement level (0-1)
    #[arg(long)]
    voice: Option<f32>,

    /// Clarity level (0-1)
    #[arg(long)]
    clarity: Option<f32>,

    /// Disable noise reduction
    #[arg(long)]
    no_nr: bool,

    /// Stage 1 weights file
    #[arg(long)]
    stage1: Option<PathBuf>,

    /// Stage 2 weights file
    #[arg(long)]
    stage2: Option<PathBuf>,

    /// Give up waiting for the input to drain after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    config.sample_rate = hound::WavReader::open(&cli.input)
        .with_context(|| format!("opening {}", cli.input.display()))?
        .spec()
        .sample_rate;
    if cli.stage1.is_some() {
        config.neural.stage1_model = cli.stage1.clone();
    }
    if cli.stage2.is_some() {
        config.neural.stage2_model = cli.stage2.clone();
    }
    let sample_rate = config.sample_rate;

    let backend = WavBackend {
        input: cli.input.clone(),
        output: cli.output.clone(),
    };
    let mut enhancer = AudioEnhancer::new(config, Arc::new(backend));

    if let Some(name) = &cli.preset {
        let preset = ListeningPreset::from_name(name)
            .ok_or_else(|| anyhow!("unknown preset '{name}'"))?;
        enhancer.apply_preset(preset);
    }
    if let Some(level) = cli.level {
        enhancer.set_enhancement_level(level);
    }
    if let Some(voice) = cli.voice {
        enhancer.set_voice_level(voice);
    }
    if let Some(clarity) = cli.clarity {
        enhancer.set_clarity(clarity);
    }
    if cli.no_nr {
        enhancer.set_noise_reduction(false);
    }

    enhancer.initialize()?;
    let path = enhancer.processing_path();
    enhancer.start()?;
    if !enhancer.wait_for_exit(Duration::from_secs(cli.timeout_secs)) {
        log::warn!("input did not drain within {}s; stopping", cli.timeout_secs);
    }
    enhancer.stop();
    let meters = enhancer.meters();
    let final_path = enhancer.processing_path();
    enhancer.release();

    let input = read_mono(&cli.input, sample_rate)?;
    let output = read_mono(&cli.output, sample_rate)?;
    let first_second = &output[..output.len().min(sample_rate as usize)];

    println!("Enhancement summary for '{}':", cli.input.display());
    println!("  frames processed   : {}", meters.get_frames_processed());
    println!("  processing path    : {} (started {})", final_path.name(), path.name());
    println!("  neural failures    : {}", meters.get_neural_failures());
    println!("  final EIN          : {:.1} dB SPL", meters.get_ein_db_spl());
    println!("  THD (first second) : {:.2} %", total_harmonic_distortion(first_second));
    println!("  loudness in        : {}", format_lufs(integrated_loudness(&input, sample_rate)));
    println!("  loudness out       : {}", format_lufs(integrated_loudness(&output, sample_rate)));
    println!("  written            : {}", cli.output.display());
    Ok(())
}

fn read_mono(path: &Path, sample_rate: u32) -> Result<Vec<f32>> {
    let mut capture = WavCapture::open(path, sample_rate)?;
    let mut samples = Vec::with_capacity(capture.len());
    let mut buf = vec![0.0f32; 8192];
    loop {
        match capture.read(&mut buf) {
            Ok(n) => samples.extend_from_slice(&buf[..n]),
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
    Ok(samples)
}

fn integrated_loudness(samples: &[f32], sample_rate: u32) -> Option<f64> {
    let mut meter = EbuR128::new(1, sample_rate, Mode::I).ok()?;
    meter.add_frames_f32(samples).ok()?;
    meter.loudness_global().ok().filter(|l| l.is_finite())
}

fn format_lufs(lufs: Option<f64>) -> String {
    match lufs {
        Some(l) => format!("{l:.1} LUFS"),
        None => "n/a".to_string(),
    }
}
