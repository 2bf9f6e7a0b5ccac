//! Capture and playback collaborators.
//!
//! The processing thread only sees [`CaptureDevice`] and [`OutputDevice`]:
//! a blocking read that may return fewer samples than asked for, and a
//! blocking write that may consume only part of the buffer. A capture read
//! failing with `ErrorKind::UnexpectedEof` means the stream is exhausted.
//!
//! Two backends ship with the crate: in-memory devices for embedding and
//! tests, and WAV file devices for offline runs.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

use crate::config::EngineConfig;

pub trait CaptureDevice: Send {
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Blocking read of up to `buf.len()` mono samples.
    fn read(&mut self, buf: &mut [f32]) -> io::Result<usize>;

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait OutputDevice: Send {
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Blocking write; returns how many samples were consumed.
    fn write(&mut self, buf: &[f32]) -> io::Result<usize>;

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Opens the device pair for a session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn CaptureDevice>>;
    fn open_output(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn OutputDevice>>;
}

pub fn end_of_stream() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "capture stream exhausted")
}

pub fn is_end_of_stream(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

// =============================================================================
// IN-MEMORY DEVICES
// =============================================================================

/// Plays back a fixed signal. `max_read` caps every read to exercise short
/// reads; `fail_reads` makes the first reads fail with a transient error.
pub struct MemoryCapture {
    samples: Arc<Vec<f32>>,
    pos: usize,
    max_read: usize,
    fail_reads: usize,
    loop_forever: bool,
}

impl MemoryCapture {
    pub fn new(samples: Arc<Vec<f32>>) -> Self {
        Self {
            samples,
            pos: 0,
            max_read: usize::MAX,
            fail_reads: 0,
            loop_forever: false,
        }
    }
}

impl CaptureDevice for MemoryCapture {
    fn read(&mut self, buf: &mut [f32]) -> io::Result<usize> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "capture overrun"));
        }
        if self.pos >= self.samples.len() {
            if self.loop_forever && !self.samples.is_empty() {
                self.pos = 0;
            } else {
                return Err(end_of_stream());
            }
        }
        let n = buf
            .len()
            .min(self.max_read)
            .min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Collects everything written into a shared buffer.
pub struct MemorySink {
    written: Arc<Mutex<Vec<f32>>>,
    max_write: usize,
}

impl OutputDevice for MemorySink {
    fn write(&mut self, buf: &[f32]) -> io::Result<usize> {
        let n = buf.len().min(self.max_write);
        let mut written = self
            .written
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink lock poisoned"))?;
        written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Hands out [`MemoryCapture`]/[`MemorySink`] pairs over shared buffers.
#[derive(Clone)]
pub struct MemoryBackend {
    input: Arc<Vec<f32>>,
    output: Arc<Mutex<Vec<f32>>>,
    max_read: usize,
    max_write: usize,
    fail_reads: usize,
    loop_forever: bool,
    capture_available: bool,
}

impl MemoryBackend {
    pub fn new(input: Vec<f32>) -> Self {
        Self {
            input: Arc::new(input),
            output: Arc::new(Mutex::new(Vec::new())),
            max_read: usize::MAX,
            max_write: usize::MAX,
            fail_reads: 0,
            loop_forever: false,
            capture_available: true,
        }
    }

    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read.max(1);
        self
    }

    pub fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = max_write;
        self
    }

    pub fn with_failing_reads(mut self, count: usize) -> Self {
        self.fail_reads = count;
        self
    }

    /// Restart the input from the top instead of reporting end-of-stream.
    pub fn looping(mut self) -> Self {
        self.loop_forever = true;
        self
    }

    /// Make `open_capture` fail, as a missing microphone would.
    pub fn without_capture(mut self) -> Self {
        self.capture_available = false;
        self
    }

    /// Everything written to the sink so far.
    pub fn output(&self) -> Vec<f32> {
        match self.output.lock() {
            Ok(out) => out.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AudioBackend for MemoryBackend {
    fn open_capture(&self, _config: &EngineConfig) -> anyhow::Result<Box<dyn CaptureDevice>> {
        if !self.capture_available {
            bail!("capture device unavailable");
        }
        Ok(Box::new(MemoryCapture {
            samples: Arc::clone(&self.input),
            pos: 0,
            max_read: self.max_read,
            fail_reads: self.fail_reads,
            loop_forever: self.loop_forever,
        }))
    }

    fn open_output(&self, _config: &EngineConfig) -> anyhow::Result<Box<dyn OutputDevice>> {
        Ok(Box::new(MemorySink {
            written: Arc::clone(&self.output),
            max_write: self.max_write,
        }))
    }
}

// =============================================================================
// WAV FILE DEVICES
// =============================================================================

/// Reads a WAV file as mono f32, averaging channels.
pub struct WavCapture {
    samples: Vec<f32>,
    pos: usize,
}

impl WavCapture {
    pub fn open(path: &std::path::Path, expected_rate: u32) -> anyhow::Result<Self> {
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let spec = reader.spec();
        if spec.sample_rate != expected_rate {
            bail!(
                "{} is {} Hz, engine runs at {} Hz",
                path.display(),
                spec.sample_rate,
                expected_rate
            );
        }
        let channels = spec.channels.max(1) as usize;
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .context("decoding float samples")?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .context("decoding integer samples")?
            }
        };
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok(Self { samples, pos: 0 })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl CaptureDevice for WavCapture {
    fn read(&mut self, buf: &mut [f32]) -> io::Result<usize> {
        if self.pos >= self.samples.len() {
            return Err(end_of_stream());
        }
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Writes mono 32-bit float WAV. The header is finalised on `stop`.
pub struct WavSink {
    writer: Option<hound::WavWriter<io::BufWriter<std::fs::File>>>,
}

impl WavSink {
    pub fn create(path: &std::path::Path, sample_rate: u32) -> anyhow::Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl OutputDevice for WavSink {
    fn write(&mut self, buf: &[f32]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink already closed"))?;
        for &s in buf {
            writer
                .write_sample(s)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(buf.len())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("finalising output wav")?;
        }
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::warn!("output wav not finalised: {e}");
            }
        }
    }
}

pub struct WavBackend {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl AudioBackend for WavBackend {
    fn open_capture(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(WavCapture::open(&self.input, config.sample_rate)?))
    }

    fn open_output(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn OutputDevice>> {
        Ok(Box::new(WavSink::create(&self.output, config.sample_rate)?))
    }
}
