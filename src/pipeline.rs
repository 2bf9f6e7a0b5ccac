//! Pipeline controller: device lifecycle, the processing thread and the
//! `Idle -> Initializing -> Running -> Stopping -> Idle` state machine.
//!
//! The controller owns the devices and the engine while no session is
//! running. `start()` moves them into the processing thread, `stop()` gets
//! them back through the join handle. A thread that misses the join timeout
//! is detached along with whatever it owns.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::config::{EngineConfig, NeuralConfig};
use crate::device::{is_end_of_stream, AudioBackend, CaptureDevice, OutputDevice};
use crate::dsp::neural::{NeuralEnhancer, ProcessingPath};
use crate::engine::EnhancementEngine;
use crate::events::{EnhancementCallback, EnhancementEvent, EventDispatcher};
use crate::meters::Meters;
use crate::params::EnhancementParameters;
use crate::presets::ListeningPreset;
use crate::{debug, vx_log};

/// Consecutive capture errors after which the session gives up.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle = 0,
    Initializing = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
}

impl PipelineState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PipelineState::Initializing,
            2 => PipelineState::Running,
            3 => PipelineState::Stopping,
            4 => PipelineState::Failed,
            _ => PipelineState::Idle,
        }
    }
}

/// Builds the neural adapter for a session from the config and frame size.
pub type ModelLoader = dyn Fn(&NeuralConfig, usize) -> Result<NeuralEnhancer> + Send + Sync;

/// Why the processing loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    EndOfStream,
    DeviceFailure,
}

struct SessionParts {
    capture: Box<dyn CaptureDevice>,
    output: Box<dyn OutputDevice>,
    engine: EnhancementEngine,
}

impl SessionParts {
    fn start_devices(&mut self) -> Result<()> {
        self.capture.start().context("starting capture device")?;
        self.output.start().context("starting output device")?;
        Ok(())
    }

    /// Best effort: every device gets its stop call even if one fails.
    fn stop_devices(&mut self) {
        if let Err(e) = self.capture.stop() {
            log::warn!("capture device stop failed: {e:#}");
        }
        if let Err(e) = self.output.stop() {
            log::warn!("output device stop failed: {e:#}");
        }
    }
}

/// Body of the processing thread. Returns the session parts unless it never
/// received them.
type SessionBody = Box<dyn FnOnce() -> Option<SessionParts> + Send>;
type SessionHandle = JoinHandle<Option<SessionParts>>;

fn spawn_processing(body: SessionBody) -> io::Result<SessionHandle> {
    thread::Builder::new()
        .name("vxhear-processing".into())
        .spawn(body)
}

struct Worker {
    handle: SessionHandle,
    done_rx: Receiver<LoopExit>,
    exit: Option<LoopExit>,
}

/// Everything the processing thread needs besides the session parts.
struct LoopContext {
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    meters: Arc<Meters>,
    events: Option<Sender<EnhancementEvent>>,
    block_size: usize,
    realtime_priority: bool,
}

impl LoopContext {
    fn post(&self, event: EnhancementEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct AudioEnhancer {
    config: EngineConfig,
    backend: Arc<dyn AudioBackend>,
    params: Arc<EnhancementParameters>,
    meters: Arc<Meters>,
    path: Arc<AtomicU8>,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    events: EventDispatcher,
    loader: Box<ModelLoader>,
    session: Option<SessionParts>,
    worker: Option<Worker>,
}

impl AudioEnhancer {
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let params = Arc::new(EnhancementParameters::from_defaults(&config.initial));
        Self {
            config,
            backend,
            params,
            meters: Arc::new(Meters::new()),
            path: Arc::new(AtomicU8::new(ProcessingPath::Classical as u8)),
            state: Arc::new(AtomicU8::new(PipelineState::Idle as u8)),
            running: Arc::new(AtomicBool::new(false)),
            events: EventDispatcher::new(None),
            loader: Box::new(NeuralEnhancer::load),
            session: None,
            worker: None,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn EnhancementCallback>) -> Self {
        self.events = EventDispatcher::new(Some(callback));
        self
    }

    /// Replace the neural model loader. The default reads the two stage
    /// weight files named in the config.
    pub fn with_model_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&NeuralConfig, usize) -> Result<NeuralEnhancer> + Send + Sync + 'static,
    {
        self.loader = Box::new(loader);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn processing_path(&self) -> ProcessingPath {
        ProcessingPath::from_u8(self.path.load(Ordering::Relaxed))
    }

    pub fn meters(&self) -> Arc<Meters> {
        Arc::clone(&self.meters)
    }

    pub fn params(&self) -> Arc<EnhancementParameters> {
        Arc::clone(&self.params)
    }

    pub fn set_enhancement_level(&self, level: f32) {
        self.params.set_enhancement_level(level);
    }

    pub fn set_voice_level(&self, level: f32) {
        self.params.set_voice_level(level);
    }

    pub fn set_clarity(&self, level: f32) {
        self.params.set_clarity(level);
    }

    pub fn set_noise_reduction(&self, enabled: bool) {
        self.params.set_noise_reduction(enabled);
    }

    pub fn apply_preset(&self, preset: ListeningPreset) -> bool {
        let applied = preset.apply(&self.params);
        if applied {
            log::info!("applied preset '{}'", preset.name());
        }
        applied
    }

    /// Open both devices and load the neural model. A missing or broken
    /// model only costs the neural path; anything else fails the session.
    pub fn initialize(&mut self) -> Result<()> {
        if self.worker.is_some() {
            bail!("cannot initialize while a session is running");
        }
        if self.state() == PipelineState::Failed {
            bail!("controller is in the failed state; release() it first");
        }
        self.set_state(PipelineState::Initializing);
        match self.open_session() {
            Ok(parts) => {
                log::info!(
                    "initialized: {} Hz, frame {}, overlap {}, {} path",
                    self.config.sample_rate,
                    self.config.frame_size,
                    self.config.overlap,
                    parts.engine.path().name()
                );
                self.session = Some(parts);
                Ok(())
            }
            Err(e) => {
                self.session = None;
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn open_session(&self) -> Result<SessionParts> {
        self.config
            .validate()
            .context("invalid engine configuration")?;
        let capture = self
            .backend
            .open_capture(&self.config)
            .context("opening capture device")?;
        let output = self
            .backend
            .open_output(&self.config)
            .context("opening output device")?;

        let neural = match (self.loader)(&self.config.neural, self.config.frame_size) {
            Ok(nn) => {
                log::info!("neural model loaded");
                Some(nn)
            }
            Err(e) => {
                log::warn!("neural model unavailable, using classical path: {e:#}");
                None
            }
        };

        let engine = EnhancementEngine::new(
            &self.config,
            neural,
            Arc::clone(&self.params),
            Arc::clone(&self.meters),
            Arc::clone(&self.path),
        );
        Ok(SessionParts {
            capture,
            output,
            engine,
        })
    }

    fn fail(&self, err: &anyhow::Error) {
        log::error!("{err:#}");
        self.set_state(PipelineState::Failed);
        self.events.post(EnhancementEvent::Error(format!("{err:#}")));
    }

    /// Start device I/O and the processing thread. Calling it while a
    /// session runs does nothing.
    pub fn start(&mut self) -> Result<()> {
        self.start_with(spawn_processing)
    }

    /// The session parts stay here until the thread exists; they are handed
    /// over through a channel afterwards.
    fn start_with<F>(&mut self, spawn: F) -> Result<()>
    where
        F: FnOnce(SessionBody) -> io::Result<SessionHandle>,
    {
        if self.worker.is_some() {
            log::debug!("start ignored: already running");
            return Ok(());
        }
        if self.state() == PipelineState::Failed {
            bail!("controller is in the failed state; release() it first");
        }
        let Some(mut parts) = self.session.take() else {
            bail!("start() called before initialize()");
        };

        if let Err(e) = parts.start_devices() {
            parts.stop_devices();
            self.fail(&e);
            return Err(e);
        }
        parts.engine.reset();
        self.meters.reset();
        debug::init();

        let (parts_tx, parts_rx) = sync_channel::<SessionParts>(1);
        let (done_tx, done_rx) = sync_channel(1);
        let ctx = LoopContext {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            meters: Arc::clone(&self.meters),
            events: self.events.sender(),
            block_size: self.config.block_size,
            realtime_priority: self.config.realtime_priority,
        };
        let body: SessionBody = Box::new(move || {
            let parts = parts_rx.recv().ok()?;
            let (parts, exit) = processing_loop(parts, &ctx);
            let _ = done_tx.send(exit);
            Some(parts)
        });

        let handle = match spawn(body) {
            Ok(handle) => handle,
            Err(e) => {
                parts.stop_devices();
                self.session = Some(parts);
                let err = anyhow!(e).context("spawning processing thread");
                self.fail(&err);
                return Err(err);
            }
        };

        self.running.store(true, Ordering::Release);
        self.set_state(PipelineState::Running);
        self.events.post(EnhancementEvent::Started);
        if let Err(returned) = parts_tx.send(parts) {
            // The thread is gone before taking its parts.
            self.running.store(false, Ordering::Release);
            let mut parts = returned.0;
            parts.stop_devices();
            self.session = Some(parts);
            let _ = handle.join();
            let err = anyhow!("processing thread exited before the session started");
            self.fail(&err);
            return Err(err);
        }
        self.worker = Some(Worker {
            handle,
            done_rx,
            exit: None,
        });
        log::info!("processing started");
        Ok(())
    }

    /// Block until the processing loop exits on its own (end of stream or
    /// device failure). Returns true if it has exited or nothing is running.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.as_mut() else {
            return true;
        };
        if worker.exit.is_some() {
            return true;
        }
        match worker.done_rx.recv_timeout(timeout) {
            Ok(exit) => {
                worker.exit = Some(exit);
                true
            }
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Signal the processing thread, join it within the configured timeout
    /// and stop the devices. Does nothing when no session is running.
    pub fn stop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        self.set_state(PipelineState::Stopping);
        self.running.store(false, Ordering::Release);

        let timeout = self.config.join_timeout();
        let exited = match worker.exit.take() {
            Some(exit) => Ok(Some(exit)),
            None => match worker.done_rx.recv_timeout(timeout) {
                Ok(exit) => Ok(Some(exit)),
                Err(RecvTimeoutError::Disconnected) => Ok(None),
                Err(RecvTimeoutError::Timeout) => Err(()),
            },
        };

        match exited {
            Ok(exit) => {
                if let Some(exit) = exit {
                    log::debug!("processing loop exited: {exit:?}");
                }
                match worker.handle.join() {
                    Ok(Some(mut parts)) => {
                        parts.stop_devices();
                        self.session = Some(parts);
                    }
                    Ok(None) => log::error!("processing thread ended without its session"),
                    Err(_) => log::error!("processing thread panicked; session resources lost"),
                }
            }
            Err(()) => {
                log::warn!("processing thread did not exit within {timeout:?}; detaching it");
            }
        }

        let drained = debug::drain();
        if drained > 0 {
            log::debug!("drained {drained} real-time log entries");
        }
        self.set_state(PipelineState::Idle);
        self.events.post(EnhancementEvent::Stopped);
        log::info!(
            "processing stopped after {} frames",
            self.meters.get_frames_processed()
        );
    }

    /// Stop, then drop devices, engine and model. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.stop();
        if self.session.take().is_some() {
            log::info!("session resources released");
        }
        self.running.store(false, Ordering::Release);
        self.set_state(PipelineState::Idle);
    }
}

impl Drop for AudioEnhancer {
    fn drop(&mut self) {
        self.release();
    }
}

fn processing_loop(mut parts: SessionParts, ctx: &LoopContext) -> (SessionParts, LoopExit) {
    if ctx.realtime_priority {
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            log::warn!("could not raise processing thread priority: {e:?}");
        }
    }

    let mut input = vec![0.0f32; ctx.block_size];
    let silence = vec![0.0f32; ctx.block_size];
    let mut read_errors = 0u32;

    let exit = loop {
        if !ctx.running.load(Ordering::Acquire) {
            break LoopExit::Cancelled;
        }

        let n = match parts.capture.read(&mut input) {
            Ok(n) => {
                read_errors = 0;
                n
            }
            Err(e) if is_end_of_stream(&e) => break LoopExit::EndOfStream,
            Err(e) => {
                read_errors += 1;
                vx_log!("capture read failed ({}): {}", read_errors, e);
                if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    let msg = format!("capture failed {read_errors} times in a row: {e}");
                    log::error!("{msg}");
                    ctx.state
                        .store(PipelineState::Stopping as u8, Ordering::Release);
                    ctx.post(EnhancementEvent::Error(msg));
                    break LoopExit::DeviceFailure;
                }
                continue;
            }
        };
        if n < input.len() {
            ctx.meters.add_short_read();
        }
        if n == 0 {
            continue;
        }
        if !ctx.running.load(Ordering::Acquire) {
            break LoopExit::Cancelled;
        }

        #[cfg(feature = "assert_process_allocs")]
        let ok = assert_no_alloc::assert_no_alloc(|| process_guarded(&mut parts.engine, &input[..n]));
        #[cfg(not(feature = "assert_process_allocs"))]
        let ok = process_guarded(&mut parts.engine, &input[..n]);

        let out: &[f32] = if ok {
            parts.engine.output()
        } else {
            ctx.meters.add_guarded_panic();
            vx_log!("block processing panicked; writing silence");
            parts.engine.reset();
            &silence[..n]
        };
        write_block(parts.output.as_mut(), out, &ctx.meters);
    };

    (parts, exit)
}

fn process_guarded(engine: &mut EnhancementEngine, block: &[f32]) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| {
        engine.process_block(block);
    }))
    .is_ok()
}

/// Write until the device has taken the whole block. A device that accepts
/// nothing or errors loses the rest of the block.
fn write_block(output: &mut dyn OutputDevice, mut buf: &[f32], meters: &Meters) {
    while !buf.is_empty() {
        match output.write(buf) {
            Ok(0) => {
                meters.add_dropped_output(buf.len());
                return;
            }
            Ok(n) => buf = &buf[n.min(buf.len())..],
            Err(e) => {
                vx_log!("output write failed: {}", e);
                meters.add_dropped_output(buf.len());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBackend;
    use std::sync::atomic::AtomicUsize;
    use crate::dsp::neural::test_stages::{CountingStage, FailingStage};
    use crate::dsp::neural::StageModel;
    use crate::dsp::utils::{frame_rms, peak_abs};
    use crate::events::test_support::RecordingCallback;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config() -> EngineConfig {
        EngineConfig {
            realtime_priority: false,
            ..EngineConfig::default()
        }
    }

    fn controller(
        backend: &MemoryBackend,
    ) -> (AudioEnhancer, Arc<RecordingCallback>) {
        let recorder = Arc::new(RecordingCallback::default());
        let enhancer = AudioEnhancer::new(test_config(), Arc::new(backend.clone()))
            .with_callback(recorder.clone() as Arc<dyn EnhancementCallback>);
        (enhancer, recorder)
    }

    fn burst_then_silence() -> Vec<f32> {
        let mut input: Vec<f32> = (0..8800)
            .map(|i| 0.05 * (2.0 * std::f32::consts::PI * i as f32 / 44.0).sin())
            .collect();
        input.extend(std::iter::repeat(0.0).take(16384));
        input
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let backend = MemoryBackend::new(vec![0.0; 100]);
        let (mut enhancer, recorder) = controller(&backend);
        enhancer.stop();
        assert_eq!(enhancer.state(), PipelineState::Idle);
        drop(enhancer);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_start_before_initialize_errors() {
        let backend = MemoryBackend::new(vec![0.0; 100]);
        let (mut enhancer, _) = controller(&backend);
        assert!(enhancer.start().is_err());
        assert_eq!(enhancer.state(), PipelineState::Idle);
    }

    #[test]
    fn test_start_twice_is_idempotent() {
        let backend = MemoryBackend::new(vec![0.01; 4096]).looping();
        let (mut enhancer, recorder) = controller(&backend);
        enhancer.initialize().unwrap();
        assert_eq!(enhancer.state(), PipelineState::Initializing);
        enhancer.start().unwrap();
        enhancer.start().unwrap();
        assert_eq!(enhancer.state(), PipelineState::Running);
        enhancer.stop();
        enhancer.stop();
        assert_eq!(enhancer.state(), PipelineState::Idle);
        drop(enhancer);
        assert_eq!(
            recorder.events(),
            vec![EnhancementEvent::Started, EnhancementEvent::Stopped]
        );
    }

    #[test]
    fn test_release_twice_is_safe() {
        let backend = MemoryBackend::new(vec![0.01; 4096]).looping();
        let (mut enhancer, _) = controller(&backend);
        enhancer.initialize().unwrap();
        enhancer.start().unwrap();
        enhancer.release();
        enhancer.release();
        assert_eq!(enhancer.state(), PipelineState::Idle);
        assert!(enhancer.start().is_err());
    }

    #[test]
    fn test_restart_after_stop_reuses_session() {
        let backend = MemoryBackend::new(vec![0.01; 4096]).looping();
        let (mut enhancer, _) = controller(&backend);
        enhancer.initialize().unwrap();
        enhancer.start().unwrap();
        enhancer.stop();
        enhancer.start().unwrap();
        assert_eq!(enhancer.state(), PipelineState::Running);
        enhancer.release();
    }

    #[test]
    fn test_device_open_failure_fails_session() {
        let backend = MemoryBackend::new(vec![0.0; 100]).without_capture();
        let (mut enhancer, recorder) = controller(&backend);
        assert!(enhancer.initialize().is_err());
        assert_eq!(enhancer.state(), PipelineState::Failed);
        assert!(enhancer.start().is_err());
        assert!(enhancer.initialize().is_err());

        enhancer.stop();
        assert_eq!(enhancer.state(), PipelineState::Failed);
        enhancer.release();
        assert_eq!(enhancer.state(), PipelineState::Idle);
        drop(enhancer);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EnhancementEvent::Error(msg) => assert!(msg.contains("capture")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    struct StopCounting(Arc<AtomicUsize>);

    impl CaptureDevice for StopCounting {
        fn read(&mut self, _buf: &mut [f32]) -> io::Result<usize> {
            Err(crate::device::end_of_stream())
        }

        fn stop(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl OutputDevice for StopCounting {
        fn write(&mut self, buf: &[f32]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn stop(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StopCountingBackend {
        stops: Arc<AtomicUsize>,
    }

    impl AudioBackend for StopCountingBackend {
        fn open_capture(&self, _config: &EngineConfig) -> Result<Box<dyn CaptureDevice>> {
            Ok(Box::new(StopCounting(Arc::clone(&self.stops))))
        }

        fn open_output(&self, _config: &EngineConfig) -> Result<Box<dyn OutputDevice>> {
            Ok(Box::new(StopCounting(Arc::clone(&self.stops))))
        }
    }

    #[test]
    fn test_spawn_failure_stops_devices_without_started() {
        let stops = Arc::new(AtomicUsize::new(0));
        let backend = StopCountingBackend {
            stops: Arc::clone(&stops),
        };
        let recorder = Arc::new(RecordingCallback::default());
        let mut enhancer = AudioEnhancer::new(test_config(), Arc::new(backend))
            .with_callback(recorder.clone() as Arc<dyn EnhancementCallback>);
        enhancer.initialize().unwrap();

        let result =
            enhancer.start_with(|_body| Err(io::Error::new(io::ErrorKind::Other, "no threads")));
        assert!(result.is_err());
        assert_eq!(enhancer.state(), PipelineState::Failed);
        assert!(!enhancer.running.load(Ordering::Acquire));
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        enhancer.release();
        drop(enhancer);
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EnhancementEvent::Error(msg) => assert!(msg.contains("spawning processing thread")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_fails_initialize() {
        let backend = MemoryBackend::new(vec![0.0; 100]);
        let config = EngineConfig {
            overlap: 0,
            ..test_config()
        };
        let mut enhancer = AudioEnhancer::new(config, Arc::new(backend));
        assert!(enhancer.initialize().is_err());
        assert_eq!(enhancer.state(), PipelineState::Failed);
    }

    #[test]
    fn test_end_to_end_matches_direct_engine() {
        let input = burst_then_silence();
        let backend = MemoryBackend::new(input.clone()).with_max_read(1000);
        let (mut enhancer, _) = controller(&backend);
        enhancer.set_clarity(0.5);
        enhancer.set_voice_level(0.4);
        enhancer.set_noise_reduction(true);

        enhancer.initialize().unwrap();
        assert_eq!(enhancer.processing_path(), ProcessingPath::Classical);
        enhancer.start().unwrap();
        assert!(enhancer.wait_for_exit(WAIT));
        enhancer.stop();

        let out = backend.output();
        let config = test_config();
        let meters = enhancer.meters();
        assert_eq!(
            out.len() as u64,
            meters.get_frames_processed() * config.advance() as u64
        );
        assert!(meters.get_short_reads() > 0);
        assert_eq!(meters.get_guarded_panics(), 0);

        let mut direct = EnhancementEngine::new(
            &config,
            None,
            enhancer.params(),
            Arc::new(Meters::new()),
            Arc::new(AtomicU8::new(0)),
        );
        let mut expected = Vec::new();
        for chunk in input.chunks(config.block_size) {
            expected.extend_from_slice(direct.process_block(chunk));
        }
        assert_eq!(out, expected);

        let tail = &out[8800 + config.frame_size..];
        assert!(tail.iter().all(|v| v.abs() < 1e-6));
        assert!(frame_rms(&out[config.overlap..8800]) > 1e-4);
        assert!(peak_abs(&out) <= 1.0);
    }

    #[test]
    fn test_neural_failure_degrades_to_classical() {
        let input: Vec<f32> = (0..20_000).map(|i| 0.05 * (i as f32 * 0.03).sin()).collect();
        let backend = MemoryBackend::new(input);
        let (enhancer, _) = controller(&backend);
        let mut enhancer = enhancer.with_model_loader(|_, frame_size| {
            let stage1: Box<dyn StageModel> = Box::new(CountingStage {
                frame_size,
                scale: 1.0,
            });
            let stage2: Box<dyn StageModel> = Box::new(FailingStage {
                frame_size,
                ok_calls: 3,
            });
            NeuralEnhancer::new(stage1, stage2, frame_size, 1)
        });

        enhancer.initialize().unwrap();
        assert_eq!(enhancer.processing_path(), ProcessingPath::Neural);
        enhancer.start().unwrap();
        assert!(enhancer.wait_for_exit(WAIT));
        enhancer.stop();

        assert_eq!(enhancer.processing_path(), ProcessingPath::Classical);
        assert_eq!(enhancer.meters().get_neural_failures(), 1);
        assert!(backend.output().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_repeated_read_errors_end_session() {
        let backend = MemoryBackend::new(vec![0.01; 8192])
            .with_failing_reads(MAX_CONSECUTIVE_READ_ERRORS as usize + 10);
        let (mut enhancer, recorder) = controller(&backend);
        enhancer.initialize().unwrap();
        enhancer.start().unwrap();
        assert!(enhancer.wait_for_exit(WAIT));
        assert_eq!(enhancer.state(), PipelineState::Stopping);
        enhancer.stop();
        assert_eq!(enhancer.state(), PipelineState::Idle);
        assert!(backend.output().is_empty());
        drop(enhancer);

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], EnhancementEvent::Started);
        assert!(matches!(&events[1], EnhancementEvent::Error(msg) if msg.contains("capture")));
        assert_eq!(events[2], EnhancementEvent::Stopped);
    }

    #[test]
    fn test_transient_read_errors_are_survived() {
        let backend = MemoryBackend::new(vec![0.01; 8192]).with_failing_reads(5);
        let (mut enhancer, recorder) = controller(&backend);
        enhancer.initialize().unwrap();
        enhancer.start().unwrap();
        assert!(enhancer.wait_for_exit(WAIT));
        enhancer.stop();
        assert!(!backend.output().is_empty());
        drop(enhancer);
        assert!(recorder
            .events()
            .iter()
            .all(|e| !matches!(e, EnhancementEvent::Error(_))));
    }

    #[test]
    fn test_partial_writes_deliver_everything() {
        let backend = MemoryBackend::new(vec![0.02; 10_000]).with_max_write(100);
        let (mut enhancer, _) = controller(&backend);
        enhancer.initialize().unwrap();
        enhancer.start().unwrap();
        assert!(enhancer.wait_for_exit(WAIT));
        enhancer.stop();
        let meters = enhancer.meters();
        assert_eq!(meters.get_dropped_output_samples(), 0);
        assert_eq!(
            backend.output().len() as u64,
            meters.get_frames_processed() * test_config().advance() as u64
        );
    }

    #[test]
    fn test_setters_clamp_through_controller() {
        let backend = MemoryBackend::new(Vec::new());
        let (enhancer, _) = controller(&backend);
        enhancer.set_clarity(-5.0);
        assert_eq!(enhancer.params().clarity(), 0.0);
        enhancer.set_enhancement_level(100.0);
        assert_eq!(enhancer.params().gain_db(), 70.0);
        assert!(enhancer.apply_preset(ListeningPreset::Television));
        assert!(!enhancer.params().noise_reduction());
        assert!(!enhancer.apply_preset(ListeningPreset::Manual));
    }
}
