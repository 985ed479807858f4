//! Frame ingestion: the producer-facing [`FrameSource`] and the GPU-submission
//! thread it drives.
//!
//! ```text
//! producer thread                      render thread
//! ───────────────                      ─────────────
//! submit(sample)
//!   validate
//!   pause check
//!   acquire FrameSlot ──── Job ────▶   upload planes
//!                                      convert (profile, rotation)
//!                                      beautify graph
//!                                      sink.present
//!                                      record stats
//!                        ◀── slot ──   drop guard
//! ```
//!
//! At most one frame is between acquire and release, so dispatches never
//! overlap and frames reach the sink in submission order.

pub mod slot;
pub mod stats;

pub use slot::{FrameSlot, FrameSlotGuard};
pub use stats::{FrameStats, RateMeter};

use crate::capture::CaptureBackend;
use crate::color::{ColorConversion, ConversionProfile};
use crate::error::{PipelineError, PipelineResult};
use crate::filter::{BeautifyError, BeautifyFilter, BeautifyParams, ParameterError};
use crate::frame::{CaptureFormat, FrameMetadata, Orientation, PlaneLayout, SampleFormat, VideoSample};
use crate::gpu::{ensure_texture, GpuContext, Texture, TextureFormat};
use crate::output::FrameSink;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What `submit` does while another frame is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Wait up to `timeout` for the slot, then drop the frame.
    Block { timeout: Duration },
    /// Drop the frame immediately.
    Drop,
}

impl BusyPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    fn timeout(&self) -> Duration {
        match self {
            BusyPolicy::Block { timeout } => *timeout,
            BusyPolicy::Drop => Duration::ZERO,
        }
    }
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Block { timeout: Self::DEFAULT_TIMEOUT }
    }
}

/// Setup-time settings of the ingestion stage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IngestConfig {
    pub profile: ConversionProfile,
    pub output_rotation: Orientation,
    pub busy_policy: BusyPolicy,
    pub paused: bool,
    pub beautify: BeautifyParams,
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the render thread with this sequence number.
    Accepted(u64),
    /// Capture is paused; nothing was rendered.
    Skipped,
}

/// Failure to bring up the ingestion stage.
#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Beautify(#[from] BeautifyError),
    #[error("failed to start render thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// State shared by the producer handle and the render thread.
struct Shared {
    slot: FrameSlot,
    conversion: ColorConversion,
    stats: Mutex<FrameStats>,
    paused: AtomicBool,
    output_rotation: Mutex<Orientation>,
    busy_policy: Mutex<BusyPolicy>,
    pending_params: Mutex<Option<BeautifyParams>>,
    next_sequence: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, FrameStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn read<T: Copy>(value: &Mutex<T>) -> T {
    *value.lock().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(value: &Mutex<T>, next: T) {
    *value.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

/// A frame on its way to the render thread.
struct Job {
    sample: VideoSample,
    layouts: Vec<PlaneLayout>,
    meta: FrameMetadata,
    _guard: FrameSlotGuard,
}

/// Producer-facing handle of the ingestion stage.
pub struct FrameSource {
    shared: Arc<Shared>,
    jobs: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Build the beautify graph and start the GPU-submission thread.
    pub fn spawn(ctx: Arc<dyn GpuContext>, config: IngestConfig, sink: Box<dyn FrameSink>) -> Result<Self, StartError> {
        let beautify = BeautifyFilter::new(Arc::clone(&ctx), config.beautify)?;
        let shared = Arc::new(Shared {
            slot: FrameSlot::new(),
            conversion: ColorConversion::new(config.profile),
            stats: Mutex::new(FrameStats::new()),
            paused: AtomicBool::new(config.paused),
            output_rotation: Mutex::new(config.output_rotation),
            busy_policy: Mutex::new(config.busy_policy),
            pending_params: Mutex::new(None),
            next_sequence: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });

        let (tx, rx) = sync_channel::<Job>(0);
        let renderer = FrameRenderer::new(ctx, Arc::clone(&shared), beautify, sink);
        let worker = std::thread::Builder::new()
            .name("veneer-render".to_string())
            .spawn(move || renderer.run(rx))?;

        info!(
            "Frame source started (profile {}, {:?})",
            config.profile.name(),
            config.busy_policy
        );
        Ok(Self { shared, jobs: Some(tx), worker: Some(worker) })
    }

    /// Pull the next sample from `capture` and submit it at the row alignment
    /// the backend produced. `Ok(None)` once the source has ended; capture
    /// failures are the outer error, pipeline outcomes the inner result.
    pub fn submit_next(
        &self,
        capture: &mut dyn CaptureBackend,
    ) -> anyhow::Result<Option<PipelineResult<SubmitOutcome>>> {
        let Some(sample) = capture.next_sample()? else {
            return Ok(None);
        };
        Ok(Some(self.submit(sample, capture.alignment())))
    }

    /// Hand a sample to the pipeline.
    ///
    /// A malformed sample is rejected before anything changes. While paused
    /// the sample is skipped. If a frame is still in flight the busy policy
    /// decides between waiting and dropping; a frame dropped this way is a
    /// [`PipelineError::Timeout`].
    pub fn submit(&self, sample: VideoSample, alignment: usize) -> PipelineResult<SubmitOutcome> {
        let layouts = sample.validate(alignment)?;
        if self.shared.paused.load(Ordering::SeqCst) {
            debug!("Capture paused, skipping sample");
            return Ok(SubmitOutcome::Skipped);
        }
        let jobs = self.jobs.as_ref().ok_or(PipelineError::Disconnected)?;

        let timeout = read(&self.shared.busy_policy).timeout();
        let Some(guard) = self.shared.slot.try_acquire(timeout) else {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Previous frame still in flight after {:?}, dropping sample", timeout);
            return Err(PipelineError::Timeout(timeout));
        };

        let rotation = sample.rotation.then(read(&self.shared.output_rotation));
        let (width, height) = rotation.output_size(sample.width, sample.height);
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
        let meta = FrameMetadata {
            // Presence checked by validate.
            timestamp: sample.timestamp.unwrap_or_default(),
            sequence,
            rotation,
            capture: if sample.format.is_planar() { CaptureFormat::Planar } else { CaptureFormat::Packed },
            width,
            height,
        };

        jobs.send(Job { sample, layouts, meta, _guard: guard })
            .map_err(|_| PipelineError::Disconnected)?;
        Ok(SubmitOutcome::Accepted(sequence))
    }

    /// Block until no frame is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.slot.wait_idle(timeout)
    }

    /// Swap the conversion profile. Takes effect on the next frame.
    pub fn set_profile(&self, profile: ConversionProfile) {
        self.shared.conversion.set_profile(profile);
    }

    pub fn profile(&self) -> ConversionProfile {
        self.shared.conversion.profile()
    }

    /// Queue new stage parameters for the next frame. Invalid values are
    /// rejected here and nothing changes.
    pub fn set_beautify_params(&self, params: BeautifyParams) -> Result<(), ParameterError> {
        params.validate()?;
        write(&self.shared.pending_params, Some(params));
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) {
        if self.shared.paused.swap(paused, Ordering::SeqCst) != paused {
            info!("Capture {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn set_output_rotation(&self, rotation: Orientation) {
        write(&self.shared.output_rotation, rotation);
    }

    pub fn output_rotation(&self) -> Orientation {
        read(&self.shared.output_rotation)
    }

    pub fn set_busy_policy(&self, policy: BusyPolicy) {
        write(&self.shared.busy_policy, policy);
    }

    /// Rounded frames per second over the capture so far.
    pub fn frame_rate(&self) -> i32 {
        self.shared.stats().frame_rate()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.stats().frames_captured()
    }

    /// Frames lost to timeouts or render failures.
    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FrameStats {
        self.shared.stats().clone()
    }

    /// Stop the render thread after the in-flight frame and release every
    /// texture it owns. Later submissions fail with `Disconnected`.
    pub fn shutdown(&mut self) {
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Render thread panicked");
            }
            info!("Frame source stopped");
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Render-thread state: uploaded planes, the converted frame, the graph and
/// the sink.
pub struct FrameRenderer {
    ctx: Arc<dyn GpuContext>,
    shared: Arc<Shared>,
    beautify: BeautifyFilter,
    sink: Box<dyn FrameSink>,
    luma: Option<Texture>,
    chroma: Option<Texture>,
    packed: Option<Texture>,
    converted: Option<Texture>,
}

impl FrameRenderer {
    fn new(ctx: Arc<dyn GpuContext>, shared: Arc<Shared>, beautify: BeautifyFilter, sink: Box<dyn FrameSink>) -> Self {
        Self { ctx, shared, beautify, sink, luma: None, chroma: None, packed: None, converted: None }
    }

    fn run(mut self, jobs: Receiver<Job>) {
        debug!("Render thread running");
        while let Ok(job) = jobs.recv() {
            let meta = job.meta;
            match self.render(&job.sample, &job.layouts, &meta) {
                Ok(true) => {
                    self.shared.stats().record(meta.timestamp);
                }
                Ok(false) => {
                    self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropped frame {} ({}): {}", meta.sequence, err.kind(), err);
                    self.sink.frame_dropped(&meta, &err);
                }
            }
            // Job and its slot guard drop here.
        }
        debug!("Render thread exiting");
    }

    /// Run one frame through upload, conversion, the graph and the sink.
    /// `Ok(false)` means the sink refused the frame.
    fn render(&mut self, sample: &VideoSample, layouts: &[PlaneLayout], meta: &FrameMetadata) -> PipelineResult<bool> {
        if let Some(params) = self.shared.pending_params.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.beautify.set_params(params).map_err(|e| PipelineError::format(e.to_string()))?;
        }

        let ctx = self.ctx.as_ref();
        let start = Instant::now();

        let (source, chroma): (&Texture, Option<&Texture>) = match sample.format {
            SampleFormat::Nv12 => {
                let luma = ensure_texture(ctx, &mut self.luma, layouts[0].width, layouts[0].height, TextureFormat::R8)?;
                ctx.upload_texture(luma, &sample.planes[0].data, layouts[0].bytes_per_row)?;
                let chroma =
                    ensure_texture(ctx, &mut self.chroma, layouts[1].width, layouts[1].height, TextureFormat::Rg8)?;
                ctx.upload_texture(chroma, &sample.planes[1].data, layouts[1].bytes_per_row)?;
                (&*luma, Some(&*chroma))
            }
            SampleFormat::Bgra | SampleFormat::Rgba => {
                let format = if sample.format == SampleFormat::Bgra { TextureFormat::Bgra8 } else { TextureFormat::Rgba8 };
                let packed = ensure_texture(ctx, &mut self.packed, sample.width, sample.height, format)?;
                ctx.upload_texture(packed, &sample.planes[0].data, layouts[0].bytes_per_row)?;
                (&*packed, None)
            }
        };
        let upload_time = start.elapsed();

        let rgb = self.shared.conversion.convert(ctx, source, chroma, meta.rotation, &mut self.converted)?;
        let convert_time = start.elapsed() - upload_time;

        let output = self.beautify.apply(rgb)?;
        let graph_time = start.elapsed() - upload_time - convert_time;

        if let Err(err) = self.sink.present(ctx, output, meta) {
            error!("Sink failed on frame {}: {:#}", meta.sequence, err);
            return Ok(false);
        }

        debug!(
            "[Perf] frame {}: upload {:?} | convert {:?} | graph {:?} | total {:?}",
            meta.sequence,
            upload_time,
            convert_time,
            graph_time,
            start.elapsed()
        );
        Ok(true)
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        for texture in [self.luma.take(), self.chroma.take(), self.packed.take(), self.converted.take()]
            .into_iter()
            .flatten()
        {
            self.ctx.release_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuContext;
    use crate::output::{ChannelSink, NullSink};
    use std::sync::mpsc::channel;

    const IDLE: Duration = Duration::from_secs(5);

    fn source(cpu: &Arc<CpuContext>, config: IngestConfig, sink: Box<dyn FrameSink>) -> FrameSource {
        let ctx: Arc<dyn GpuContext> = cpu.clone();
        FrameSource::spawn(ctx, config, sink).unwrap()
    }

    fn gray(ts_ms: u64) -> VideoSample {
        VideoSample::solid_nv12(8, 6, 128, 128, 128, 4).with_timestamp(Duration::from_millis(ts_ms))
    }

    #[test]
    fn test_format_errors_change_nothing() {
        let cpu = Arc::new(CpuContext::new());
        let source = source(&cpu, IngestConfig::default(), Box::new(NullSink));

        let no_timestamp = VideoSample::solid_nv12(8, 6, 128, 128, 128, 4);
        assert!(matches!(source.submit(no_timestamp, 4), Err(PipelineError::Format(_))));
        assert!(matches!(source.submit(gray(0), 0), Err(PipelineError::Format(_))));
        let mut short = gray(0);
        short.planes[1].data.truncate(3);
        assert!(matches!(source.submit(short, 4), Err(PipelineError::Format(_))));

        assert!(!source.shared.slot.is_busy());
        assert_eq!(source.frames_captured(), 0);
        assert_eq!(source.frames_dropped(), 0);
    }

    #[test]
    fn test_metadata_reflects_effective_rotation() {
        let cpu = Arc::new(CpuContext::new());
        let (tx, rx) = channel();
        let config = IngestConfig { output_rotation: Orientation::RotateRight, ..Default::default() };
        let source = source(&cpu, config, Box::new(ChannelSink::new(tx)));

        let sample = gray(0).with_rotation(Orientation::FlipHorizontal);
        assert_eq!(source.submit(sample, 4).unwrap(), SubmitOutcome::Accepted(0));
        let frame = rx.recv_timeout(IDLE).unwrap();
        assert_eq!(frame.meta.rotation, Orientation::FlipHorizontal.then(Orientation::RotateRight));
        assert_eq!(frame.meta.capture, CaptureFormat::Planar);
        assert_eq!((frame.width, frame.height), (6, 8));
        assert_eq!((frame.meta.width, frame.meta.height), (6, 8));
    }

    #[test]
    fn test_sequence_numbers_follow_submission_order() {
        let cpu = Arc::new(CpuContext::new());
        let (tx, rx) = channel();
        let source = source(&cpu, IngestConfig::default(), Box::new(ChannelSink::new(tx)));
        for n in 0..5 {
            assert_eq!(source.submit(gray(n * 10), 4).unwrap(), SubmitOutcome::Accepted(n));
        }
        let sequences: Vec<u64> = (0..5).map(|_| rx.recv_timeout(IDLE).unwrap().meta.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_params_are_rejected_up_front() {
        let cpu = Arc::new(CpuContext::new());
        let source = source(&cpu, IngestConfig::default(), Box::new(NullSink));
        let mut params = BeautifyParams::default();
        params.smoothing.radius = 0;
        assert!(source.set_beautify_params(params).is_err());
        assert!(source.shared.pending_params.lock().unwrap().is_none());
    }

    #[test]
    fn test_shutdown_releases_textures_and_disconnects() {
        let cpu = Arc::new(CpuContext::new());
        let mut source = source(&cpu, IngestConfig::default(), Box::new(NullSink));
        source.submit(gray(0), 4).unwrap();
        assert!(source.wait_idle(IDLE));
        assert!(cpu.live_textures() > 0);

        source.shutdown();
        assert_eq!(cpu.live_textures(), 0);
        assert!(matches!(source.submit(gray(10), 4), Err(PipelineError::Disconnected)));
    }
}
