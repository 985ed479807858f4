//! Veneer CLI: beautify a camera, a video file or a test pattern.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use veneer::capture::{CaptureBackend, FfmpegDecoder, NokhwaCapture, Pattern, SyntheticSource};
use veneer::color::ConversionProfile;
use veneer::config::{Config, ConfigWatcher};
use veneer::gpu::{CpuContext, GpuContext, WgpuContext};
use veneer::ingest::{FrameSource, RateMeter, SubmitOutcome};
use veneer::output::{FrameSink, NullSink, PngSequenceSink};
use veneer::PipelineError;

/// Wait before asking a failing camera again.
const CAPTURE_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Software reference renderer
    Cpu,
    /// wgpu on the default adapter
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProfileArg {
    Bt601Limited,
    Bt601Full,
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PatternArg {
    Solid,
    Gradient,
    SkinEdge,
}

/// Real-time beautify pipeline.
#[derive(Parser, Debug)]
#[command(name = "veneer")]
#[command(about = "Smooth skin while keeping detail edges, in real time")]
struct Args {
    /// Camera device index (overrides the config file)
    #[arg(short, long)]
    input: Option<u32>,

    /// Decode a video file instead of opening a camera
    #[arg(long, conflicts_with = "synthetic")]
    video: Option<PathBuf>,

    /// Restart the video at its end
    #[arg(long = "loop", requires = "video")]
    looping: bool,

    /// Use a generated test pattern instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// Test pattern for --synthetic
    #[arg(long, value_enum, default_value = "skin-edge")]
    pattern: PatternArg,

    /// YAML configuration file, watched for changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write every output frame as PNG into this directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Stop after this many samples
    #[arg(long)]
    frames: Option<u64>,

    /// Rendering backend
    #[arg(long, value_enum, default_value = "wgpu")]
    backend: Backend,

    /// Conversion profile (overrides the config file)
    #[arg(long, value_enum)]
    profile: Option<ProfileArg>,

    /// Frame width
    #[arg(long)]
    width: Option<u32>,

    /// Frame height
    #[arg(long)]
    height: Option<u32>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.list_devices {
        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => eprintln!("Failed to list devices: {}", e),
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    info!("Starting Veneer...");
    run(args, config)
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(input) = args.input {
        config.capture.device = input;
    }
    if let Some(width) = args.width {
        config.capture.width = width;
    }
    if let Some(height) = args.height {
        config.capture.height = height;
    }
}

fn profile_override(args: &Args) -> Option<ConversionProfile> {
    args.profile.map(|p| match p {
        ProfileArg::Bt601Limited => ConversionProfile::Bt601Limited,
        ProfileArg::Bt601Full => ConversionProfile::Bt601Full,
        ProfileArg::Bt709 => ConversionProfile::Bt709,
    })
}

fn open_capture(args: &Args, config: &Config) -> Result<(Box<dyn CaptureBackend>, Option<Duration>)> {
    let capture = &config.capture;
    let interval = Duration::from_secs(1) / capture.fps.max(1);
    if let Some(path) = &args.video {
        let decoder = FfmpegDecoder::open(path, args.looping)?;
        let pace = Duration::from_secs_f32(1.0 / decoder.fps());
        return Ok((Box::new(decoder), Some(pace)));
    }
    if args.synthetic {
        let pattern = match args.pattern {
            PatternArg::Solid => Pattern::Solid { y: 128, cb: 128, cr: 128 },
            PatternArg::Gradient => Pattern::Gradient,
            PatternArg::SkinEdge => Pattern::SkinEdge,
        };
        let source = SyntheticSource::new(pattern, capture.width, capture.height, capture.fps);
        return Ok((Box::new(source), Some(interval)));
    }
    info!("Opening camera device {}...", capture.device);
    // The camera paces itself.
    Ok((Box::new(NokhwaCapture::open(*capture)?), None))
}

/// How long to back off after a failed capture: one frame for paced
/// sources, [`CAPTURE_RETRY`] for cameras.
fn retry_delay(pace: Option<Duration>) -> Duration {
    pace.unwrap_or(CAPTURE_RETRY).max(Duration::from_millis(1))
}

fn run(args: Args, config: Config) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let ctx: Arc<dyn GpuContext> = match args.backend {
        Backend::Cpu => Arc::new(CpuContext::new()),
        Backend::Wgpu => Arc::new(WgpuContext::new()?),
    };
    info!("Rendering with {}", ctx.backend_name());

    let sink: Box<dyn FrameSink> = match &args.output_dir {
        Some(dir) => Box::new(PngSequenceSink::new(dir)?),
        None => Box::new(NullSink),
    };

    let mut ingest = config.ingest_config()?;
    if let Some(profile) = profile_override(&args) {
        ingest.profile = profile;
    }
    let mut source = FrameSource::spawn(ctx, ingest, sink)?;

    let (mut capture, pace) = open_capture(&args, &config)?;
    let (width, height) = capture.frame_size();
    info!("Capturing {}x{}", width, height);

    let mut watcher = args.config.as_deref().and_then(ConfigWatcher::new);
    let mut meter = RateMeter::default();
    let mut submitted = 0u64;

    while running.load(Ordering::SeqCst) {
        let frame_start = Instant::now();

        if let Some((old, new)) = watcher.as_mut().and_then(|w| w.check_for_changes()) {
            apply_config(&source, old.as_ref(), &new);
        }

        match source.submit_next(capture.as_mut()) {
            Ok(Some(Ok(SubmitOutcome::Accepted(sequence)))) => debug!("Submitted frame {}", sequence),
            Ok(Some(Ok(SubmitOutcome::Skipped))) => {}
            Ok(Some(Err(PipelineError::Disconnected))) => {
                error!("Render thread stopped");
                break;
            }
            Ok(Some(Err(e))) => warn!("Frame rejected ({}): {}", e.kind(), e),
            Ok(None) => {
                info!("Source ended");
                break;
            }
            Err(e) => {
                error!("Capture error: {:#}", e);
                thread::sleep(retry_delay(pace));
                continue;
            }
        }

        submitted += 1;
        if args.frames.is_some_and(|limit| submitted >= limit) {
            break;
        }
        if let Some(rate) = meter.tick() {
            info!(
                "Submitting {:.1} FPS | pipeline {} FPS | {} dropped",
                rate,
                source.frame_rate(),
                source.frames_dropped()
            );
        }

        if let Some(pace) = pace {
            let elapsed = frame_start.elapsed();
            if elapsed < pace {
                thread::sleep(pace - elapsed);
            }
        }
    }

    if !source.wait_idle(Duration::from_secs(5)) {
        warn!("Last frame did not finish in time");
    }
    info!(
        "{} frames rendered, {} dropped, {} FPS",
        source.frames_captured(),
        source.frames_dropped(),
        source.frame_rate()
    );
    source.shutdown();
    Ok(())
}

/// Apply a reloaded configuration between frames. Capture settings need a
/// restart and are ignored.
fn apply_config(source: &FrameSource, old: Option<&Config>, new: &Config) {
    if old.map(|c| &c.capture) != Some(&new.capture) {
        warn!("Capture settings changed; restart to apply them");
    }
    match new.ingest.profile.to_profile() {
        Ok(profile) if profile != source.profile() => source.set_profile(profile),
        Ok(_) => {}
        Err(e) => error!("Ignoring conversion profile: {}", e),
    }
    if old.map(|c| &c.beautify) != Some(&new.beautify) {
        if let Err(e) = source.set_beautify_params(new.beautify) {
            error!("Ignoring beautify parameters: {}", e);
        }
    }
    source.set_paused(new.ingest.paused);
    source.set_output_rotation(new.ingest.output_rotation);
    source.set_busy_policy(new.ingest.busy_policy());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_captures_back_off() {
        assert_eq!(retry_delay(None), CAPTURE_RETRY);
        assert_eq!(retry_delay(Some(Duration::from_millis(33))), Duration::from_millis(33));
        assert!(retry_delay(Some(Duration::ZERO)) > Duration::ZERO);
    }
}
