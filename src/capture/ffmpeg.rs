//! Video file decoding through the `ffmpeg` command-line tool.

use super::CaptureBackend;
use crate::frame::VideoSample;
use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Decodes a file to raw NV12 on a background thread.
pub struct FfmpegDecoder {
    frames: Receiver<VideoSample>,
    width: u32,
    height: u32,
    fps: f32,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FfmpegDecoder {
    /// Probe `path` and start decoding. With `looping` the file restarts at
    /// the end and timestamps keep increasing.
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.to_str().ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;
        info!("Opening video via ffmpeg CLI: {:?}", path);

        let output = Command::new("ffprobe")
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,r_frame_rate", "-of", "csv=p=0", path_str])
            .output()
            .context("Failed to run ffprobe")?;
        if !output.status.success() {
            return Err(anyhow!("ffprobe failed: {}", String::from_utf8_lossy(&output.stderr)));
        }
        let (width, height, fps) = parse_probe(&String::from_utf8(output.stdout)?)?;
        info!("Video: {}x{} at {:.2} fps", width, height, fps);

        // Small bound so decoding never runs far ahead of ingestion.
        let (tx, frames) = sync_channel(4);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("veneer-ffmpeg".to_string())
                .spawn(move || decode_loop(path, width, height, fps, looping, tx, stop))?
        };

        Ok(Self { frames, width, height, fps, stop, thread: Some(thread) })
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

impl CaptureBackend for FfmpegDecoder {
    fn next_sample(&mut self) -> Result<Option<VideoSample>> {
        // A closed channel means the decoder reached the end.
        Ok(self.frames.recv().ok())
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock a pending send so the thread sees the flag.
        while self.frames.try_recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Bytes of one tightly packed NV12 frame.
fn nv12_frame_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + w.div_ceil(2) * 2 * h.div_ceil(2)
}

fn parse_probe(stdout: &str) -> Result<(u32, u32, f32)> {
    let parts: Vec<&str> = stdout.trim().split(',').collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid ffprobe output: {}", stdout));
    }
    let width = parts[0].trim().parse().context("ffprobe width")?;
    let height = parts[1].trim().parse().context("ffprobe height")?;
    let fps = parts.get(2).map_or(30.0, |p| parse_fps(p.trim()));
    Ok((width, height, fps))
}

fn parse_fps(s: &str) -> f32 {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let n: f32 = num.parse().unwrap_or(0.0);
            let d: f32 = den.parse().unwrap_or(1.0);
            if d == 0.0 {
                0.0
            } else {
                n / d
            }
        }
        None => s.parse().unwrap_or(0.0),
    };
    if fps > 0.0 {
        fps
    } else {
        30.0
    }
}

fn spawn_ffmpeg(path: &Path) -> Result<Child> {
    let child = Command::new("ffmpeg")
        .args(["-v", "error", "-i"])
        .arg(path)
        .args(["-f", "rawvideo", "-pix_fmt", "nv12", "-"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn ffmpeg")?;
    Ok(child)
}

fn decode_loop(
    path: PathBuf,
    width: u32,
    height: u32,
    fps: f32,
    looping: bool,
    tx: SyncSender<VideoSample>,
    stop: Arc<AtomicBool>,
) {
    let frame_len = nv12_frame_len(width, height);
    let luma_len = width as usize * height as usize;
    let frame_duration = Duration::from_secs_f32(1.0 / fps);
    let mut index: u32 = 0;

    loop {
        let mut child = match spawn_ffmpeg(&path) {
            Ok(child) => child,
            Err(e) => {
                error!("{:#}", e);
                return;
            }
        };
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    error!("ffmpeg: {}", line);
                }
            });
        }
        let Some(mut stdout) = child.stdout.take() else {
            error!("ffmpeg stdout unavailable");
            let _ = child.kill();
            return;
        };

        let mut decoded_any = false;
        loop {
            if stop.load(Ordering::SeqCst) {
                let _ = child.kill();
                return;
            }
            let mut buffer = vec![0u8; frame_len];
            if let Err(e) = stdout.read_exact(&mut buffer) {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("Error reading from ffmpeg: {}", e);
                }
                break;
            }
            decoded_any = true;

            let chroma = buffer.split_off(luma_len);
            let sample = VideoSample::nv12(width, height, buffer, chroma).with_timestamp(frame_duration * index);
            index += 1;
            if tx.send(sample).is_err() {
                let _ = child.kill();
                return;
            }
        }

        let _ = child.wait();
        if !looping || !decoded_any {
            info!("Video ended after {} frames", index);
            return;
        }
        info!("Video loop restarting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_output() {
        assert_eq!(parse_probe("1920,1080,30000/1001\n").unwrap().0, 1920);
        let (_, _, fps) = parse_probe("640,480,30000/1001").unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(parse_probe("640,480,0/0").unwrap().2, 30.0);
        assert_eq!(parse_probe("320,240").unwrap(), (320, 240, 30.0));
        assert!(parse_probe("N/A").is_err());
    }

    #[test]
    fn test_nv12_frame_len_rounds_chroma_up() {
        assert_eq!(nv12_frame_len(4, 2), 8 + 4);
        assert_eq!(nv12_frame_len(5, 3), 15 + 6 * 2);
    }
}
