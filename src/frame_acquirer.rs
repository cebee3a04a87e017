// src/frame_acquirer.rs
//
// Single still captures. Each backend returns one decoded RGB frame or a
// typed `CaptureError`; callers skip the event on error.

use crate::types::{CameraBackend, CameraConfig, CapturedFrame};
use anyhow::Result;
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const REPLAY_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("trigger failed: {0}")]
    TriggerFailed(String),
    #[error("capture did not finish within {0:?}")]
    Timeout(Duration),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("capture produced no image data")]
    Empty,
    #[error("no more frames to replay")]
    Exhausted,
    #[error("camera device: {0}")]
    Device(String),
}

impl CaptureError {
    /// Short stage tag for diagnostics.
    pub fn reason(&self) -> &'static str {
        match self {
            CaptureError::TriggerFailed(_) => "trigger",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::Decode(_) => "decode",
            CaptureError::Empty => "empty",
            CaptureError::Exhausted => "exhausted",
            CaptureError::Device(_) => "device",
        }
    }
}

pub trait FrameAcquirer: Send {
    fn name(&self) -> &str;

    fn capture(&mut self) -> Result<CapturedFrame, CaptureError>;

    /// Free the device and any temporary files.
    fn release(&mut self) {}
}

/// Build the configured backend.
pub fn from_config(config: &CameraConfig) -> Result<Box<dyn FrameAcquirer>> {
    let camera: Box<dyn FrameAcquirer> = match config.backend {
        CameraBackend::StillCommand => Box::new(StillCommandCamera::new(config)),
        CameraBackend::Replay => Box::new(ReplayCamera::open(Path::new(&config.replay_dir))),
        #[cfg(feature = "opencv")]
        CameraBackend::VideoDevice => Box::new(VideoDeviceCamera::open(
            config.device_index,
            config.width,
            config.height,
        )?),
        #[cfg(not(feature = "opencv"))]
        CameraBackend::VideoDevice => {
            anyhow::bail!("camera backend video_device requires the `opencv` feature")
        }
    };
    info!("✓ Camera ready ({})", camera.name());
    Ok(camera)
}

/// Decode a capture file. Missing or zero-length output is `Empty`.
pub fn decode_file(path: &Path) -> Result<RgbImage, CaptureError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Err(CaptureError::Empty),
    }
    let image = ImageReader::open(path)
        .map_err(|e| CaptureError::Decode(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| CaptureError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Wait for `child`, killing it once `limit` has passed.
pub fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus, CaptureError> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Timeout(limit));
            }
            Ok(None) => std::thread::sleep(WAIT_SLICE),
            Err(e) => return Err(CaptureError::TriggerFailed(e.to_string())),
        }
    }
}

// ============================================================================
// STILL COMMAND (rpicam-still)
// ============================================================================

pub struct StillCommandCamera {
    command: String,
    width: u32,
    height: u32,
    temp_path: PathBuf,
    timeout_ms: u64,
    trigger_timeout: Duration,
}

impl StillCommandCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            command: config.command.clone(),
            width: config.width,
            height: config.height,
            temp_path: PathBuf::from(&config.temp_path),
            timeout_ms: config.timeout_ms,
            trigger_timeout: Duration::from_millis(config.trigger_timeout_ms),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            self.temp_path.display().to_string(),
            "--immediate".to_string(),
            "--nopreview".to_string(),
            "--width".to_string(),
            self.width.to_string(),
            "--height".to_string(),
            self.height.to_string(),
            "--timeout".to_string(),
            self.timeout_ms.to_string(),
        ]
    }
}

impl FrameAcquirer for StillCommandCamera {
    fn name(&self) -> &str {
        &self.command
    }

    fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        // A stale file from the previous capture must not be mistaken for this one.
        let _ = std::fs::remove_file(&self.temp_path);

        let mut child = Command::new(&self.command)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::TriggerFailed(format!("{}: {}", self.command, e)))?;

        let status = wait_with_deadline(&mut child, self.trigger_timeout)?;
        if !status.success() {
            return Err(CaptureError::TriggerFailed(format!(
                "{} exited with {}",
                self.command, status
            )));
        }

        let image = decode_file(&self.temp_path)?;
        debug!("captured {}x{}", image.width(), image.height());
        Ok(CapturedFrame::new(image))
    }

    fn release(&mut self) {
        if self.temp_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                warn!("capture: could not remove {}: {}", self.temp_path.display(), e);
            }
        }
    }
}

// ============================================================================
// DIRECTORY REPLAY
// ============================================================================

/// Serves image files from a directory tree in sorted order, one per capture.
pub struct ReplayCamera {
    name: String,
    files: Vec<PathBuf>,
    next: usize,
}

impl ReplayCamera {
    pub fn open(dir: &Path) -> Self {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| REPLAY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            warn!("capture: no replay images under {}", dir.display());
        } else {
            info!("Found {} replay images under {}", files.len(), dir.display());
        }

        Self {
            name: format!("replay:{}", dir.display()),
            files,
            next: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.files.len() - self.next
    }
}

impl FrameAcquirer for ReplayCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        let path = self.files.get(self.next).ok_or(CaptureError::Exhausted)?;
        self.next += 1;
        debug!("replaying {} ({} left)", path.display(), self.remaining());
        decode_file(path).map(CapturedFrame::new)
    }
}

// ============================================================================
// VIDEO DEVICE (OpenCV)
// ============================================================================

#[cfg(feature = "opencv")]
pub struct VideoDeviceCamera {
    name: String,
    cap: opencv::videoio::VideoCapture,
}

#[cfg(feature = "opencv")]
impl VideoDeviceCamera {
    pub fn open(index: i32, width: u32, height: u32) -> Result<Self, CaptureError> {
        use opencv::prelude::*;
        use opencv::videoio::{self, VideoCapture};

        let device = |e: opencv::Error| CaptureError::Device(e.to_string());
        let mut cap = VideoCapture::new(index, videoio::CAP_ANY).map_err(device)?;
        if !cap.is_opened().map_err(device)? {
            return Err(CaptureError::Device(format!("video device {} did not open", index)));
        }
        cap.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64).map_err(device)?;
        cap.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64).map_err(device)?;

        Ok(Self {
            name: format!("video{}", index),
            cap,
        })
    }
}

#[cfg(feature = "opencv")]
impl FrameAcquirer for VideoDeviceCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        use opencv::core::Mat;
        use opencv::imgproc;
        use opencv::prelude::*;

        let device = |e: opencv::Error| CaptureError::Device(e.to_string());
        let mut mat = Mat::default();
        if !self.cap.read(&mut mat).map_err(device)? || mat.empty() {
            return Err(CaptureError::Empty);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(|e| CaptureError::Decode(e.to_string()))?;
        let data = rgb
            .data_bytes()
            .map_err(|e| CaptureError::Decode(e.to_string()))?
            .to_vec();
        let image = RgbImage::from_raw(rgb.cols() as u32, rgb.rows() as u32, data)
            .ok_or_else(|| CaptureError::Decode("frame buffer size mismatch".to_string()))?;
        Ok(CapturedFrame::new(image))
    }

    fn release(&mut self) {
        use opencv::prelude::*;
        let _ = self.cap.release();
    }
}
