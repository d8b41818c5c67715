//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::session::{CaptureDevice, VideoTrack};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl CameraError {
    /// Permission errors are final; everything else is worth retrying.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CameraError::PermissionDenied(_))
    }
}

/// Map an `open(2)` failure on a video node to a camera error.
fn classify_open_error(device_path: &str, e: io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => {
            CameraError::PermissionDenied(device_path.to_string())
        }
        Some(libc::EBUSY) => CameraError::DeviceBusy,
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
        _ if e.kind() == io::ErrorKind::PermissionDenied => {
            CameraError::PermissionDenied(device_path.to_string())
        }
        _ => CameraError::CaptureFailed(format!("{device_path}: {e}")),
    }
}

/// Which way the camera should face the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    /// The built-in camera looking at the person at the desk.
    #[default]
    User,
    /// An external/rear camera.
    Environment,
}

/// What the caller asks for when starting a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Explicit device node; overrides facing-mode selection.
    pub device: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 320,
            ideal_height: 240,
            device: None,
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

impl DeviceInfo {
    /// Heuristic: laptop/monitor webcams advertise themselves as integrated or front-facing.
    fn looks_user_facing(&self) -> bool {
        let name = self.name.to_lowercase();
        ["integrated", "front", "facetime", "webcam"]
            .iter()
            .any(|k| name.contains(k))
    }
}

/// Pick a device node for the requested facing mode.
fn select_device(devices: &[DeviceInfo], facing: FacingMode) -> Option<&DeviceInfo> {
    let preferred = devices.iter().find(|d| match facing {
        FacingMode::User => d.looks_user_facing(),
        FacingMode::Environment => !d.looks_user_facing(),
    });
    preferred.or_else(|| devices.first())
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// Packed RGB24 (3 bytes/pixel).
    Rgb24,
}

/// V4L2 camera device handle. Dropping it closes the device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path, asking for the given resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device =
            Device::with_path(device_path).map_err(|e| classify_open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb24
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or RGB3)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single frame as RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let rgb = self.buf_to_rgb(buf)?;
        Ok(Frame::from_rgb(rgb, self.width, self.height, meta.sequence))
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
            PixelFormat::Rgb24 => {
                let expected = (self.width * self.height * 3) as usize;
                if buf.len() < expected {
                    Err(frame::FrameError::InvalidLength {
                        expected,
                        actual: buf.len(),
                    })
                } else {
                    Ok(buf[..expected].to_vec())
                }
            }
        };
        converted.map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format))
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl VideoTrack for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn label(&self) -> &str {
        &self.device_path
    }
}

/// The system's V4L2 cameras as a [`CaptureDevice`].
#[derive(Debug, Clone, Default)]
pub struct V4l2Device {
    /// Frames discarded after opening, for auto-exposure to settle.
    pub warmup_frames: usize,
}

impl V4l2Device {
    pub fn new(warmup_frames: usize) -> Self {
        Self { warmup_frames }
    }
}

impl CaptureDevice for V4l2Device {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn VideoTrack>, CameraError> {
        let path = match &constraints.device {
            Some(path) => path.clone(),
            None => {
                let devices = Camera::list_devices();
                select_device(&devices, constraints.facing)
                    .map(|d| d.path.clone())
                    .ok_or_else(|| CameraError::DeviceNotFound("no video capture devices".into()))?
            }
        };

        let camera = Camera::open(&path, constraints.ideal_width, constraints.ideal_height)?;

        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                let _ = camera.capture_frame();
            }
        }

        Ok(Box::new(camera))
    }
}
