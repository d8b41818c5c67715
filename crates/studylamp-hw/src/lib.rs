//! studylamp-hw — Camera capture for presence detection.
//!
//! Provides V4L2 camera access, RGB frame conversion, and a session manager
//! that owns the capture device exclusively.

pub mod backoff;
pub mod camera;
pub mod frame;
pub mod session;

pub use backoff::Backoff;
pub use camera::{Camera, CameraError, CaptureConstraints, FacingMode, PixelFormat, V4l2Device};
pub use frame::Frame;
pub use session::{CameraSessionManager, CaptureDevice, CaptureState, FrameSource, VideoTrack};
