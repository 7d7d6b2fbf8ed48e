//! rollcall-hw: camera capture for attendance sessions.
//!
//! Provides V4L2-based camera access producing RGB frames on demand.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
