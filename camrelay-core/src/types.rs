//! Core types for camrelay
//!
//! These types represent the fundamental data structures used throughout
//! the capture, encode and transmit pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global handle counter for unique session IDs
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Create a new unique handle
    pub fn new() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw handle value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

/// Which camera to capture from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera, facing the user
    #[default]
    User,
    /// Rear camera, facing away from the user
    Environment,
}

impl FacingMode {
    /// Name used on the wire and in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Environment => "environment",
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "front" => Ok(Self::User),
            "environment" | "rear" | "back" => Ok(Self::Environment),
            _ => Err(format!("Unknown facing mode: {}", s)),
        }
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    /// Parse a `WIDTHxHEIGHT` string such as `1280x720`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution '{}', expected WIDTHxHEIGHT", s))?;
        let width: u32 = w
            .parse()
            .map_err(|_| format!("Invalid width in resolution '{}'", s))?;
        let height: u32 = h
            .parse()
            .map_err(|_| format!("Invalid height in resolution '{}'", s))?;
        if width == 0 || height == 0 {
            return Err(format!("Resolution '{}' must be non-zero", s));
        }
        Ok(Self { width, height })
    }
}

/// What to capture: camera facing mode and requested size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Camera facing mode
    pub facing: FacingMode,
    /// Requested capture width
    pub width: u32,
    /// Requested capture height
    pub height: u32,
}

impl SourceDescriptor {
    /// Create a descriptor
    pub fn new(facing: FacingMode, width: u32, height: u32) -> Self {
        Self {
            facing,
            width,
            height,
        }
    }

    /// Front camera at the given size
    pub fn front(width: u32, height: u32) -> Self {
        Self::new(FacingMode::User, width, height)
    }

    /// Rear camera at the given size
    pub fn rear(width: u32, height: u32) -> Self {
        Self::new(FacingMode::Environment, width, height)
    }

    /// Requested resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} camera @ {}x{}", self.facing, self.width, self.height)
    }
}

/// Pixel layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit B, G, R, A interleaved
    Bgra,
    /// Y plane followed by interleaved UV plane
    Nv12,
    /// Planar Y, U, V (4:2:0)
    I420,
}

impl PixelFormat {
    /// Bytes needed for a tightly packed frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Bgra => pixels * 4,
            Self::Nv12 | Self::I420 => pixels + pixels / 2,
        }
    }
}

/// Frame format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub pixel_format: PixelFormat,
    /// Stride of the first plane in bytes
    pub stride: u32,
}

impl FrameFormat {
    /// Tightly packed BGRA format
    pub fn bgra(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_format: PixelFormat::Bgra,
            stride: width * 4,
        }
    }
}

/// Release hook run exactly once when a frame is released
pub struct FrameLease(Option<Box<dyn FnOnce() + Send>>);

impl FrameLease {
    /// Create a lease that runs `release` when the frame goes away
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameLease")
    }
}

/// A captured video frame
///
/// Frames may hold buffers owned by the capture source. They are released
/// by [`Frame::release`] or when dropped, whichever comes first.
#[derive(Debug)]
pub struct Frame {
    /// Frame format
    pub format: FrameFormat,
    /// Pixel data
    pub data: Bytes,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    lease: Option<FrameLease>,
}

impl Frame {
    /// Create a frame without a release hook
    pub fn new(format: FrameFormat, data: Bytes, timestamp_us: u64) -> Self {
        Self {
            format,
            data,
            timestamp_us,
            lease: None,
        }
    }

    /// Attach a release hook
    pub fn with_lease(mut self, lease: FrameLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Release the frame and any source buffer backing it
    pub fn release(self) {
        drop(self);
    }
}
