//! Shared domain models for the framewise workspace.
//!
//! This crate centralizes the frame and tensor data structures used across
//! the backend, filter, and CLI crates. Keep it backend-agnostic so all
//! crates can depend on it without pulling native inference SDKs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub mod tensor;

pub use tensor::{DYNAMIC_DIM, ElementType, Tensor, TensorData, TensorDesc, TensorLayout};

pub type FilterResult<T> = Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("{backend} backend failed to load model: {message}")]
    ModelLoad {
        backend: &'static str,
        message: String,
    },

    #[error("{backend} backend execution failed: {message}")]
    Execution {
        backend: &'static str,
        message: String,
    },

    #[error("resource exhausted: {message}")]
    Resource { message: String },

    #[error("operation on a stage that has already shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilterError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn model_load(backend: &'static str, message: impl Into<String>) -> Self {
        Self::ModelLoad {
            backend,
            message: message.into(),
        }
    }

    pub fn execution(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Execution {
            backend,
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }
}

/// Pixel formats accepted at the stage edge. Anything else is rejected
/// during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    GrayF32,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Yuv410p,
    Yuv411p,
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::GrayF32 => "grayf32",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Yuv410p => "yuv410p",
            PixelFormat::Yuv411p => "yuv411p",
        }
    }

    pub fn plane_count(self) -> usize {
        if self.is_planar_yuv() { 3 } else { 1 }
    }

    pub fn is_planar_yuv(self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420p
                | PixelFormat::Yuv422p
                | PixelFormat::Yuv444p
                | PixelFormat::Yuv410p
                | PixelFormat::Yuv411p
        )
    }

    /// Number of interleaved components in plane 0.
    pub fn packed_components(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            _ => 1,
        }
    }

    /// Bytes per stored sample component.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::GrayF32 => 4,
            _ => 1,
        }
    }

    /// log2 subsampling of the chroma planes, horizontal then vertical.
    /// Zero for formats without chroma planes.
    pub fn chroma_shift(self) -> (u32, u32) {
        match self {
            PixelFormat::Yuv420p => (1, 1),
            PixelFormat::Yuv422p => (1, 0),
            PixelFormat::Yuv444p => (0, 0),
            PixelFormat::Yuv410p => (2, 2),
            PixelFormat::Yuv411p => (2, 0),
            _ => (0, 0),
        }
    }

    /// Channel count this format presents to a model. Planar YUV runs only
    /// its luma plane through inference.
    pub fn model_channels(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            _ => 1,
        }
    }

    /// Row byte width and row count of the given plane for a frame of
    /// `width` x `height`.
    pub fn plane_geometry(self, width: u32, height: u32, plane: usize) -> (usize, usize) {
        if plane == 0 {
            let row_bytes = width as usize * self.packed_components() * self.bytes_per_sample();
            return (row_bytes, height as usize);
        }
        let (shift_x, shift_y) = self.chroma_shift();
        (
            ceil_rshift(width, shift_x),
            ceil_rshift(height, shift_y),
        )
    }
}

fn ceil_rshift(value: u32, shift: u32) -> usize {
    (value as usize + (1 << shift) - 1) >> shift
}

impl FromStr for PixelFormat {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" => Ok(PixelFormat::Rgb24),
            "bgr24" => Ok(PixelFormat::Bgr24),
            "gray8" => Ok(PixelFormat::Gray8),
            "grayf32" => Ok(PixelFormat::GrayF32),
            "yuv420p" => Ok(PixelFormat::Yuv420p),
            "yuv422p" => Ok(PixelFormat::Yuv422p),
            "yuv444p" => Ok(PixelFormat::Yuv444p),
            "yuv410p" => Ok(PixelFormat::Yuv410p),
            "yuv411p" => Ok(PixelFormat::Yuv411p),
            other => Err(FilterError::configuration(format!(
                "unsupported pixel format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image plane: contiguous rows of `stride` bytes each.
#[derive(Clone)]
pub struct Plane {
    stride: usize,
    data: Vec<u8>,
}

impl Plane {
    pub fn new(stride: usize, data: Vec<u8>) -> Self {
        Self { stride, data }
    }

    pub fn zeroed(stride: usize, rows: usize) -> Self {
        Self {
            stride,
            data: vec![0u8; stride * rows],
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn row(&self, index: usize) -> &[u8] {
        &self.data[index * self.stride..(index + 1) * self.stride]
    }
}

/// A decoded picture owned by exactly one pipeline stage at a time.
///
/// Ownership passes from upstream to the filter stage on submit and from the
/// stage to downstream on poll.
#[derive(Clone)]
pub struct VideoFrame {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
    timestamp: Option<Duration>,
    frame_index: Option<u64>,
    side_data: BTreeMap<String, String>,
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("format", &self.format.as_str())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("planes", &self.planes.len())
            .field("bytes", &self.planes.iter().map(|p| p.data.len()).sum::<usize>())
            .field("timestamp", &self.timestamp)
            .field("frame_index", &self.frame_index)
            .finish()
    }
}

impl VideoFrame {
    /// Allocate a zero-filled frame with tightly packed planes.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> FilterResult<Self> {
        if width == 0 || height == 0 {
            return Err(FilterError::configuration(format!(
                "invalid frame geometry {width}x{height}"
            )));
        }
        let planes = (0..format.plane_count())
            .map(|plane| {
                let (row_bytes, rows) = format.plane_geometry(width, height, plane);
                Plane::zeroed(row_bytes, rows)
            })
            .collect();
        Ok(Self {
            format,
            width,
            height,
            planes,
            timestamp: None,
            frame_index: None,
            side_data: BTreeMap::new(),
        })
    }

    /// Build a frame from caller-provided planes, validating each plane
    /// against the format geometry.
    pub fn from_planes(
        format: PixelFormat,
        width: u32,
        height: u32,
        planes: Vec<Plane>,
    ) -> FilterResult<Self> {
        if planes.len() != format.plane_count() {
            return Err(FilterError::configuration(format!(
                "{} expects {} planes, got {}",
                format,
                format.plane_count(),
                planes.len()
            )));
        }
        for (index, plane) in planes.iter().enumerate() {
            let (row_bytes, rows) = format.plane_geometry(width, height, index);
            if plane.stride < row_bytes {
                return Err(FilterError::configuration(format!(
                    "plane {index} stride {} is smaller than row width {row_bytes}",
                    plane.stride
                )));
            }
            let required = plane.stride.checked_mul(rows).ok_or_else(|| {
                FilterError::configuration("calculated plane length overflowed")
            })?;
            if plane.data.len() < required {
                return Err(FilterError::configuration(format!(
                    "insufficient plane {index} bytes: got {} expected at least {required}",
                    plane.data.len()
                )));
            }
        }
        Ok(Self {
            format,
            width,
            height,
            planes,
            timestamp: None,
            frame_index: None,
            side_data: BTreeMap::new(),
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut Plane {
        &mut self.planes[index]
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn frame_index(&self) -> Option<u64> {
        self.frame_index
    }

    pub fn with_timestamp(mut self, timestamp: Option<Duration>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_frame_index(mut self, index: Option<u64>) -> Self {
        self.frame_index = index;
        self
    }

    pub fn side_data(&self) -> &BTreeMap<String, String> {
        &self.side_data
    }

    pub fn side_data_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.side_data
    }

    /// Copy timestamp, frame index, and side data from another frame.
    /// Used when a transformed output frame inherits its input's metadata.
    pub fn copy_metadata_from(&mut self, other: &VideoFrame) {
        self.timestamp = other.timestamp;
        self.frame_index = other.frame_index;
        self.side_data = other.side_data.clone();
    }
}
