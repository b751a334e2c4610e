//! Video data exchanged between the host, the session and the hardware codec.
//!
//! Coded frames travel host → hardware, raw frames hardware → session, and
//! planar I420 frames session → host. Timestamps on the host side are in
//! microseconds; the hardware reports output timestamps in nanoseconds.

pub mod convert;
pub mod reframe;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

impl VideoCodec {
    /// Descriptor order.
    pub const ALL: [VideoCodec; 3] = [VideoCodec::H264, VideoCodec::Vp8, VideoCodec::Vp9];

    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::Vp8 => "video/x-vnd.on2.vp8",
            VideoCodec::Vp9 => "video/x-vnd.on2.vp9",
        }
    }

    /// Short tag used in the capability descriptor.
    pub fn tag(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
        }
    }
}

/// How NAL unit boundaries are encoded in a coded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferFraming {
    /// A single unit, or Annex B start codes already present.
    Single,
    Length8,
    Length16,
    Length32,
}

impl BufferFraming {
    /// Width of the big-endian length field, if the buffer is length-prefixed.
    pub fn length_size(self) -> Option<usize> {
        match self {
            BufferFraming::Single => None,
            BufferFraming::Length8 => Some(1),
            BufferFraming::Length16 => Some(2),
            BufferFraming::Length32 => Some(4),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub max_framerate: Option<u32>,
    /// Out-of-band codec initialisation data as handed over by the host.
    pub codec_data: Vec<u8>,
    /// Target bitrate in bits per second, encode only.
    pub bitrate: Option<u32>,
}

impl StreamConfig {
    pub fn new(codec: VideoCodec, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            max_framerate: None,
            codec_data: Vec::new(),
            bitrate: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodedFrame {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub duration: u64,
    pub key_frame: bool,
    pub framing: BufferFraming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub top: u32,
    pub left: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            top,
            left,
            right: left.saturating_add(width),
            bottom: top.saturating_add(height),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// A decoded buffer in the hardware's native layout.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub timestamp_ns: i64,
    pub stride: u32,
    pub slice_height: u32,
    pub crop: CropRect,
    /// Hardware colour format tag, compared against [`crate::hal::ColorFormatConstants`].
    pub color_format: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: u32,
}

/// I420 frame: full resolution Y followed by quarter resolution U and V.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanarFrame {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
    pub timestamp: i64,
    pub duration: u64,
}

/// Output of the hardware encoder before reframing.
#[derive(Debug, Clone)]
pub struct EncodedData {
    pub data: Vec<u8>,
    pub timestamp_ns: i64,
    pub key_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
}

/// Side information delivered along with every encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodecSpecificInfo {
    pub codec: VideoCodec,
    pub framing: BufferFraming,
}
