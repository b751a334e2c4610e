//! Interface to the device's asynchronous hardware codec service.
//!
//! The service is injected into every session; nothing in the crate reaches
//! for a process-wide platform handle. Callbacks registered through
//! [`HwCodec::set_listener`] may fire on any thread owned by the service.

pub mod loopback;
pub mod profile;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::video::{CropRect, EncodedData, RawFrame, VideoCodec};

/// Colour format tags as the service numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorFormatConstants {
    pub yuv420_planar: u32,
    pub yuv420_semi_planar: u32,
    pub yuv420_packed_semi_planar_32m: u32,
}

impl Default for ColorFormatConstants {
    fn default() -> Self {
        Self {
            yuv420_planar: 0x13,
            yuv420_semi_planar: 0x15,
            yuv420_packed_semi_planar_32m: 0x7fa3_0c04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderMetadata {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: Option<u32>,
    /// AVCC parameter sets for H.264, empty otherwise.
    pub codec_data: Vec<u8>,
    pub hardware_only: bool,
    pub no_media_buffer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderMetadata {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: Option<u32>,
    pub bitrate: Option<u32>,
    pub color_format: u32,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A buffer handed to the codec together with its release function.
///
/// The release function runs exactly once: either through [`InputBuffer::release`]
/// or when the buffer is dropped without being released.
pub struct InputBuffer {
    data: Vec<u8>,
    timestamp: i64,
    sync: bool,
    release: Option<ReleaseFn>,
}

impl InputBuffer {
    pub fn new(
        data: Vec<u8>,
        timestamp: i64,
        sync: bool,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            data,
            timestamp,
            sync,
            release: Some(Box::new(release)),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputBuffer")
            .field("len", &self.data.len())
            .field("timestamp", &self.timestamp)
            .field("sync", &self.sync)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Receiver for events raised by a running codec.
pub trait CodecListener: Send + Sync {
    fn on_size_changed(&self, _width: u32, _height: u32) {}
    fn on_error(&self, code: i32);
    fn on_end_of_stream(&self) {}
    fn on_frame_decoded(&self, _frame: RawFrame) {}
    fn on_data_available(&self, _data: EncodedData) {}
}

/// One open hardware codec handle.
pub trait HwCodec: Send + Sync {
    /// Registers (or with `None`, removes) the event receiver.
    fn set_listener(&self, listener: Option<Arc<dyn CodecListener>>);
    fn start(&self) -> Result<(), HalError>;
    /// May block while the codec's input queue is full.
    fn queue(&self, buffer: InputBuffer);
    fn drain(&self);
    fn stop(&self);
    fn destroy(&self);
}

/// Conversion handle offered by the service for its own output layouts.
pub trait NativeConverter: Send {
    fn set_crop_rect(&mut self, crop: CropRect, stride: u32, slice_height: u32);
    /// Writes `width * height * 3 / 2` bytes of I420 into `output`.
    fn convert_to_i420(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), HalError>;
}

pub trait CodecService: Send + Sync {
    fn init(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn deinit(&self) {}

    /// Whether a hardware-only codec of this kind exists on the device.
    fn is_supported(&self, codec: VideoCodec, encoder: bool) -> bool;

    fn create_decoder(&self, metadata: &DecoderMetadata) -> Result<Arc<dyn HwCodec>, HalError>;

    fn create_encoder(&self, metadata: &EncoderMetadata) -> Result<Arc<dyn HwCodec>, HalError>;

    /// Encoder input formats, most preferred first.
    fn supported_color_formats(&self, codec: VideoCodec) -> Vec<u32>;

    fn color_format_constants(&self) -> ColorFormatConstants {
        ColorFormatConstants::default()
    }

    fn create_converter(&self) -> Option<Box<dyn NativeConverter>> {
        None
    }
}
