//! A capability-only service backed by a [`DeviceProfile`].
//!
//! Answers support queries the way the device would, but cannot open codecs.
//! Used by the `probe` command when the descriptor is generated off-device.

use std::sync::Arc;

use crate::config::DeviceProfile;
use crate::error::HalError;
use crate::hal::{CodecService, ColorFormatConstants, DecoderMetadata, EncoderMetadata, HwCodec};
use crate::video::VideoCodec;

#[derive(Debug, Clone)]
pub struct ProfileService {
    profile: DeviceProfile,
}

impl ProfileService {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }
}

impl CodecService for ProfileService {
    fn is_supported(&self, codec: VideoCodec, encoder: bool) -> bool {
        let list = if encoder {
            &self.profile.encoders
        } else {
            &self.profile.decoders
        };
        list.contains(&codec)
    }

    fn create_decoder(&self, _metadata: &DecoderMetadata) -> Result<Arc<dyn HwCodec>, HalError> {
        Err(HalError::Unavailable)
    }

    fn create_encoder(&self, _metadata: &EncoderMetadata) -> Result<Arc<dyn HwCodec>, HalError> {
        Err(HalError::Unavailable)
    }

    fn supported_color_formats(&self, codec: VideoCodec) -> Vec<u32> {
        if self.is_supported(codec, true) {
            self.profile.color_formats.clone()
        } else {
            Vec::new()
        }
    }

    fn color_format_constants(&self) -> ColorFormatConstants {
        self.profile.color_constants.unwrap_or_default()
    }
}
