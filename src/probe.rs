//! Capability descriptor consumed by the host at plugin discovery.
//!
//! The text form is a fixed external contract:
//!
//! ```text
//! Name: gmp-droid
//! Description: gst-droid GMP plugin for Gecko
//! Version: 0.1
//! APIs: decode-video[h264:vp8:vp9]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hal::CodecService;
use crate::registry::{DECODE_VIDEO_API, ENCODE_VIDEO_API};
use crate::video::VideoCodec;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DescriptorInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl Default for DescriptorInfo {
    fn default() -> Self {
        Self {
            name: "gmp-droid".to_string(),
            description: "gst-droid GMP plugin for Gecko".to_string(),
            version: "0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityDescriptor {
    pub info: DescriptorInfo,
    pub decoders: Vec<VideoCodec>,
    pub encoders: Vec<VideoCodec>,
}

impl CapabilityDescriptor {
    /// Asks the service about every known codec, in descriptor order.
    pub fn probe(service: &dyn CodecService, info: DescriptorInfo) -> Self {
        let decoders: Vec<_> = VideoCodec::ALL
            .into_iter()
            .filter(|codec| service.is_supported(*codec, false))
            .collect();
        let encoders: Vec<_> = VideoCodec::ALL
            .into_iter()
            .filter(|codec| service.is_supported(*codec, true))
            .collect();
        info!(
            decoders = decoders.len(),
            encoders = encoders.len(),
            "Probed hardware codecs"
        );
        Self {
            info,
            decoders,
            encoders,
        }
    }

    pub fn render(&self) -> String {
        let mut apis = format!("{}[{}]", DECODE_VIDEO_API, join_tags(&self.decoders));
        if !self.encoders.is_empty() {
            apis.push_str(&format!(
                ", {}[{}]",
                ENCODE_VIDEO_API,
                join_tags(&self.encoders)
            ));
        }
        format!(
            "Name: {}\nDescription: {}\nVersion: {}\nAPIs: {}\n",
            self.info.name, self.info.description, self.info.version, apis
        )
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .with_context(|| format!("Failed to write descriptor: {}", path.display()))
    }
}

fn join_tags(codecs: &[VideoCodec]) -> String {
    codecs
        .iter()
        .map(|codec| codec.tag())
        .collect::<Vec<_>>()
        .join(":")
}
