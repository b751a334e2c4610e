use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hal::ColorFormatConstants;
use crate::probe::DescriptorInfo;
use crate::video::VideoCodec;

pub const CONFIG_ENV: &str = "GMP_HWCODEC_CONFIG";

/// Process settings, read once at startup and passed down explicitly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub descriptor: DescriptorInfo,
    pub device_profile: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            descriptor: DescriptorInfo::default(),
            device_profile: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings YAML: {}", path.display()))?;
        Ok(settings)
    }

    /// Explicit path first, then `GMP_HWCODEC_CONFIG`, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }
}

/// Static description of a device's hardware codecs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub decoders: Vec<VideoCodec>,
    #[serde(default)]
    pub encoders: Vec<VideoCodec>,
    /// Encoder input formats, most preferred first.
    #[serde(default)]
    pub color_formats: Vec<u32>,
    #[serde(default)]
    pub color_constants: Option<ColorFormatConstants>,
}

impl DeviceProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device profile: {}", path.display()))?;
        let profile: DeviceProfile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse device profile YAML: {}", path.display()))?;
        Ok(profile)
    }
}
