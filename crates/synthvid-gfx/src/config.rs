//! Device configuration, read from the host's property document.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 50;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_UPDATE_RECTS: u8 = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid synthvid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// One entry of the `SupportedResolutions` property.
///
/// Both keys are optional so that a malformed entry only drops itself rather than the whole list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResolutionEntry {
    #[serde(rename = "Width", default)]
    pub width: Option<u32>,
    #[serde(rename = "Height", default)]
    pub height: Option<u32>,
}

impl ResolutionEntry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SynthVideoConfig {
    /// Overrides the MMIO size reported by the host.
    #[serde(rename = "VRAMSizeBytes", default)]
    pub vram_size_bytes: Option<u32>,

    /// Replaces the built-in mode list when present.
    #[serde(rename = "SupportedResolutions", default)]
    pub supported_resolutions: Option<Vec<ResolutionEntry>>,

    #[serde(rename = "RefreshIntervalMs", default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    #[serde(rename = "ResponseTimeoutMs", default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(rename = "MaxUpdateRects", default = "default_max_update_rects")]
    pub max_update_rects: u8,
}

fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_max_update_rects() -> u8 {
    DEFAULT_MAX_UPDATE_RECTS
}

impl Default for SynthVideoConfig {
    fn default() -> Self {
        Self {
            vram_size_bytes: None,
            supported_resolutions: None,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            max_update_rects: DEFAULT_MAX_UPDATE_RECTS,
        }
    }
}

impl SynthVideoConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Never zero, so the refresh timer cannot spin.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Rectangles per image update, never zero.
    pub fn max_update_rects(&self) -> usize {
        usize::from(self.max_update_rects.max(1))
    }
}
