//! Display mode validation and the list of modes advertised to the display layer.

use synthvid_protocol::{ProtocolVersion, MIN_HEIGHT, MIN_WIDTH};

use crate::config::ResolutionEntry;
use crate::error::{GfxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
}

impl DisplayMode {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Advertised when nothing else survives validation.
pub const FALLBACK_MODE: DisplayMode = DisplayMode::new(1024, 768);

pub const STANDARD_MODES: [DisplayMode; 17] = [
    DisplayMode::new(640, 480),
    DisplayMode::new(800, 600),
    DisplayMode::new(1024, 768),
    DisplayMode::new(1152, 864),
    DisplayMode::new(1280, 720),
    DisplayMode::new(1280, 1024),
    DisplayMode::new(1366, 768),
    DisplayMode::new(1440, 900),
    DisplayMode::new(1600, 900),
    DisplayMode::new(1600, 1200),
    DisplayMode::new(1680, 1050),
    DisplayMode::new(1920, 1080),
    DisplayMode::new(1920, 1200),
    DisplayMode::new(2560, 1440),
    DisplayMode::new(3840, 2160),
    DisplayMode::new(5120, 2880),
    DisplayMode::new(7680, 4320),
];

/// Bytes of VRAM a `width` x `height` framebuffer needs at `version`'s bit depth.
pub fn required_vram(width: u32, height: u32, version: ProtocolVersion) -> u64 {
    (u64::from(width) * u64::from(height))
        .saturating_mul(u64::from(version.limits().bytes_per_pixel()))
}

/// The checks every mode must pass before it is advertised or set, in this order:
/// version maximum, fixed minimum, VRAM fit.
pub fn validate_mode(
    width: u32,
    height: u32,
    version: ProtocolVersion,
    vram_len: u64,
) -> Result<()> {
    let limits = version.limits();
    if width > limits.max_width || height > limits.max_height {
        return Err(GfxError::BadArgument(format!(
            "{width}x{height} exceeds the {}x{} maximum of protocol {version}",
            limits.max_width, limits.max_height
        )));
    }
    if width < MIN_WIDTH || height < MIN_HEIGHT {
        return Err(GfxError::BadArgument(format!(
            "{width}x{height} is below the {MIN_WIDTH}x{MIN_HEIGHT} minimum"
        )));
    }
    let required = required_vram(width, height, version);
    if required > vram_len {
        return Err(GfxError::NoMemory {
            required,
            available: vram_len,
        });
    }
    Ok(())
}

/// Builds the list of modes the display layer may offer.
///
/// Configured resolutions win if any of them are valid; otherwise the standard list is filtered;
/// if that is empty too, the fallback mode is returned without validation. The result is never
/// empty.
pub fn build_mode_catalog(
    candidates: Option<&[ResolutionEntry]>,
    version: ProtocolVersion,
    vram_len: u64,
) -> Vec<DisplayMode> {
    if let Some(entries) = candidates {
        let configured = entries.iter().filter_map(|entry| match (entry.width, entry.height) {
            (Some(width), Some(height)) => Some(DisplayMode::new(width, height)),
            _ => {
                tracing::debug!(?entry, "skipping incomplete resolution entry");
                None
            }
        });
        match collect_valid(entries.len(), configured, version, vram_len) {
            Some(modes) if !modes.is_empty() => return modes,
            Some(_) => tracing::warn!("no configured resolution is usable, using standard modes"),
            None => tracing::warn!("failed to allocate configured mode list"),
        }
    }

    match collect_valid(
        STANDARD_MODES.len(),
        STANDARD_MODES.iter().copied(),
        version,
        vram_len,
    ) {
        Some(modes) if !modes.is_empty() => return modes,
        Some(_) => tracing::warn!(%version, vram_len, "no standard mode fits"),
        None => tracing::warn!("failed to allocate standard mode list"),
    }

    vec![FALLBACK_MODE]
}

/// Returns `None` if the working list could not be allocated.
fn collect_valid(
    capacity: usize,
    modes: impl Iterator<Item = DisplayMode>,
    version: ProtocolVersion,
    vram_len: u64,
) -> Option<Vec<DisplayMode>> {
    let mut out = Vec::new();
    out.try_reserve(capacity).ok()?;
    for mode in modes {
        match validate_mode(mode.width, mode.height, version, vram_len) {
            Ok(()) => out.push(mode),
            Err(err) => tracing::debug!(
                width = mode.width,
                height = mode.height,
                "mode rejected: {err}"
            ),
        }
    }
    Some(out)
}
