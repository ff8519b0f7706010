//! Guest-side engine for the Hyper-V synthetic video device.
//!
//! The crate is split along the lines the host imposes:
//! - [`channel`] is the seam to the host's message transport ([`Transport`]) plus the
//!   [`PendingTransactions`] table transports use to correlate responses;
//! - [`device`] is the protocol state machine ([`SynthVideoDevice`]);
//! - [`worker`] runs the device on a dedicated thread so that explicit calls, the refresh timer
//!   and host notifications never interleave;
//! - [`modes`], [`dirty`] and [`cursor`] hold the pure logic the engine is built from.
#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod cursor;
pub mod device;
pub mod dirty;
pub mod error;
pub mod modes;
pub mod worker;

pub use channel::{PendingTransactions, Transport, TransportError};
pub use config::{ConfigError, ResolutionEntry, SynthVideoConfig};
pub use cursor::{CursorImage, CursorState};
pub use device::{
    dispatch_inbound, DeviceSnapshot, DeviceState, GraphicsInfo, ScreenState, SynthVideoDevice,
    VideoMemoryRegion, HYPERV_VRAM_BASE,
};
pub use dirty::{DirtyTracker, TILE_SIZE};
pub use error::{GfxError, Result};
pub use modes::{build_mode_catalog, validate_mode, DisplayMode, FALLBACK_MODE, STANDARD_MODES};
pub use worker::{SynthVideoHandle, SynthVideoWorker};
