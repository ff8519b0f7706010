//! The graphics bridge: publishes the synthvid framebuffer as a PCI display function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use synthvid_gfx::{GfxError, GraphicsInfo, SynthVideoDevice, SynthVideoHandle, Transport};
use thiserror::Error;

use crate::config::FakePciConfigSpace;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("synthvid graphics bridge requires a generation 2 VM")]
    NotGeneration2,

    #[error("framebuffer at {base:#x} (+{length:#x}) does not fit a 32-bit BAR")]
    FramebufferOutOfRange { base: u64, length: u64 },

    #[error("bus registration failed: {0}")]
    Registration(String),

    #[error(transparent)]
    Graphics(#[from] GfxError),
}

/// The framebuffer the firmware left behind (GOP / boot console).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleFramebuffer {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub row_bytes: u32,
}

impl ConsoleFramebuffer {
    pub fn byte_len(&self) -> u64 {
        u64::from(self.height) * u64::from(self.row_bytes)
    }
}

/// Whatever can bring synthvid up and report where VRAM is.
pub trait FramebufferProvider {
    fn init_graphics(&mut self) -> Result<GraphicsInfo, GfxError>;
}

impl<T: Transport> FramebufferProvider for SynthVideoHandle<T> {
    fn init_graphics(&mut self) -> Result<GraphicsInfo, GfxError> {
        SynthVideoHandle::init_graphics(self)
    }
}

impl<T: Transport> FramebufferProvider for SynthVideoDevice<T> {
    fn init_graphics(&mut self) -> Result<GraphicsInfo, GfxError> {
        SynthVideoDevice::init_graphics(self)
    }
}

/// The host's generic PCI bus layer.
pub trait BusRegistration {
    fn is_generation2(&self) -> bool;

    /// Attaches the bridge and returns the secondary bus number assigned to it. From here on the
    /// bus layer may forward config accesses to the bridge at any time.
    fn register_child_bridge(&self, bridge: Arc<GraphicsBridge>) -> Result<u8, BridgeError>;

    fn add_bridge_memory_range(&self, bus: u8, base: u64, length: u64) -> Result<(), BridgeError>;
}

#[derive(Debug)]
pub struct GraphicsBridge {
    config: FakePciConfigSpace,
    framebuffer_base: u64,
    bus: OnceLock<u8>,
    grown: AtomicBool,
}

impl GraphicsBridge {
    /// Checks whether the bridge can attach at all.
    pub fn probe(bus: &dyn BusRegistration) -> Result<(), BridgeError> {
        if !bus.is_generation2() {
            tracing::debug!("not a generation 2 VM, synthvid bridge not needed");
            return Err(BridgeError::NotGeneration2);
        }
        Ok(())
    }

    /// Creates the bridge over the console framebuffer and registers it with `bus`.
    ///
    /// BAR0 covers the console framebuffer, or the whole VRAM if synthvid is already up and
    /// reports more.
    pub fn start(
        console: ConsoleFramebuffer,
        provider: &mut dyn FramebufferProvider,
        bus: &dyn BusRegistration,
    ) -> Result<Arc<Self>, BridgeError> {
        Self::probe(bus)?;

        let mut length = console.byte_len();
        match provider.init_graphics() {
            Ok(info) => {
                if info.vram_base != console.base {
                    tracing::warn!(
                        console_base = console.base,
                        vram_base = info.vram_base,
                        "console framebuffer is not at the synthvid VRAM base"
                    );
                }
                length = length.max(info.vram_length);
            }
            Err(err) => tracing::warn!("synthvid not ready at bridge start: {err}"),
        }

        let (base32, length32) = bar_fields(console.base, length)?;
        let bridge = Arc::new(Self {
            config: FakePciConfigSpace::new(base32, length32),
            framebuffer_base: console.base,
            bus: OnceLock::new(),
            grown: AtomicBool::new(false),
        });

        let bus_number = bus.register_child_bridge(Arc::clone(&bridge))?;
        // Set exactly once, here.
        let _ = bridge.bus.set(bus_number);
        bus.add_bridge_memory_range(bus_number, console.base, length)?;

        tracing::info!(
            bus = bus_number,
            base = console.base,
            length,
            "synthvid graphics bridge started"
        );
        Ok(bridge)
    }

    /// Called once synthvid finished initializing. Grows BAR0 to the full VRAM size, once.
    ///
    /// Returns whether BAR0 changed.
    pub fn graphics_ready(
        &self,
        provider: &mut dyn FramebufferProvider,
    ) -> Result<bool, BridgeError> {
        if self.grown.load(Ordering::Acquire) {
            return Ok(false);
        }

        let info = provider.init_graphics()?;
        let current = u64::from(self.config.bar0_length());
        if info.vram_length <= current {
            self.grown.store(true, Ordering::Release);
            return Ok(false);
        }

        let (_, length) = bar_fields(self.framebuffer_base, info.vram_length)?;
        self.config.set_bar0_length(length);
        self.grown.store(true, Ordering::Release);
        tracing::info!(from = current, to = info.vram_length, "grew synthvid BAR0");
        Ok(true)
    }

    pub fn bus_number(&self) -> Option<u8> {
        self.bus.get().copied()
    }

    pub fn framebuffer_base(&self) -> u64 {
        self.framebuffer_base
    }

    pub fn framebuffer_length(&self) -> u64 {
        u64::from(self.config.bar0_length())
    }

    pub fn config_read8(&self, device: u8, function: u8, offset: u16) -> u8 {
        self.config.read8(device, function, offset)
    }

    pub fn config_read16(&self, device: u8, function: u8, offset: u16) -> u16 {
        self.config.read16(device, function, offset)
    }

    pub fn config_read32(&self, device: u8, function: u8, offset: u16) -> u32 {
        self.config.read32(device, function, offset)
    }

    pub fn config_write8(&self, device: u8, function: u8, offset: u16, value: u8) {
        self.config.write8(device, function, offset, value);
    }

    pub fn config_write16(&self, device: u8, function: u8, offset: u16, value: u16) {
        self.config.write16(device, function, offset, value);
    }

    pub fn config_write32(&self, device: u8, function: u8, offset: u16, value: u32) {
        self.config.write32(device, function, offset, value);
    }
}

fn bar_fields(base: u64, length: u64) -> Result<(u32, u32), BridgeError> {
    match (u32::try_from(base), u32::try_from(length)) {
        (Ok(base), Ok(length)) => Ok((base, length)),
        _ => Err(BridgeError::FramebufferOutOfRange { base, length }),
    }
}
