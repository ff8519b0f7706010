use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use synthvid_gfx::{GfxError, GraphicsInfo, HYPERV_VRAM_BASE};
use synthvid_pci::{
    BridgeError, BusRegistration, ConsoleFramebuffer, FramebufferProvider, GraphicsBridge,
    PCI_BAR0_OFFSET, SYNTHVID_DEVICE_ID, SYNTHVID_VENDOR_ID,
};
use synthvid_protocol::ProtocolVersion;

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct RecordingBus {
    gen1: bool,
    bridges: Mutex<Vec<Arc<GraphicsBridge>>>,
    ranges: Mutex<Vec<(u8, u64, u64)>>,
    /// Vendor ID seen by the bus layer at registration time.
    vendor_at_registration: Mutex<Option<u16>>,
}

impl BusRegistration for RecordingBus {
    fn is_generation2(&self) -> bool {
        !self.gen1
    }

    fn register_child_bridge(&self, bridge: Arc<GraphicsBridge>) -> Result<u8, BridgeError> {
        // Enumeration may start immediately.
        *self.vendor_at_registration.lock().unwrap() = Some(bridge.config_read16(0, 0, 0));
        self.bridges.lock().unwrap().push(bridge);
        Ok(1)
    }

    fn add_bridge_memory_range(&self, bus: u8, base: u64, length: u64) -> Result<(), BridgeError> {
        self.ranges.lock().unwrap().push((bus, base, length));
        Ok(())
    }
}

/// Provider whose VRAM size can change between calls.
struct StubProvider {
    vram_length: u64,
    ready: bool,
    calls: usize,
}

impl StubProvider {
    fn ready(vram_length: u64) -> Self {
        Self {
            vram_length,
            ready: true,
            calls: 0,
        }
    }
}

impl FramebufferProvider for StubProvider {
    fn init_graphics(&mut self) -> Result<GraphicsInfo, GfxError> {
        self.calls += 1;
        if !self.ready {
            return Err(GfxError::Timeout(synthvid_protocol::MessageType::VersionResponse));
        }
        Ok(GraphicsInfo {
            version: ProtocolVersion::V3_5,
            vram_base: HYPERV_VRAM_BASE,
            vram_length: self.vram_length,
        })
    }
}

fn console() -> ConsoleFramebuffer {
    ConsoleFramebuffer {
        base: HYPERV_VRAM_BASE,
        width: 1024,
        height: 768,
        row_bytes: 4096,
    }
}

fn probe_bar0(bridge: &GraphicsBridge) -> u64 {
    let base = bridge.config_read32(0, 0, PCI_BAR0_OFFSET);
    bridge.config_write32(0, 0, PCI_BAR0_OFFSET, 0xFFFF_FFFF);
    let mask = bridge.config_read32(0, 0, PCI_BAR0_OFFSET);
    bridge.config_write32(0, 0, PCI_BAR0_OFFSET, base);
    u64::from((!mask).wrapping_add(1))
}

#[test]
fn generation1_is_refused() {
    let bus = RecordingBus {
        gen1: true,
        ..RecordingBus::default()
    };
    assert!(matches!(
        GraphicsBridge::probe(&bus),
        Err(BridgeError::NotGeneration2)
    ));

    let mut provider = StubProvider::ready(8 * MIB);
    assert!(matches!(
        GraphicsBridge::start(console(), &mut provider, &bus),
        Err(BridgeError::NotGeneration2)
    ));
    assert!(bus.bridges.lock().unwrap().is_empty());
}

#[test]
fn start_publishes_populated_config_space() {
    let bus = RecordingBus::default();
    let mut provider = StubProvider::ready(8 * MIB);
    let bridge = GraphicsBridge::start(console(), &mut provider, &bus).unwrap();

    assert_eq!(
        *bus.vendor_at_registration.lock().unwrap(),
        Some(SYNTHVID_VENDOR_ID)
    );
    assert_eq!(bridge.config_read16(0, 0, 0x02), SYNTHVID_DEVICE_ID);
    assert_eq!(bridge.config_read8(0, 0, 0x0B), 0x03);
    assert_eq!(bridge.bus_number(), Some(1));
    assert_eq!(
        u64::from(bridge.config_read32(0, 0, PCI_BAR0_OFFSET)),
        HYPERV_VRAM_BASE
    );

    // VRAM is larger than the 3 MiB console, so BAR0 covers all of it.
    assert_eq!(probe_bar0(&bridge), 8 * MIB);
    assert_eq!(
        *bus.ranges.lock().unwrap(),
        vec![(1, HYPERV_VRAM_BASE, 8 * MIB)]
    );
    assert_eq!(
        u64::from(bridge.config_read32(0, 0, PCI_BAR0_OFFSET)),
        HYPERV_VRAM_BASE
    );
}

#[test]
fn start_before_graphics_uses_console_size_then_grows_once() {
    let bus = RecordingBus::default();
    let mut provider = StubProvider {
        vram_length: 0,
        ready: false,
        calls: 0,
    };
    let bridge = GraphicsBridge::start(console(), &mut provider, &bus).unwrap();
    assert_eq!(bridge.framebuffer_length(), 768 * 4096);
    assert_eq!(probe_bar0(&bridge), 3 * MIB);

    provider.ready = true;
    provider.vram_length = 16 * MIB;
    assert!(bridge.graphics_ready(&mut provider).unwrap());
    assert_eq!(probe_bar0(&bridge), 16 * MIB);

    // Only the first successful notification counts.
    provider.vram_length = 32 * MIB;
    assert!(!bridge.graphics_ready(&mut provider).unwrap());
    assert_eq!(bridge.framebuffer_length(), 16 * MIB);
}

#[test]
fn graphics_ready_failure_can_be_retried() {
    let bus = RecordingBus::default();
    let mut provider = StubProvider {
        vram_length: 0,
        ready: false,
        calls: 0,
    };
    let bridge = GraphicsBridge::start(console(), &mut provider, &bus).unwrap();

    assert!(matches!(
        bridge.graphics_ready(&mut provider),
        Err(BridgeError::Graphics(GfxError::Timeout(_)))
    ));

    provider.ready = true;
    provider.vram_length = 8 * MIB;
    assert!(bridge.graphics_ready(&mut provider).unwrap());
    assert_eq!(provider.calls, 3);
}

#[test]
fn smaller_vram_keeps_console_length() {
    let bus = RecordingBus::default();
    let mut provider = StubProvider::ready(MIB);
    let bridge = GraphicsBridge::start(console(), &mut provider, &bus).unwrap();
    assert_eq!(bridge.framebuffer_length(), 3 * MIB);
    assert!(!bridge.graphics_ready(&mut provider).unwrap());
}

#[test]
fn framebuffer_above_4g_is_rejected() {
    let bus = RecordingBus::default();
    let mut provider = StubProvider::ready(8 * MIB);
    let console = ConsoleFramebuffer {
        base: 0x1_0000_0000,
        ..console()
    };
    assert!(matches!(
        GraphicsBridge::start(console, &mut provider, &bus),
        Err(BridgeError::FramebufferOutOfRange { .. })
    ));
}
