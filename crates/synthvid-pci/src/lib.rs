//! PCI front end for the synthvid framebuffer.
//!
//! [`GraphicsBridge`] registers a child bus with the host's PCI layer and answers config cycles
//! for a single display function whose BAR0 is the synthvid VRAM.
#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;

pub use bridge::{BridgeError, BusRegistration, ConsoleFramebuffer, FramebufferProvider, GraphicsBridge};
pub use config::{
    FakePciConfigSpace, PciVendorDeviceId, PCI_BAR0_OFFSET, PCI_CONFIG_SPACE_SIZE,
    PCI_ROM_BASE_OFFSET, SYNTHVID_CLASS_REVISION, SYNTHVID_DEVICE_ID, SYNTHVID_VENDOR_ID,
};
