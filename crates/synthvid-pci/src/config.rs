//! Emulated PCI configuration space for the synthvid framebuffer.
//!
//! Hyper-V does not expose the synthetic video device on a PCI bus, but generic graphics stacks
//! only bind to PCI display controllers. This is the single function the bridge puts in front
//! of them: fixed IDs, a display class code, and one memory BAR covering the framebuffer.

use std::sync::{Mutex, MutexGuard};

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

pub const SYNTHVID_VENDOR_ID: u16 = 0x1414;
pub const SYNTHVID_DEVICE_ID: u16 = 0x5353;
/// Dword at 0x08: class 0x03 (display), subclass/prog-if/revision 0.
pub const SYNTHVID_CLASS_REVISION: u32 = 0x0300_0000;

pub const PCI_VENDOR_ID_OFFSET: u16 = 0x00;
pub const PCI_DEVICE_ID_OFFSET: u16 = 0x02;
pub const PCI_CLASS_REVISION_OFFSET: u16 = 0x08;
pub const PCI_BAR0_OFFSET: u16 = 0x10;
pub const PCI_BAR5_END: u16 = 0x28;
pub const PCI_SUBSYSTEM_VENDOR_ID_OFFSET: u16 = 0x2C;
pub const PCI_SUBSYSTEM_ID_OFFSET: u16 = 0x2E;
pub const PCI_ROM_BASE_OFFSET: u16 = 0x30;

const BAR0_END: u16 = PCI_BAR0_OFFSET + 4;
const ROM_BASE_END: u16 = PCI_ROM_BASE_OFFSET + 4;
const BAR_PROBE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug)]
struct ConfigState {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bar0_length: u32,
}

/// Config space of device 0, function 0 on the bridge's secondary bus.
///
/// Accesses to any other device or function read as all-ones (no device present) and writes to
/// them are dropped, as are accesses that run past the end of the 256-byte header.
#[derive(Debug)]
pub struct FakePciConfigSpace {
    state: Mutex<ConfigState>,
}

impl FakePciConfigSpace {
    /// Builds a fully populated config space. There is no way to observe it half-initialized.
    pub fn new(framebuffer_base: u32, bar0_length: u32) -> Self {
        let mut bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        put(&mut bytes, PCI_VENDOR_ID_OFFSET, &SYNTHVID_VENDOR_ID.to_le_bytes());
        put(&mut bytes, PCI_DEVICE_ID_OFFSET, &SYNTHVID_DEVICE_ID.to_le_bytes());
        put(
            &mut bytes,
            PCI_CLASS_REVISION_OFFSET,
            &SYNTHVID_CLASS_REVISION.to_le_bytes(),
        );
        put(
            &mut bytes,
            PCI_SUBSYSTEM_VENDOR_ID_OFFSET,
            &SYNTHVID_VENDOR_ID.to_le_bytes(),
        );
        put(
            &mut bytes,
            PCI_SUBSYSTEM_ID_OFFSET,
            &SYNTHVID_DEVICE_ID.to_le_bytes(),
        );
        put(&mut bytes, PCI_BAR0_OFFSET, &framebuffer_base.to_le_bytes());

        Self {
            state: Mutex::new(ConfigState { bytes, bar0_length }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConfigState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("synthvid config space lock poisoned, continuing without it");
            poisoned.into_inner()
        })
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.read16(0, 0, PCI_VENDOR_ID_OFFSET),
            device_id: self.read16(0, 0, PCI_DEVICE_ID_OFFSET),
        }
    }

    pub fn bar0_length(&self) -> u32 {
        self.lock().bar0_length
    }

    /// Changes what a later BAR0 size probe reports.
    pub fn set_bar0_length(&self, length: u32) {
        self.lock().bar0_length = length;
    }

    pub fn read8(&self, device: u8, function: u8, offset: u16) -> u8 {
        self.read(device, function, offset, 1) as u8
    }

    pub fn read16(&self, device: u8, function: u8, offset: u16) -> u16 {
        self.read(device, function, offset, 2) as u16
    }

    pub fn read32(&self, device: u8, function: u8, offset: u16) -> u32 {
        self.read(device, function, offset, 4)
    }

    pub fn write8(&self, device: u8, function: u8, offset: u16, value: u8) {
        self.write(device, function, offset, 1, u32::from(value));
    }

    pub fn write16(&self, device: u8, function: u8, offset: u16, value: u16) {
        self.write(device, function, offset, 2, u32::from(value));
    }

    pub fn write32(&self, device: u8, function: u8, offset: u16, value: u32) {
        self.write(device, function, offset, 4, value);
    }

    fn read(&self, device: u8, function: u8, offset: u16, size: u16) -> u32 {
        let all_ones = u32::MAX >> (32 - 8 * u32::from(size));
        let Some(range) = window(device, function, offset, size) else {
            return all_ones;
        };

        let state = self.lock();
        let mut buf = [0u8; 4];
        buf[..range.len()].copy_from_slice(&state.bytes[range]);
        u32::from_le_bytes(buf)
    }

    fn write(&self, device: u8, function: u8, offset: u16, size: u16, value: u32) {
        let Some(range) = window(device, function, offset, size) else {
            tracing::debug!(device, function, offset, size, "ignoring config write");
            return;
        };
        let end = offset + size;

        // BAR1-5 and the expansion ROM base are not implemented.
        if overlaps(offset, end, BAR0_END, PCI_BAR5_END)
            || overlaps(offset, end, PCI_ROM_BASE_OFFSET, ROM_BASE_END)
        {
            return;
        }

        let mut state = self.lock();
        if overlaps(offset, end, PCI_BAR0_OFFSET, BAR0_END) {
            // Only whole-register writes: the size probe or the restore that follows it.
            if offset != PCI_BAR0_OFFSET || size != 4 {
                return;
            }
            let stored = if value == BAR_PROBE {
                state.bar0_length.wrapping_neg()
            } else {
                value
            };
            put(&mut state.bytes, PCI_BAR0_OFFSET, &stored.to_le_bytes());
            return;
        }

        state.bytes[range].copy_from_slice(&value.to_le_bytes()[..usize::from(size)]);
    }
}

/// Byte range of an access, or `None` if it does not hit this function's header.
fn window(device: u8, function: u8, offset: u16, size: u16) -> Option<std::ops::Range<usize>> {
    if device != 0 || function != 0 {
        return None;
    }
    let start = usize::from(offset);
    let end = start + usize::from(size);
    (end <= PCI_CONFIG_SPACE_SIZE).then_some(start..end)
}

fn overlaps(start: u16, end: u16, reg_start: u16, reg_end: u16) -> bool {
    start < reg_end && reg_start < end
}

fn put(bytes: &mut [u8; PCI_CONFIG_SPACE_SIZE], offset: u16, value: &[u8]) {
    let start = usize::from(offset);
    bytes[start..start + value.len()].copy_from_slice(value);
}
