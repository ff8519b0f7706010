//! Synthvid protocol versions and the display limits each version tier implies.

use core::fmt;

/// Smallest resolution the synthetic video device accepts in any version.
pub const MIN_WIDTH: u32 = 640;
pub const MIN_HEIGHT: u32 = 480;

/// Bits per byte, used when turning a bit depth into a pixel stride.
pub const BITS_PER_BYTE: u32 = 8;

/// A synthvid protocol version.
///
/// On the wire this is a single `u32` with the minor version in the high half and the major
/// version in the low half (`minor << 16 | major`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Windows Server 2008 tier: 16-bit color, small framebuffers.
    pub const V3_0: Self = Self::new(3, 0);
    /// Windows 8 tier.
    pub const V3_2: Self = Self::new(3, 2);
    /// Windows 10 tier: high resolutions.
    pub const V3_5: Self = Self::new(3, 5);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub const fn to_wire(self) -> u32 {
        ((self.minor as u32) << 16) | (self.major as u32)
    }

    pub const fn from_wire(value: u32) -> Self {
        Self {
            major: (value & 0xFFFF) as u16,
            minor: (value >> 16) as u16,
        }
    }

    /// Display limits for this version.
    ///
    /// Versions newer than the ones listed in [`SUPPORTED_VERSIONS`] are treated like the newest
    /// known tier.
    pub const fn limits(self) -> VersionLimits {
        match self.to_wire() {
            v if v == Self::V3_0.to_wire() => VersionLimits {
                max_width: 1024,
                max_height: 768,
                bit_depth: 16,
            },
            v if v == Self::V3_2.to_wire() => VersionLimits {
                max_width: 1600,
                max_height: 1200,
                bit_depth: 32,
            },
            _ => VersionLimits {
                max_width: 7680,
                max_height: 4320,
                bit_depth: 32,
            },
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Versions the guest offers during negotiation, highest first.
pub const SUPPORTED_VERSIONS: [ProtocolVersion; 3] = [
    ProtocolVersion::V3_5,
    ProtocolVersion::V3_2,
    ProtocolVersion::V3_0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub bit_depth: u8,
}

impl VersionLimits {
    pub const fn bytes_per_pixel(&self) -> u32 {
        self.bit_depth as u32 / BITS_PER_BYTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encoding_puts_minor_in_high_half() {
        assert_eq!(ProtocolVersion::V3_0.to_wire(), 0x0000_0003);
        assert_eq!(ProtocolVersion::V3_2.to_wire(), 0x0002_0003);
        assert_eq!(ProtocolVersion::V3_5.to_wire(), 0x0005_0003);
        assert_eq!(
            ProtocolVersion::from_wire(0x0005_0003),
            ProtocolVersion::V3_5
        );
    }

    #[test]
    fn negotiation_order_is_descending() {
        let wire: Vec<u32> = SUPPORTED_VERSIONS.iter().map(|v| v.to_wire()).collect();
        let mut sorted = wire.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(wire, sorted);
    }

    #[test]
    fn limits_follow_version_tier() {
        let v30 = ProtocolVersion::V3_0.limits();
        assert_eq!((v30.max_width, v30.max_height), (1024, 768));
        assert_eq!(v30.bytes_per_pixel(), 2);

        let v32 = ProtocolVersion::V3_2.limits();
        assert_eq!((v32.max_width, v32.max_height), (1600, 1200));
        assert_eq!(v32.bytes_per_pixel(), 4);

        // Unknown (newer) versions get the newest tier.
        assert_eq!(ProtocolVersion::new(3, 9).limits(), ProtocolVersion::V3_5.limits());
    }

    #[test]
    fn display_is_dotted() {
        assert_eq!(ProtocolVersion::V3_2.to_string(), "3.2");
    }
}
