//! FTDI adapter profiles and the MPSSE transport.

pub mod mpsse;
pub mod usb;

pub use mpsse::{MpsseDevice, MpsseError};

/// One FTDI pin configuration: output values and directions for the low
/// (ADBUS) and high (ACBUS) pin banks, as raw `SET_BITS_LOW`/`SET_BITS_HIGH`
/// payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub low_value: u8,
    pub low_direction: u8,
    pub high_value: u8,
    pub high_direction: u8,
}

/// Describes how a given adapter wires SWDIO/SWDCLK/nRST: which USB identity
/// to open, and the pin states for the four line conditions the SWD driver
/// needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub name: &'static str,
    pub vid: u16,
    pub pid: u16,
    /// FTDI interface (port) index, zero-based.
    pub interface: u8,
    /// Bus idle, SWDIO direction host←target.
    pub idle_read: PinState,
    /// Bus idle, SWDIO direction host→target.
    pub idle_write: PinState,
    /// nRST asserted.
    pub reset_target: PinState,
    /// SWDIO driven high for the line-reset sequence.
    pub reset_swd: PinState,
}

/// FTDI UM232H breakout: SWD signals on the low pin bank only.
pub const UM232H: Profile = Profile {
    name: "um232h",
    vid: 0x0403,
    pid: 0x6014,
    interface: 0,
    idle_read: PinState {
        low_value: 0x09,
        low_direction: 0x09,
        high_value: 0x00,
        high_direction: 0x00,
    },
    idle_write: PinState {
        low_value: 0x09,
        low_direction: 0x0b,
        high_value: 0x00,
        high_direction: 0x00,
    },
    reset_target: PinState {
        low_value: 0x01,
        low_direction: 0x0b,
        high_value: 0x00,
        high_direction: 0x00,
    },
    reset_swd: PinState {
        low_value: 0x0b,
        low_direction: 0x0b,
        high_value: 0x00,
        high_direction: 0x00,
    },
};

/// Dangerous Prototypes Bus Blaster (FT2232H); the high bank drives the
/// CPLD buffer enables.
pub const BUS_BLASTER: Profile = Profile {
    name: "bus_blaster",
    vid: 0x0403,
    pid: 0x6010,
    interface: 0,
    idle_read: PinState {
        low_value: 0x09,
        low_direction: 0x29,
        high_value: 0xb7,
        high_direction: 0x58,
    },
    idle_write: PinState {
        low_value: 0x09,
        low_direction: 0x2b,
        high_value: 0xa7,
        high_direction: 0x58,
    },
    reset_target: PinState {
        low_value: 0x01,
        low_direction: 0x2b,
        high_value: 0xa5,
        high_direction: 0x5a,
    },
    reset_swd: PinState {
        low_value: 0x0b,
        low_direction: 0x2b,
        high_value: 0xa7,
        high_direction: 0x58,
    },
};

const PROFILES: &[Profile] = &[UM232H, BUS_BLASTER];

/// Looks up a built-in adapter profile by name.
pub fn lookup_profile(name: &str) -> Result<Profile, crate::Error> {
    PROFILES
        .iter()
        .find(|p| p.name == name)
        .copied()
        .ok_or_else(|| MpsseError::UnknownProgrammer(name.to_owned()).into())
}

impl Profile {
    /// Applies command-line overrides to the USB identity.
    pub fn with_overrides(
        mut self,
        vid: Option<u16>,
        pid: Option<u16>,
        interface: Option<u8>,
    ) -> Self {
        if let Some(vid) = vid {
            self.vid = vid;
        }
        if let Some(pid) = pid {
            self.pid = pid;
        }
        if let Some(interface) = interface {
            self.interface = interface;
        }
        self
    }
}
