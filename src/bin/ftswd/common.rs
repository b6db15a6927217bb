//! Options and the attach sequence shared by every subcommand.

use std::num::ParseIntError;

use anyhow::Context;
use ftswd::probe::{self, MpsseDevice, Profile};

/// Accepts decimal or `0x`-prefixed hexadecimal.
pub fn parse_u16(s: &str) -> Result<u16, ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
pub fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[derive(Debug, clap::Args)]
pub struct ProbeOptions {
    /// FTDI-based programmer profile to use.
    #[arg(long, default_value = "um232h")]
    pub programmer: String,

    /// Override the profile's USB vendor ID.
    #[arg(long, value_parser = parse_u16)]
    pub vid: Option<u16>,

    /// Override the profile's USB product ID.
    #[arg(long, value_parser = parse_u16)]
    pub pid: Option<u16>,

    /// Override the profile's FTDI interface index.
    #[arg(long)]
    pub interface: Option<u8>,

    /// SWD clock rate in Hz.
    #[arg(long, default_value_t = 1_000_000)]
    pub speed: u32,
}

impl ProbeOptions {
    /// Resolves the profile and opens the FTDI device.
    pub fn open(&self) -> anyhow::Result<(MpsseDevice, Profile)> {
        let profile = probe::lookup_profile(&self.programmer)?
            .with_overrides(self.vid, self.pid, self.interface);

        let device = MpsseDevice::open(&profile).with_context(|| {
            format!(
                "opening programmer '{}' ({:04x}:{:04x})",
                profile.name, profile.vid, profile.pid
            )
        })?;

        Ok((device, profile))
    }
}
