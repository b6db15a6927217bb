//! `ftswd flash`: program a binary image through the LPC IAP ROM.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use ftswd::dap::DebugAccessPort;
use ftswd::flash::{fix_lpc_checksum, LpcFlasher};
use ftswd::swd::{MpsseSwd, SwdDriver};
use ftswd::target::Target;

use crate::common::{parse_u32, ProbeOptions};

#[derive(Debug, clap::Args)]
pub struct Cmd {
    #[command(flatten)]
    probe: ProbeOptions,

    /// Binary image to program.
    #[arg(long = "flash")]
    image: PathBuf,

    /// Recompute the vector-table checksum so the LPC boot ROM accepts the
    /// image.
    #[arg(long)]
    fix_lpc_checksum: bool,

    /// Sector-aligned flash base address.
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    address: u32,
}

impl Cmd {
    pub fn run(self) -> anyhow::Result<()> {
        let mut image = std::fs::read(&self.image)
            .with_context(|| format!("reading image {}", self.image.display()))?;
        if self.fix_lpc_checksum {
            fix_lpc_checksum(&mut image)?;
        }

        let (mut device, profile) = self.probe.open()?;
        let mut swd = MpsseSwd::new(&mut device, &profile);
        swd.set_clock(self.probe.speed);
        swd.initialize()?;

        // Bounce the hardware reset line so the part is in a known state,
        // then catch the core at its reset vector.
        swd.enter_reset()?;
        thread::sleep(Duration::from_millis(100));
        swd.leave_reset()?;

        let mut dap = DebugAccessPort::new(swd);
        dap.reset_state()?;

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true)?;
        target.reset_and_halt()?;

        tracing::info!(
            "programming {} bytes at {:#010x}",
            image.len(),
            self.address
        );
        LpcFlasher::new(&mut target).program(&image, self.address)?;

        // Pulse reset so the new firmware starts.
        target.enter_reset()?;
        thread::sleep(Duration::from_millis(10));
        target.leave_reset()?;

        println!(
            "programmed {} bytes at {:#010x}",
            image.len(),
            self.address
        );
        Ok(())
    }
}
