//! `ftswd dump`: halt the target and dump words of memory.

use std::thread;
use std::time::Duration;

use ftswd::dap::DebugAccessPort;
use ftswd::swd::{MpsseSwd, SwdDriver};
use ftswd::target::Target;
use ftswd::RemotePtr;

use crate::common::{parse_u32, ProbeOptions};

/// LPC SYSCON remap register; `2` maps user flash at address zero.
const SYSMEMREMAP: RemotePtr<u32> = RemotePtr::new(0x4004_8000);
const MAP_USER_FLASH: u32 = 2;

#[derive(Debug, clap::Args)]
pub struct Cmd {
    #[command(flatten)]
    probe: ProbeOptions,

    /// Number of words to dump.
    #[arg(long, default_value_t = 32)]
    count: u32,

    /// Word-aligned start address.
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    address: u32,

    /// Skip the LPC boot-ROM unmap before reading.
    #[arg(long)]
    no_remap: bool,
}

impl Cmd {
    pub fn run(self) -> anyhow::Result<()> {
        let (mut device, profile) = self.probe.open()?;
        let mut swd = MpsseSwd::new(&mut device, &profile);
        swd.set_clock(self.probe.speed);
        swd.initialize()?;

        swd.enter_reset()?;
        thread::sleep(Duration::from_millis(100));
        swd.leave_reset()?;

        let mut dap = DebugAccessPort::new(swd);
        dap.reset_state()?;

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true)?;
        target.halt()?;

        if !self.no_remap {
            target.write_word(SYSMEMREMAP, MAP_USER_FLASH)?;
        }

        let mut words = vec![0u32; self.count as usize];
        target.read_words(RemotePtr::new(self.address), &mut words)?;

        let mut address = RemotePtr::<u32>::new(self.address);
        for word in words {
            println!(" [{:08X}] {word:08X}", address.bits());
            address += 1;
        }

        Ok(())
    }
}
