//! `ftswd host`: a semihosting console.

use std::io;
use std::thread;
use std::time::Duration;

use ftswd::dap::DebugAccessPort;
use ftswd::semihosting::{self, Console, StdioConsole};
use ftswd::swd::{MpsseSwd, SwdDriver};
use ftswd::target::Target;

use crate::common::ProbeOptions;

#[derive(Debug, clap::Args)]
pub struct Cmd {
    #[command(flatten)]
    probe: ProbeOptions,

    /// Echo bytes read from stdin back to stdout.
    #[arg(long)]
    local_echo: bool,
}

/// Wraps the stdio console to optionally echo keystrokes.
struct EchoConsole {
    inner: StdioConsole,
    echo: bool,
}

impl Console for EchoConsole {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.inner.write_byte(byte)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let byte = self.inner.read_byte()?;
        if self.echo {
            self.inner.write_byte(byte)?;
        }
        Ok(byte)
    }
}

impl Cmd {
    pub fn run(self) -> anyhow::Result<()> {
        let (mut device, profile) = self.probe.open()?;
        let mut swd = MpsseSwd::new(&mut device, &profile);
        swd.set_clock(self.probe.speed);
        swd.initialize()?;

        // Hold the target in reset while debug is switched on, so no
        // semihosting calls are missed at startup.
        swd.enter_reset()?;
        thread::sleep(Duration::from_millis(10));

        let mut dap = DebugAccessPort::new(swd);
        dap.reset_state()?;

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true)?;
        target.reset_halt_state()?;
        target.leave_reset()?;

        let mut console = EchoConsole {
            inner: StdioConsole,
            echo: self.local_echo,
        };

        loop {
            if target.is_halted()? {
                semihosting::handle_halt(&mut target, &mut console)?;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}
