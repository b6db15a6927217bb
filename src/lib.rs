//! Host-side SWD debug toolkit for ARMv6-M / ARMv7-M targets, driven through
//! an FTDI FT232H-class USB bridge in MPSSE mode.
//!
//! The crate is layered bottom-up:
//!
//! - [`probe`] opens the FTDI device and provides raw MPSSE byte streams.
//! - [`swd`] turns those streams into single ADIv5 SWD transactions.
//! - [`dap`] implements Debug Port register semantics (SELECT caching,
//!   pipelined Access Port reads) over an [`swd::SwdDriver`].
//! - [`target`] exposes debugger-grade operations (memory, core registers,
//!   halt/resume, breakpoints) over one MEM-AP.
//! - [`flash`] and [`semihosting`] build LPC IAP programming and a
//!   semihosting console on top of [`target::Target`].
//!
//! ```no_run
//! use ftswd::probe::{self, MpsseDevice};
//! use ftswd::swd::{MpsseSwd, SwdDriver};
//! use ftswd::{dap::DebugAccessPort, target::Target};
//!
//! # fn main() -> Result<(), ftswd::Error> {
//! let profile = probe::lookup_profile("um232h")?;
//! let mut device = MpsseDevice::open(&profile)?;
//! let mut swd = MpsseSwd::new(&mut device, &profile);
//! let idcode = swd.initialize()?;
//! println!("IDCODE = {idcode:#010x}");
//!
//! let mut dap = DebugAccessPort::new(swd);
//! dap.reset_state()?;
//! let mut target = Target::new(&mut dap, 0);
//! target.initialize(true)?;
//! # Ok(())
//! # }
//! ```

pub mod dap;
mod error;
pub mod flash;
pub mod probe;
pub mod remote;
pub mod semihosting;
pub mod swd;
pub mod target;

pub use crate::error::Error;
pub use crate::remote::RemotePtr;
