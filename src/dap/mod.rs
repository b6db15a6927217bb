//! ADIv5 Debug Port semantics over a single SWD driver.
//!
//! [`DebugAccessPort`] owns the SELECT shadow and is the only mutator of the
//! SELECT register; exactly one instance may exist per SWD driver. AP reads
//! are one-deep pipelined: the value returned by a read transaction is the
//! result of the *previous* AP read, so clients chain
//! [`DebugAccessPort::start_read_ap`] / [`DebugAccessPort::step_read_ap`] /
//! [`DebugAccessPort::read_rdbuff`].

mod registers;

pub use registers::{Abort, Ctrl, DpIdr, DpRegister, RdBuff, Select};

use crate::swd::{DapError, Port, SwdDriver};
use crate::Error;

/// AP register byte addresses of a MEM-AP. The top four bits select the
/// bank, the bottom four the register; the low two bits are always zero.
pub mod mem_ap {
    pub const CSW: u8 = 0x00;
    pub const TAR: u8 = 0x04;
    pub const DRW: u8 = 0x0c;
    pub const CFG: u8 = 0xf4;
    pub const BASE: u8 = 0xf8;
    pub const IDR: u8 = 0xfc;
}

/// The DP register file and AP routing over one SWD driver.
pub struct DebugAccessPort<SWD> {
    swd: SWD,
    /// Shadow of the last SELECT value written; `None` forces the next bank
    /// switch to emit a write.
    select: Option<u32>,
    /// Whether an AP read is in flight (started but not yet consumed).
    read_pending: bool,
}

impl<SWD: SwdDriver> DebugAccessPort<SWD> {
    pub fn new(swd: SWD) -> Self {
        Self {
            swd,
            select: None,
            read_pending: false,
        }
    }

    /// The underlying SWD driver, for operations the DAP does not cover
    /// (target reset lines). Writing SELECT through this bypasses the cache;
    /// call [`DebugAccessPort::invalidate_select`] afterwards.
    pub fn swd_mut(&mut self) -> &mut SWD {
        &mut self.swd
    }

    /// Marks the SELECT shadow unknown, forcing the next bank switch onto
    /// the wire.
    pub fn invalidate_select(&mut self) {
        self.select = None;
    }

    /// Puts the DP into a known state: SELECT = 0, sticky errors cleared,
    /// debug and system power requested. Required after every line reset
    /// and before any AP traffic.
    pub fn reset_state(&mut self) -> Result<(), Error> {
        self.read_pending = false;
        self.write_select(0)?;
        self.write_abort(Abort::clear_all_sticky())?;
        self.write_ctrlstat(Ctrl::power_up())
    }

    /// Reads IDCODE. Architecturally this register never answers WAIT.
    pub fn read_idcode(&mut self) -> Result<DpIdr, Error> {
        self.swd.read(Port::Debug, DpIdr::ADDRESS).map(DpIdr::from)
    }

    /// Writes ABORT. Architecturally this register never answers WAIT.
    pub fn write_abort(&mut self, abort: Abort) -> Result<(), Error> {
        self.swd.write(Port::Debug, Abort::ADDRESS, abort.into())
    }

    /// Reads CTRL/STAT, clearing SELECT.CTRLSEL first if the shadow says it
    /// is (or may be) set. The SELECT write can answer WAIT.
    pub fn read_ctrlstat(&mut self) -> Result<Ctrl, Error> {
        self.expose_ctrlstat()?;
        self.swd.read(Port::Debug, Ctrl::ADDRESS).map(Ctrl::from)
    }

    /// Writes CTRL/STAT, clearing SELECT.CTRLSEL first if necessary.
    pub fn write_ctrlstat(&mut self, ctrl: Ctrl) -> Result<(), Error> {
        self.expose_ctrlstat()?;
        self.swd.write(Port::Debug, Ctrl::ADDRESS, ctrl.into())
    }

    /// Writes SELECT and updates the shadow.
    pub fn write_select(&mut self, value: u32) -> Result<(), Error> {
        self.swd.write(Port::Debug, Select::ADDRESS, value)?;
        self.select = Some(value);
        Ok(())
    }

    /// Reads RESEND (the last AP read result, without disturbing RDBUFF).
    /// RESEND shares wire address 2 with the write-only SELECT.
    pub fn read_resend(&mut self) -> Result<u32, Error> {
        self.swd.read(Port::Debug, Select::ADDRESS)
    }

    /// Reads RDBUFF, consuming the pending AP read result.
    ///
    /// A parity error in the RDBUFF data phase means the result was
    /// corrupted on the wire, not lost: the DP keeps it available through
    /// RESEND, so one recovery read is attempted before giving up.
    pub fn read_rdbuff(&mut self) -> Result<u32, Error> {
        let value = match self.swd.read(Port::Debug, RdBuff::ADDRESS) {
            Err(Error::Dap(DapError::IncorrectParity)) => {
                tracing::debug!("RDBUFF data failed parity, recovering via RESEND");
                self.read_resend()?
            }
            other => other?,
        };
        self.read_pending = false;
        Ok(value)
    }

    /// Discards a pending AP read, if any.
    pub fn abort_read(&mut self) -> Result<(), Error> {
        if self.read_pending {
            self.read_rdbuff()?;
        }
        Ok(())
    }

    /// Selects the AP and the bank that exposes `address`, eliding the
    /// SELECT write when the shadow already matches.
    fn select_ap_bank(&mut self, ap: u8, address: u8) -> Result<(), Error> {
        let ctrlsel = self.select.map_or(0, |s| s & 1);
        let select = u32::from(ap) << 24 | u32::from(address & 0xf0) | ctrlsel;

        if self.select != Some(select) {
            self.write_select(select)?;
        }
        Ok(())
    }

    fn expose_ctrlstat(&mut self) -> Result<(), Error> {
        match self.select {
            Some(select) if select & 1 == 0 => Ok(()),
            Some(select) => self.write_select(select & !1),
            // Unknown CTRLSEL: force a known SELECT before touching the
            // register.
            None => self.write_select(0),
        }
    }

    fn check_ap_address(address: u8) -> Result<(), Error> {
        if address & 3 != 0 {
            return Err(Error::NotAligned(u32::from(address)));
        }
        Ok(())
    }

    /// Starts a read of an AP register without consuming a result. The value
    /// will be produced by the next [`DebugAccessPort::step_read_ap`] or
    /// [`DebugAccessPort::read_rdbuff`].
    ///
    /// Starting a read while another is pending is refused; consume or
    /// [`DebugAccessPort::abort_read`] it first.
    pub fn start_read_ap(&mut self, ap: u8, address: u8) -> Result<(), Error> {
        Self::check_ap_address(address)?;
        if self.read_pending {
            return Err(Error::ReadPending);
        }

        self.select_ap_bank(ap, address)?;
        self.swd.read(Port::Access, (address >> 2) & 3)?;
        self.read_pending = true;
        Ok(())
    }

    /// Starts a new AP register read and returns the result of the previous
    /// one.
    pub fn step_read_ap(&mut self, ap: u8, address: u8) -> Result<u32, Error> {
        Self::check_ap_address(address)?;

        self.select_ap_bank(ap, address)?;
        let previous = self.swd.read(Port::Access, (address >> 2) & 3)?;
        self.read_pending = true;
        Ok(previous)
    }

    /// Writes an AP register. The write is accepted when this returns; it
    /// may still be draining through the AP (MEM-APs expose CSW.TrInProg for
    /// that).
    pub fn write_ap(&mut self, ap: u8, address: u8, data: u32) -> Result<(), Error> {
        Self::check_ap_address(address)?;

        self.select_ap_bank(ap, address)?;
        self.swd.write(Port::Access, (address >> 2) & 3, data)
    }
}
