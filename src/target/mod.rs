//! Debugger-grade operations on a Cortex-M core behind one MEM-AP.
//!
//! [`Target`] layers bounded WAIT-retry over the DAP's one-shot calls: any
//! transaction the target answers with WAIT is retried up to
//! [`WAIT_RETRIES`] times before surfacing [`Error::Timeout`]. Alignment and
//! range errors are rejected before any bus traffic.

pub mod registers;

pub use registers::CoreRegister;

use std::thread;
use std::time::Duration;

use bitfield::bitfield;

use crate::dap::{mem_ap, DebugAccessPort};
use crate::remote::RemotePtr;
use crate::swd::SwdDriver;
use crate::Error;
use registers::{
    Aircr, BpCompx, BpCtrl, Dcrdr, Dcrsr, Demcr, Dfsr, Dhcsr, MemoryMappedRegister,
};

/// How often a WAIT response is retried before giving up.
pub const WAIT_RETRIES: usize = 100;

/// Retries `op` while it fails with a transient (WAIT) error.
fn retry_on_wait<T>(
    retries: usize,
    mut op: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    for _ in 0..retries {
        match op() {
            Err(e) if e.is_transient() => continue,
            other => return other,
        }
    }
    Err(Error::Timeout { retries })
}

bitfield! {
    /// MEM-AP Control/Status Word. Bits [31:12] are implementation-defined
    /// or reserved and must be preserved on writes.
    #[derive(Clone, Copy)]
    pub struct Csw(u32);
    impl Debug;
    /// A memory transaction is still draining through the AP.
    pub tr_in_prog, _: 7;
    /// 00 = off, 01 = increment-single, 10 = increment-packed.
    pub u8, addr_inc, set_addr_inc: 5, 4;
    /// 010 = 4-byte transactions.
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    const PRESERVE_MASK: u32 = 0xffff_f000;
    const SIZE_WORD: u8 = 0b010;

    pub const INC_OFF: u8 = 0b00;
    pub const INC_SINGLE: u8 = 0b01;

    /// Keeps the reserved fields of `raw` and programs word-sized
    /// transactions with the given auto-increment mode.
    fn configure(raw: u32, addr_inc: u8) -> Csw {
        let mut csw = Csw(raw & Self::PRESERVE_MASK);
        csw.set_addr_inc(addr_inc);
        csw.set_size(Self::SIZE_WORD);
        csw
    }
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(value: Csw) -> Self {
        value.0
    }
}

/// One Cortex-M core reached through one MEM-AP of a DAP.
pub struct Target<'dap, SWD> {
    dap: &'dap mut DebugAccessPort<SWD>,
    mem_ap: u8,
    /// Poll CSW.TrInProg to zero after single-word writes.
    verify_writes: bool,
}

impl<'dap, SWD: SwdDriver> Target<'dap, SWD> {
    pub fn new(dap: &'dap mut DebugAccessPort<SWD>, mem_ap: u8) -> Self {
        Self {
            dap,
            mem_ap,
            verify_writes: true,
        }
    }

    /// Controls whether single-word writes block until the MEM-AP reports
    /// the transaction complete. On by default.
    pub fn set_verify_writes(&mut self, verify: bool) {
        self.verify_writes = verify;
    }

    /// The DAP this target runs on, for operations outside the MEM-AP.
    pub fn dap(&mut self) -> &mut DebugAccessPort<SWD> {
        self.dap
    }

    /// Asserts the target's hardware reset line. Debug state in the DAP is
    /// lost; re-run [`DebugAccessPort::reset_state`] after releasing it.
    pub fn enter_reset(&mut self) -> Result<(), Error> {
        self.dap.swd_mut().enter_reset()
    }

    /// Releases the target's hardware reset line.
    pub fn leave_reset(&mut self) -> Result<(), Error> {
        self.dap.swd_mut().leave_reset()
    }

    fn write_ap(&mut self, address: u8, data: u32) -> Result<(), Error> {
        let (dap, ap) = (&mut *self.dap, self.mem_ap);
        retry_on_wait(WAIT_RETRIES, || dap.write_ap(ap, address, data))
    }

    /// A blocking AP register read: post the read, then collect it from
    /// RDBUFF, retrying WAITs at both steps.
    pub fn read_ap_register(&mut self, address: u8) -> Result<u32, Error> {
        let (dap, ap) = (&mut *self.dap, self.mem_ap);
        retry_on_wait(WAIT_RETRIES, || dap.start_read_ap(ap, address))?;
        retry_on_wait(WAIT_RETRIES, || dap.read_rdbuff())
    }

    /// Configures the MEM-AP for word transfers and optionally enables
    /// halting debug (setting DHCSR.C_DEBUGEN if it is clear).
    pub fn initialize(&mut self, enable_debug: bool) -> Result<(), Error> {
        let csw = self.read_ap_register(mem_ap::CSW)?;
        self.write_ap(mem_ap::CSW, Csw::configure(csw, Csw::INC_OFF).into())?;

        if enable_debug {
            let dhcsr = self.read_reg::<Dhcsr>()?;
            if !dhcsr.c_debugen() {
                let mut dhcsr = Dhcsr(u32::from(dhcsr) & Dhcsr::UPDATE_MASK);
                dhcsr.set_c_debugen(true);
                dhcsr.enable_write();
                self.write_reg(dhcsr)?;
            }
        }

        Ok(())
    }

    fn check_aligned(address: RemotePtr<u32>) -> Result<(), Error> {
        if !address.is_word_aligned() {
            return Err(Error::NotAligned(address.bits()));
        }
        Ok(())
    }

    /// Reads one word of target memory.
    pub fn read_word(&mut self, address: RemotePtr<u32>) -> Result<u32, Error> {
        Self::check_aligned(address)?;

        self.write_ap(mem_ap::TAR, address.bits())?;
        let data = self.read_ap_register(mem_ap::DRW)?;

        tracing::trace!("read_word({:#010x}) = {data:#010x}", address.bits());
        Ok(data)
    }

    /// Writes one word of target memory. With write verification on, blocks
    /// until the MEM-AP reports the transaction finished.
    pub fn write_word(&mut self, address: RemotePtr<u32>, data: u32) -> Result<(), Error> {
        Self::check_aligned(address)?;
        tracing::trace!("write_word({:#010x}, {data:#010x})", address.bits());

        self.write_ap(mem_ap::TAR, address.bits())?;
        self.write_ap(mem_ap::DRW, data)?;

        if self.verify_writes {
            retry_on_wait(WAIT_RETRIES, || {
                let csw = Csw::from(self.read_ap_register(mem_ap::CSW)?);
                if csw.tr_in_prog() {
                    Err(crate::swd::DapError::WaitResponse.into())
                } else {
                    Ok(())
                }
            })?;
        }

        Ok(())
    }

    /// Enables TAR auto-increment and loads the start address.
    fn setup_block_transfer(&mut self, address: RemotePtr<u32>) -> Result<(), Error> {
        let csw = self.read_ap_register(mem_ap::CSW)?;
        self.write_ap(mem_ap::CSW, Csw::configure(csw, Csw::INC_SINGLE).into())?;
        self.write_ap(mem_ap::TAR, address.bits())
    }

    /// Reads consecutive words using pipelined AP reads: the TAR is loaded
    /// once and every transaction after the first returns its predecessor's
    /// data.
    pub fn read_words(
        &mut self,
        address: RemotePtr<u32>,
        buffer: &mut [u32],
    ) -> Result<(), Error> {
        Self::check_aligned(address)?;
        let Some(last) = buffer.len().checked_sub(1) else {
            return Ok(());
        };

        self.setup_block_transfer(address)?;

        let (dap, ap) = (&mut *self.dap, self.mem_ap);
        retry_on_wait(WAIT_RETRIES, || dap.start_read_ap(ap, mem_ap::DRW))?;
        for slot in &mut buffer[..last] {
            *slot = retry_on_wait(WAIT_RETRIES, || dap.step_read_ap(ap, mem_ap::DRW))?;
        }
        buffer[last] = retry_on_wait(WAIT_RETRIES, || dap.read_rdbuff())?;

        Ok(())
    }

    /// Writes consecutive words with TAR auto-increment.
    pub fn write_words(&mut self, buffer: &[u32], address: RemotePtr<u32>) -> Result<(), Error> {
        Self::check_aligned(address)?;
        if buffer.is_empty() {
            return Ok(());
        }

        self.setup_block_transfer(address)?;

        for &word in buffer {
            self.write_ap(mem_ap::DRW, word)?;
        }

        Ok(())
    }

    /// Reads a memory-mapped debug register.
    pub fn read_reg<R: MemoryMappedRegister>(&mut self) -> Result<R, Error> {
        self.read_word(R::ADDRESS).map(R::from)
    }

    /// Writes a memory-mapped debug register.
    pub fn write_reg<R: MemoryMappedRegister>(&mut self, value: R) -> Result<(), Error> {
        self.write_word(R::ADDRESS, value.into())
    }

    fn wait_for_regrdy(&mut self) -> Result<(), Error> {
        retry_on_wait(WAIT_RETRIES, || {
            let dhcsr = self.read_reg::<Dhcsr>()?;
            if dhcsr.s_regrdy() {
                Ok(())
            } else {
                Err(crate::swd::DapError::WaitResponse.into())
            }
        })
    }

    /// Reads a core register through DCRSR/DCRDR. The core must be halted.
    pub fn read_register(&mut self, reg: CoreRegister) -> Result<u32, Error> {
        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regsel(reg.number());
        self.write_reg(dcrsr)?;

        self.wait_for_regrdy()?;
        self.read_reg::<Dcrdr>().map(|dcrdr| dcrdr.0)
    }

    /// Writes a core register through DCRSR/DCRDR. The core must be halted.
    pub fn write_register(&mut self, reg: CoreRegister, value: u32) -> Result<(), Error> {
        self.write_reg(Dcrdr(value))?;

        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regsel(reg.number());
        dcrsr.set_regwnr(true);
        self.write_reg(dcrsr)?;

        self.wait_for_regrdy()
    }

    /// Requests a halt.
    pub fn halt(&mut self) -> Result<(), Error> {
        let mut dhcsr = Dhcsr::default();
        dhcsr.set_c_halt(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_reg(dhcsr)
    }

    /// Resumes execution at the debug-return address.
    pub fn resume(&mut self) -> Result<(), Error> {
        let mut dhcsr = Dhcsr::default();
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_reg(dhcsr)
    }

    pub fn is_halted(&mut self) -> Result<bool, Error> {
        Ok(self.read_reg::<Dhcsr>()?.s_halt())
    }

    /// One halt poll: true when the core is halted *and* DFSR records one of
    /// the reasons in `dfsr_mask`.
    pub fn poll_for_halt(&mut self, dfsr_mask: u32) -> Result<bool, Error> {
        let dhcsr = self.read_reg::<Dhcsr>()?;
        let dfsr = self.read_reg::<Dfsr>()?;

        tracing::trace!(
            "poll_for_halt: DHCSR={:#010x} DFSR={:#010x}",
            u32::from(dhcsr),
            u32::from(dfsr)
        );

        Ok(dhcsr.s_halt() && u32::from(dfsr) & dfsr_mask != 0)
    }

    /// Polls [`Target::poll_for_halt`] up to `attempts` times, sleeping
    /// `delay` between tries.
    pub fn wait_for_halt(
        &mut self,
        dfsr_mask: u32,
        attempts: usize,
        delay: Duration,
    ) -> Result<(), Error> {
        for _ in 0..attempts {
            if self.poll_for_halt(dfsr_mask)? {
                return Ok(());
            }
            thread::sleep(delay);
        }
        Err(Error::Timeout { retries: attempts })
    }

    /// The sticky halt-reason bits of DFSR.
    pub fn read_halt_state(&mut self) -> Result<u32, Error> {
        Ok(u32::from(self.read_reg::<Dfsr>()?) & Dfsr::REASON_MASK)
    }

    /// Clears every sticky halt reason (write-1-to-clear).
    pub fn reset_halt_state(&mut self) -> Result<(), Error> {
        self.write_reg(Dfsr::clear_all())
    }

    /// Resets the system and catches the core at the reset vector.
    ///
    /// Uses AIRCR.SYSRESETREQ, which is architecturally valid on both
    /// ARMv6-M and ARMv7-M, with DEMCR.VC_CORERESET armed; the saved DEMCR
    /// is restored once the core halts.
    pub fn reset_and_halt(&mut self) -> Result<(), Error> {
        let saved = self.read_reg::<Demcr>()?;

        let mut demcr = saved;
        demcr.set_vc_corereset(true);
        demcr.set_vc_harderr(true);
        demcr.set_dwtena(true);
        self.write_reg(demcr)?;

        let mut aircr = Aircr::default();
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        self.write_reg(aircr)?;

        self.wait_for_halt(Dfsr::VCATCH, 1000, Duration::from_millis(1))?;

        self.write_reg(saved)
    }

    /// Switches the breakpoint unit on.
    pub fn enable_breakpoints(&mut self) -> Result<(), Error> {
        let mut ctrl = BpCtrl::default();
        ctrl.set_key(true);
        ctrl.set_enable(true);
        self.write_reg(ctrl)
    }

    /// Switches the breakpoint unit off.
    pub fn disable_breakpoints(&mut self) -> Result<(), Error> {
        let mut ctrl = BpCtrl::default();
        ctrl.set_key(true);
        self.write_reg(ctrl)
    }

    /// Number of comparators the breakpoint unit implements.
    pub fn breakpoint_count(&mut self) -> Result<usize, Error> {
        Ok(self.read_reg::<BpCtrl>()?.num_code() as usize)
    }

    fn comparator_address(&mut self, index: usize) -> Result<RemotePtr<u32>, Error> {
        let available = self.breakpoint_count()?;
        if index >= available {
            return Err(Error::BreakpointIndex { index, available });
        }
        Ok(BpCompx::COMP0_ADDRESS + index as u32)
    }

    /// Arms comparator `index` to break on the halfword containing
    /// `address`. Only the code region (the low 512 MiB) is breakable.
    pub fn enable_breakpoint(&mut self, index: usize, address: u32) -> Result<(), Error> {
        if address & 0xe000_0000 != 0 {
            return Err(Error::BreakpointAddress(address));
        }

        tracing::debug!("setting breakpoint {index} at {address:#010x}");
        let comparator = self.comparator_address(index)?;
        self.write_word(comparator, BpCompx::for_address(address).into())
    }

    /// Disarms comparator `index`.
    pub fn disable_breakpoint(&mut self, index: usize) -> Result<(), Error> {
        let comparator = self.comparator_address(index)?;
        self.write_word(comparator, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swd::mock::MockDap;

    fn fixture() -> DebugAccessPort<MockDap> {
        let mut dap = DebugAccessPort::new(MockDap::new());
        dap.reset_state().unwrap();
        dap
    }

    #[test]
    fn initialize_configures_csw_and_enables_debug() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        let csw = Csw::from(target.dap.swd_mut().csw);
        assert_eq!(csw.size(), 0b010);
        assert_eq!(csw.addr_inc(), Csw::INC_OFF);
        assert!(target.dap.swd_mut().debug_enabled);
    }

    #[test]
    fn word_round_trip() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(false).unwrap();

        let addr = RemotePtr::new(0x1000_0000);
        target.write_word(addr, 0xcafe_babe).unwrap();
        assert_eq!(target.read_word(addr).unwrap(), 0xcafe_babe);
    }

    #[test]
    fn write_verification_polls_tr_in_prog_until_it_clears() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(false).unwrap();

        // The MEM-AP stays busy for three status reads after the data
        // write.
        target.dap.swd_mut().tr_in_prog_after_write = 3;

        let polls_before = target.dap.swd_mut().csw_reads;
        target
            .write_word(RemotePtr::new(0x1000_0000), 0x1111_2222)
            .unwrap();
        // Three busy polls, then the one that observes the AP idle.
        assert_eq!(target.dap.swd_mut().csw_reads - polls_before, 4);
        assert_eq!(target.dap.swd_mut().mem(0x1000_0000), 0x1111_2222);

        target.set_verify_writes(false);
        let polls_before = target.dap.swd_mut().csw_reads;
        target
            .write_word(RemotePtr::new(0x1000_0004), 0x3333_4444)
            .unwrap();
        // No status traffic at all without verification.
        assert_eq!(target.dap.swd_mut().csw_reads - polls_before, 0);
        assert_eq!(target.dap.swd_mut().mem(0x1000_0004), 0x3333_4444);
    }

    #[test]
    fn misaligned_memory_access_is_rejected_without_traffic() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        let before = target.dap.swd_mut().transactions;

        let addr = RemotePtr::new(0x1000_0002);
        assert!(matches!(
            target.read_word(addr),
            Err(Error::NotAligned(0x1000_0002))
        ));
        assert!(matches!(
            target.write_word(addr, 0),
            Err(Error::NotAligned(_))
        ));
        assert_eq!(target.dap.swd_mut().transactions, before);
    }

    #[test]
    fn block_round_trip_loads_tar_once_per_pass() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(false).unwrap();

        let words = [0xdead_beefu32, 0xcafe_babe, 0x0123_4567, 0x89ab_cdef];
        let base = RemotePtr::new(0x1000_0000);

        let tar_before = target.dap.swd_mut().tar_writes;
        target.write_words(&words, base).unwrap();

        let mut readback = [0u32; 4];
        target.read_words(base, &mut readback).unwrap();
        assert_eq!(readback, words);

        // One TAR load for the write pass, one for the read pass.
        assert_eq!(target.dap.swd_mut().tar_writes - tar_before, 2);
    }

    #[test]
    fn empty_block_transfers_are_no_ops() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        let before = target.dap.swd_mut().transactions;

        target.read_words(RemotePtr::new(0x0), &mut []).unwrap();
        target.write_words(&[], RemotePtr::new(0x0)).unwrap();
        assert_eq!(target.dap.swd_mut().transactions, before);
    }

    #[test]
    fn core_register_round_trip() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();
        target.halt().unwrap();

        target.write_register(CoreRegister::R7, 0x1234_5678).unwrap();
        assert_eq!(target.dap.swd_mut().regs[7], 0x1234_5678);
        assert_eq!(target.read_register(CoreRegister::R7).unwrap(), 0x1234_5678);

        target.write_register(CoreRegister::PC, 0x0000_0200).unwrap();
        assert_eq!(target.dap.swd_mut().regs[15], 0x200);
    }

    #[test]
    fn halt_resume_and_state() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        assert!(!target.is_halted().unwrap());
        target.halt().unwrap();
        assert!(target.is_halted().unwrap());
        assert_eq!(target.read_halt_state().unwrap() & 1, 1);

        target.reset_halt_state().unwrap();
        assert_eq!(target.read_halt_state().unwrap(), 0);

        target.resume().unwrap();
        assert!(!target.is_halted().unwrap());
    }

    #[test]
    fn reset_and_halt_restores_demcr() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        target.write_reg(Demcr(0x0000_0400)).unwrap();
        target.reset_and_halt().unwrap();

        assert!(target.is_halted().unwrap());
        assert_eq!(target.dap.swd_mut().demcr, 0x0000_0400);
        assert!(target.poll_for_halt(Dfsr::VCATCH).unwrap());
    }

    #[test]
    fn breakpoint_encoding_and_range_checks() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        target.enable_breakpoints().unwrap();
        assert!(target.dap.swd_mut().bp_enabled);
        assert_eq!(target.breakpoint_count().unwrap(), 4);

        target.enable_breakpoint(0, 0x0000_0100).unwrap();
        assert_eq!(
            target.dap.swd_mut().bp_comp[0],
            (0b01 << 30) | 0x100 | 1
        );

        target.enable_breakpoint(1, 0x0000_0102).unwrap();
        assert_eq!(
            target.dap.swd_mut().bp_comp[1],
            (0b10 << 30) | 0x100 | 1
        );

        assert!(matches!(
            target.enable_breakpoint(0, 0xe000_0000),
            Err(Error::BreakpointAddress(_))
        ));
        assert!(matches!(
            target.enable_breakpoint(9, 0x100),
            Err(Error::BreakpointIndex { .. })
        ));

        target.disable_breakpoint(0).unwrap();
        assert_eq!(target.dap.swd_mut().bp_comp[0], 0);

        target.disable_breakpoints().unwrap();
        assert!(!target.dap.swd_mut().bp_enabled);
    }

    #[test]
    fn wait_responses_are_retried_until_the_budget_runs_out() {
        let mut dap = fixture();
        let mut target = Target::new(&mut dap, 0);
        target.initialize(false).unwrap();

        let addr = RemotePtr::new(0x1000_0000);
        target.write_word(addr, 0x55aa_55aa).unwrap();

        target.dap.swd_mut().wait_responses = 5;
        assert_eq!(target.read_word(addr).unwrap(), 0x55aa_55aa);

        target.dap.swd_mut().wait_responses = 10 * WAIT_RETRIES;
        assert!(matches!(
            target.read_word(addr),
            Err(Error::Timeout { .. })
        ));
        target.dap.swd_mut().wait_responses = 0;
    }
}
