//! Cortex-M debug registers shared by ARMv6-M and ARMv7-M.
//!
//! Where the two architectures have compatible definitions we use the
//! ARMv6-M name; the ARMv7-M FPB is driven through its backwards-compatible
//! BPU subset.

use bitfield::bitfield;

use crate::remote::RemotePtr;

/// A 32-bit register at a fixed address in the target's memory map.
pub trait MemoryMappedRegister: Clone + From<u32> + Into<u32> + std::fmt::Debug {
    const ADDRESS: RemotePtr<u32>;
    const NAME: &'static str;
}

bitfield! {
    /// Debug Halting Control and Status Register.
    ///
    /// Writes only take effect with the debug key in the top halfword; use
    /// [`Dhcsr::enable_write`] before writing.
    #[derive(Clone, Copy, Default)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    pub const KEY: u32 = 0xa05f << 16;
    /// The writable low halfword.
    pub const UPDATE_MASK: u32 = 0xffff;

    /// Replaces the top halfword with the debug key.
    pub fn enable_write(&mut self) {
        self.0 = (self.0 & Self::UPDATE_MASK) | Self::KEY;
    }
}

impl From<u32> for Dhcsr {
    fn from(raw: u32) -> Self {
        Dhcsr(raw)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_edf0);
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register.
    #[derive(Clone, Copy, Default)]
    pub struct Dcrsr(u32);
    impl Debug;
    /// 1 = write the selected register from DCRDR, 0 = read it into DCRDR.
    pub regwnr, set_regwnr: 16;
    pub u8, regsel, set_regsel: 4, 0;
}

impl From<u32> for Dcrsr {
    fn from(raw: u32) -> Self {
        Dcrsr(raw)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_edf4);
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(raw: u32) -> Self {
        Dcrdr(raw)
    }
}

impl From<Dcrdr> for u32 {
    fn from(value: Dcrdr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrdr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_edf8);
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Clone, Copy, Default)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global DWT/ITM enable (TRCENA in ARMv7-M).
    pub dwtena, set_dwtena: 24;
    /// Halting trap on HardFault.
    pub vc_harderr, set_vc_harderr: 10;
    /// Reset vector catch.
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(raw: u32) -> Self {
        Demcr(raw)
    }
}

impl From<Demcr> for u32 {
    fn from(value: Demcr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Demcr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_edfc);
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    ///
    /// Writes are ignored without the vector key; call [`Aircr::vectkey`].
    #[derive(Clone, Copy, Default)]
    pub struct Aircr(u32);
    impl Debug;
    get_vectkeystat, set_vectkey: 31, 16;
    pub endianness, _: 15;
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05fa);
    }
}

impl From<u32> for Aircr {
    fn from(raw: u32) -> Self {
        Aircr(raw)
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Aircr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_ed0c);
    const NAME: &'static str = "AIRCR";
}

bitfield! {
    /// Debug Fault Status Register. All bits are sticky, write-1-to-clear.
    #[derive(Clone, Copy, Default)]
    pub struct Dfsr(u32);
    impl Debug;
    pub external, _: 4;
    pub vcatch, _: 3;
    pub dwttrap, _: 2;
    pub bkpt, _: 1;
    pub halted, _: 0;
}

impl Dfsr {
    pub const REASON_MASK: u32 = 0x1f;
    pub const BKPT: u32 = 1 << 1;
    pub const VCATCH: u32 = 1 << 3;

    /// A value that clears every sticky reason bit when written back.
    pub fn clear_all() -> Self {
        Dfsr(Self::REASON_MASK)
    }
}

impl From<u32> for Dfsr {
    fn from(raw: u32) -> Self {
        Dfsr(raw)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dfsr {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_ed30);
    const NAME: &'static str = "DFSR";
}

bitfield! {
    /// Breakpoint Unit control register.
    #[derive(Clone, Copy, Default)]
    pub struct BpCtrl(u32);
    impl Debug;
    /// Number of implemented comparators.
    pub u8, num_code, _: 7, 4;
    /// Must be written as one for the write to take effect.
    pub key, set_key: 1;
    pub enable, set_enable: 0;
}

impl From<u32> for BpCtrl {
    fn from(raw: u32) -> Self {
        BpCtrl(raw)
    }
}

impl From<BpCtrl> for u32 {
    fn from(value: BpCtrl) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for BpCtrl {
    const ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_2000);
    const NAME: &'static str = "BP_CTRL";
}

bitfield! {
    /// A breakpoint comparator. Matches instruction fetches in the code
    /// region; bits [31:30] select which halfword(s) of the compared word
    /// trigger.
    #[derive(Clone, Copy, Default)]
    pub struct BpCompx(u32);
    impl Debug;
    pub u8, bp_match, set_bp_match: 31, 30;
    pub enable, set_enable: 0;
}

impl BpCompx {
    pub const MATCH_LOW: u8 = 0b01;
    pub const MATCH_HIGH: u8 = 0b10;
    pub const COMP_MASK: u32 = 0x1fff_fffc;

    /// The first comparator; the rest follow at word stride.
    pub const COMP0_ADDRESS: RemotePtr<u32> = RemotePtr::new(0xe000_2008);

    /// Builds a comparator value breaking on the halfword containing
    /// `address`. Bit 0 of the address is ignored so Thumb-style addresses
    /// work.
    pub fn for_address(address: u32) -> Self {
        let half = if address & 2 == 0 {
            Self::MATCH_LOW
        } else {
            Self::MATCH_HIGH
        };

        let mut comp = BpCompx(address & Self::COMP_MASK);
        comp.set_bp_match(half);
        comp.set_enable(true);
        comp
    }
}

impl From<u32> for BpCompx {
    fn from(raw: u32) -> Self {
        BpCompx(raw)
    }
}

impl From<BpCompx> for u32 {
    fn from(value: BpCompx) -> Self {
        value.0
    }
}

/// Core and special-purpose register numbering used by DCRSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreRegister {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Xpsr = 16,
    Msp = 17,
    Psp = 18,
    /// CONTROL, FAULTMASK and PRIMASK, packed into one selector.
    Control = 20,
}

impl CoreRegister {
    pub const SP: CoreRegister = CoreRegister::R13;
    pub const LR: CoreRegister = CoreRegister::R14;
    pub const PC: CoreRegister = CoreRegister::R15;

    pub fn number(self) -> u8 {
        self as u8
    }

    /// Maps a DCRSR selector back to a register, if implemented. Index 19
    /// is architecturally unused.
    pub fn from_number(n: u8) -> Option<CoreRegister> {
        use CoreRegister::*;
        Some(match n {
            0 => R0,
            1 => R1,
            2 => R2,
            3 => R3,
            4 => R4,
            5 => R5,
            6 => R6,
            7 => R7,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            15 => R15,
            16 => Xpsr,
            17 => Msp,
            18 => Psp,
            20 => Control,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcsr_write_key() {
        let mut dhcsr = Dhcsr(0xffff_ffff);
        dhcsr.enable_write();
        assert_eq!(u32::from(dhcsr), 0xa05f_ffff);
    }

    #[test]
    fn comparator_selects_the_halfword() {
        let low = BpCompx::for_address(0x0000_0100);
        assert_eq!(u32::from(low), (0b01 << 30) | 0x100 | 1);

        let high = BpCompx::for_address(0x0000_0102);
        assert_eq!(u32::from(high), (0b10 << 30) | 0x100 | 1);

        // Thumb bit is ignored.
        let thumb = BpCompx::for_address(0x0000_0101);
        assert_eq!(u32::from(thumb), u32::from(low));
    }

    #[test]
    fn register_numbering_skips_nineteen() {
        assert_eq!(CoreRegister::PC.number(), 15);
        assert_eq!(CoreRegister::Control.number(), 20);
        assert!(CoreRegister::from_number(19).is_none());
        assert!(CoreRegister::from_number(21).is_none());
        assert_eq!(CoreRegister::from_number(16), Some(CoreRegister::Xpsr));
    }

    #[test]
    fn dfsr_reason_bits() {
        let dfsr = Dfsr::from(Dfsr::BKPT | Dfsr::VCATCH);
        assert!(dfsr.bkpt() && dfsr.vcatch());
        assert_eq!(u32::from(Dfsr::clear_all()), 0x1f);
    }
}
