//! ADIv5 Debug Port register types.

use bitfield::bitfield;
use jep106::JEP106Code;

/// A typed DP register. `ADDRESS` is the 2-bit wire address (the byte
/// address divided by four).
pub trait DpRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    const ADDRESS: u8;
    const NAME: &'static str;
}

bitfield! {
    /// ABORT register (write-only, never answers WAIT).
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl Abort {
    /// Clears every sticky error flag at once.
    pub fn clear_all_sticky() -> Self {
        let mut abort = Abort::default();
        abort.set_stkcmpclr(true);
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        abort
    }
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(value: Abort) -> Self {
        value.0
    }
}

impl DpRegister for Abort {
    const ADDRESS: u8 = 0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// CTRL/STAT register (visible while SELECT.CTRLSEL is clear).
    #[derive(Clone, Copy, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub wdataerr, _: 7;
    pub readok, _: 6;
    pub stickyerr, _: 5;
    pub stickycmp, _: 4;
    pub u8, trn_mode, set_trn_mode: 3, 2;
    pub stickyorun, _: 1;
    pub orundetect, set_orundetect: 0;
}

impl Ctrl {
    /// The power-up requests required before any AP traffic.
    pub fn power_up() -> Self {
        let mut ctrl = Ctrl::default();
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        ctrl
    }
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(value: Ctrl) -> Self {
        value.0
    }
}

impl DpRegister for Ctrl {
    const ADDRESS: u8 = 1;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// SELECT register (write-only): which AP, which AP bank, and whether
    /// CTRL/STAT or WCR is visible at wire address 1.
    #[derive(Clone, Copy, Default)]
    pub struct Select(u32);
    impl Debug;
    pub u8, apsel, set_apsel: 31, 24;
    pub u8, apbanksel, set_apbanksel: 7, 4;
    pub ctrlsel, set_ctrlsel: 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(value: Select) -> Self {
        value.0
    }
}

impl DpRegister for Select {
    const ADDRESS: u8 = 2;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// IDCODE register (read-only, never answers WAIT).
    #[derive(Clone, Copy)]
    pub struct DpIdr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, partno, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl DpIdr {
    /// The JEP106 code of the DP designer (usually ARM, `0x43B`).
    pub fn designer(&self) -> JEP106Code {
        JEP106Code::new(self.jep_cc(), self.jep_id())
    }
}

impl From<u32> for DpIdr {
    fn from(raw: u32) -> Self {
        DpIdr(raw)
    }
}

impl From<DpIdr> for u32 {
    fn from(value: DpIdr) -> Self {
        value.0
    }
}

impl DpRegister for DpIdr {
    const ADDRESS: u8 = 0;
    const NAME: &'static str = "IDCODE";
}

/// RDBUFF: the result of the last completed AP read (read-once).
#[derive(Debug, Clone, Copy)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(value: RdBuff) -> Self {
        value.0
    }
}

impl DpRegister for RdBuff {
    const ADDRESS: u8 = 3;
    const NAME: &'static str = "RDBUFF";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_clear_all_sticky_sets_the_four_clear_bits() {
        let abort: u32 = Abort::clear_all_sticky().into();
        assert_eq!(abort, (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4));
    }

    #[test]
    fn ctrl_power_up_requests() {
        let ctrl: u32 = Ctrl::power_up().into();
        assert_eq!(ctrl, (1 << 30) | (1 << 28));
    }

    #[test]
    fn select_field_layout() {
        let mut select = Select::default();
        select.set_apsel(0xa5);
        select.set_apbanksel(0xf);
        select.set_ctrlsel(true);
        assert_eq!(u32::from(select), 0xa5_00_00_f1);
    }

    #[test]
    fn idcode_decodes_the_arm_dp() {
        // A Cortex-M0 SW-DP, designed by ARM (JEP106 0x43B).
        let idr = DpIdr::from(0x0bb1_1477);
        assert_eq!(idr.version(), 1);
        assert_eq!(idr.designer().get(), Some("ARM Ltd"));
    }
}
