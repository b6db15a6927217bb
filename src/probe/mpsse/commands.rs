//! MPSSE opcode encoding.
//!
//! Every multi-bit or multi-byte count in the MPSSE command set is encoded
//! as `N - 1`, split into a low and an optional high byte.

use crate::probe::PinState;

// Shift-command flag bits.
pub const MPSSE_WRITE_NEG: u8 = 0x01;
pub const MPSSE_BITMODE: u8 = 0x02;
pub const MPSSE_READ_NEG: u8 = 0x04;
pub const MPSSE_LSB: u8 = 0x08;
pub const MPSSE_DO_WRITE: u8 = 0x10;
pub const MPSSE_DO_READ: u8 = 0x20;

// Standalone opcodes.
pub const SET_BITS_LOW: u8 = 0x80;
pub const SET_BITS_HIGH: u8 = 0x82;
pub const TCK_DIVISOR: u8 = 0x86;
pub const DIS_DIV_5: u8 = 0x8a;
pub const EN_DIV_5: u8 = 0x8b;
pub const EN_3_PHASE: u8 = 0x8c;
pub const DIS_3_PHASE: u8 = 0x8d;
pub const CLK_BITS: u8 = 0x8e;
pub const CLK_BYTES: u8 = 0x8f;
pub const DIS_ADAPTIVE: u8 = 0x97;

/// The MPSSE answers any invalid opcode with `0xFA` followed by the opcode;
/// sending this deliberately-invalid byte is the liveness handshake.
pub const SYNC_BAD_COMMAND: u8 = 0xaa;
pub const BAD_COMMAND_ECHO: u8 = 0xfa;

/// The 60 MHz MPSSE core divides down by `2 * (1 + divisor)`; with the /5
/// prescaler disabled the achievable rates are `30 MHz / n`.
pub const CLOCK_NUMERATOR_HZ: u32 = 30_000_000;

const fn low(n: u16) -> u8 {
    ((n - 1) & 0xff) as u8
}

const fn high(n: u16) -> u8 {
    (((n - 1) >> 8) & 0xff) as u8
}

/// Accumulates one composite MPSSE command stream.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    /// Drives both pin banks to the given state.
    pub fn set_pins(&mut self, pins: PinState) -> &mut Self {
        self.bytes
            .extend_from_slice(&[SET_BITS_LOW, pins.low_value, pins.low_direction]);
        self.bytes
            .extend_from_slice(&[SET_BITS_HIGH, pins.high_value, pins.high_direction]);
        self
    }

    /// Clocks `n` full bytes worth of TCK cycles with no data shift.
    pub fn clock_bytes(&mut self, n: u16) -> &mut Self {
        self.bytes.extend_from_slice(&[CLK_BYTES, low(n), high(n)]);
        self
    }

    /// Clocks `n` (1..=8) TCK cycles with no data shift.
    pub fn clock_bits(&mut self, n: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&n));
        self.bytes.extend_from_slice(&[CLK_BITS, low(n as u16)]);
        self
    }

    /// Shifts out `n` (1..=8) bits of `value`, LSB first.
    pub fn write_bits(&mut self, n: u8, value: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&n));
        self.bytes.extend_from_slice(&[
            MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE,
            low(n as u16),
            value,
        ]);
        self
    }

    /// Shifts out whole bytes, LSB first.
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        debug_assert!(!data.is_empty());
        self.bytes.extend_from_slice(&[
            MPSSE_DO_WRITE | MPSSE_LSB,
            low(data.len() as u16),
            high(data.len() as u16),
        ]);
        self.bytes.extend_from_slice(data);
        self
    }

    /// Shifts in `n` (1..=8) bits, sampled on the falling edge, LSB first.
    /// The bits arrive MSB-justified in the response byte.
    pub fn read_bits(&mut self, n: u8) -> &mut Self {
        debug_assert!((1..=8).contains(&n));
        self.bytes.extend_from_slice(&[
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB | MPSSE_BITMODE,
            low(n as u16),
        ]);
        self
    }

    /// Shifts in whole bytes, sampled on the falling edge, LSB first.
    pub fn read_bytes(&mut self, n: u16) -> &mut Self {
        self.bytes.extend_from_slice(&[
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB,
            low(n),
            high(n),
        ]);
        self
    }

    /// Programs the TCK divisor for the requested SWCLK rate.
    pub fn tck_divisor(&mut self, clock_hz: u32) -> &mut Self {
        let divisor = (CLOCK_NUMERATOR_HZ / clock_hz.max(1)).clamp(1, 0x1_0000) - 1;
        self.bytes.extend_from_slice(&[
            TCK_DIVISOR,
            (divisor & 0xff) as u8,
            ((divisor >> 8) & 0xff) as u8,
        ]);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::UM232H;

    #[test]
    fn counts_are_encoded_minus_one() {
        let mut buf = CommandBuffer::new();
        buf.clock_bytes(6).clock_bits(2).clock_bits(1);
        assert_eq!(
            buf.as_bytes(),
            &[CLK_BYTES, 5, 0, CLK_BITS, 1, CLK_BITS, 0]
        );
    }

    #[test]
    fn one_megahertz_divisor_is_29_on_the_wire() {
        let mut buf = CommandBuffer::new();
        buf.tck_divisor(1_000_000);
        assert_eq!(buf.as_bytes(), &[TCK_DIVISOR, 29, 0]);
    }

    #[test]
    fn pin_state_writes_both_banks() {
        let mut buf = CommandBuffer::new();
        buf.set_pins(UM232H.idle_write);
        assert_eq!(
            buf.as_bytes(),
            &[SET_BITS_LOW, 0x09, 0x0b, SET_BITS_HIGH, 0x00, 0x00]
        );
    }

    #[test]
    fn byte_shift_carries_payload() {
        let mut buf = CommandBuffer::new();
        buf.write_bytes(&[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(
            buf.as_bytes(),
            &[
                MPSSE_DO_WRITE | MPSSE_LSB,
                3,
                0,
                0xef,
                0xbe,
                0xad,
                0xde
            ]
        );
    }
}
