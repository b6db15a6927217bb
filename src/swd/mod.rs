//! The SWD link layer: one complete ADIv5 transaction per call.
//!
//! [`SwdDriver`] is the capability the upper layers consume; [`MpsseSwd`] is
//! the production implementation over an FTDI MPSSE shim. The free functions
//! here implement the two bit-level rules every driver shares: request-byte
//! synthesis and data parity.

pub mod mpsse;

#[cfg(test)]
pub(crate) mod mock;

pub use mpsse::MpsseSwd;

use crate::Error;

/// Which port of the DAP a transaction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Debug,
    Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// An error reported by the target in the SWD acknowledge or data phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DapError {
    /// Target answered WAIT; the transaction can be retried.
    #[error("target responded WAIT")]
    WaitResponse,
    /// Target answered FAULT; a sticky error must be cleared via ABORT.
    #[error("target responded FAULT")]
    FaultResponse,
    /// The three ack bits were not one of OK/WAIT/FAULT.
    #[error("unexpected SWD acknowledge {0:#05b}")]
    NoAcknowledge(u8),
    /// The data phase of a read failed its parity check.
    #[error("incorrect parity in read data")]
    IncorrectParity,
}

/// The three-bit SWD acknowledge, LSB-first on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Wait,
    Fault,
}

impl Ack {
    /// Decodes the ack field (already right-justified).
    pub fn from_bits(bits: u8) -> Result<Ack, DapError> {
        match bits {
            0b001 => Ok(Ack::Ok),
            0b010 => Ok(Ack::Wait),
            0b100 => Ok(Ack::Fault),
            other => Err(DapError::NoAcknowledge(other)),
        }
    }

    /// Maps WAIT and FAULT to their errors.
    pub fn check(self) -> Result<(), DapError> {
        match self {
            Ack::Ok => Ok(()),
            Ack::Wait => Err(DapError::WaitResponse),
            Ack::Fault => Err(DapError::FaultResponse),
        }
    }
}

const REQUEST_START: u8 = 1 << 0;
const REQUEST_APNDP: u8 = 1 << 1;
const REQUEST_RNW: u8 = 1 << 2;
const REQUEST_PARITY: u8 = 1 << 5;
const REQUEST_PARK: u8 = 1 << 7;

/// Synthesizes the 8-bit SWD request for a 2-bit register address.
///
/// The parity bit covers APnDP, RnW and A[3:2], keeping the count of ones
/// even.
pub fn request(address: u8, port: Port, direction: Direction) -> u8 {
    let ap = port == Port::Access;
    let read = direction == Direction::Read;

    let mut req = REQUEST_START | REQUEST_PARK | ((address & 0x3) << 3);
    if ap {
        req |= REQUEST_APNDP;
    }
    if read {
        req |= REQUEST_RNW;
    }

    let mut parity = ap ^ read;
    // A[3:2] values 1 and 2 contribute a single one bit.
    if matches!(address & 0x3, 1 | 2) {
        parity = !parity;
    }
    if parity {
        req |= REQUEST_PARITY;
    }

    req
}

/// Even parity over all 32 bits of a data word.
pub fn data_parity(word: u32) -> bool {
    word.count_ones() % 2 == 1
}

/// A low-level SWD interface device.
///
/// Each call is a complete SWD transaction by the time it returns; no
/// buffering persists across calls. Register addresses at this layer are the
/// 2-bit word indices of the wire protocol (the DAP layer maps 8-bit AP byte
/// addresses down to these).
pub trait SwdDriver {
    /// Performs the connection sequence: line reset (≥50 clocks with SWDIO
    /// high, one idle clock), then a read of DP register 0. Returns the
    /// IDCODE.
    fn initialize(&mut self) -> Result<u32, Error>;

    /// Asserts the target's reset line. Callers time the pause before
    /// [`SwdDriver::leave_reset`].
    fn enter_reset(&mut self) -> Result<(), Error>;

    /// Releases the target's reset line.
    fn leave_reset(&mut self) -> Result<(), Error>;

    /// Reads a DP register, or an AP register in the bank named by SELECT.
    /// AP reads are delayed by one transaction; see the DAP layer.
    fn read(&mut self, port: Port, address: u8) -> Result<u32, Error>;

    /// Writes a DP register, or an AP register in the bank named by SELECT.
    fn write(&mut self, port: Port, address: u8, data: u32) -> Result<(), Error>;
}

impl<T: SwdDriver + ?Sized> SwdDriver for &mut T {
    fn initialize(&mut self) -> Result<u32, Error> {
        (**self).initialize()
    }

    fn enter_reset(&mut self) -> Result<(), Error> {
        (**self).enter_reset()
    }

    fn leave_reset(&mut self) -> Result<(), Error> {
        (**self).leave_reset()
    }

    fn read(&mut self, port: Port, address: u8) -> Result<u32, Error> {
        (**self).read(port, address)
    }

    fn write(&mut self, port: Port, address: u8, data: u32) -> Result<(), Error> {
        (**self).write(port, address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Independent derivation: even parity over the four address/control
    /// bits, bit by bit.
    fn reference_request(address: u8, port: Port, direction: Direction) -> u8 {
        let ap = (port == Port::Access) as u8;
        let read = (direction == Direction::Read) as u8;
        let a2 = address & 1;
        let a3 = (address >> 1) & 1;
        let parity = (ap + read + a2 + a3) % 2;

        0x01 | (ap << 1) | (read << 2) | (a2 << 3) | (a3 << 4) | (parity << 5) | 0x80
    }

    #[test]
    fn request_byte_truth_table() {
        for address in 0..4u8 {
            for port in [Port::Debug, Port::Access] {
                for direction in [Direction::Read, Direction::Write] {
                    let req = request(address, port, direction);
                    assert_eq!(
                        req,
                        reference_request(address, port, direction),
                        "mismatch for address={address} port={port:?} direction={direction:?}"
                    );
                    // Start and park bits are always set; stop always clear.
                    assert_eq!(req & 0x01, 0x01);
                    assert_eq!(req & 0x80, 0x80);
                    assert_eq!(req & 0x40, 0x00);
                }
            }
        }
    }

    #[test]
    fn request_byte_known_vectors() {
        assert_eq!(request(0, Port::Debug, Direction::Read), 0xa5);
        assert_eq!(request(0, Port::Debug, Direction::Write), 0x81);
        // Byte address 0x04 maps to wire address 1.
        assert_eq!(request(1, Port::Access, Direction::Read), 0xaf);
    }

    #[test]
    fn parity_is_xor_reduction() {
        fn folded(data: u32) -> bool {
            let mut t = data;
            t ^= t >> 16;
            t ^= t >> 8;
            t ^= t >> 4;
            t ^= t >> 2;
            t ^= t >> 1;
            t & 1 == 1
        }

        for data in [
            0u32,
            1,
            0xffff_ffff,
            0x2ba0_1477,
            0xdead_beef,
            0x8000_0001,
            0x0f0f_0f0f,
        ] {
            assert_eq!(data_parity(data), folded(data), "data={data:#010x}");
        }

        // Walk a single set bit across the word.
        for bit in 0..32 {
            assert!(data_parity(1 << bit));
        }
    }

    #[test]
    fn ack_decode() {
        assert_eq!(Ack::from_bits(0b001).unwrap(), Ack::Ok);
        assert_eq!(Ack::from_bits(0b010).unwrap(), Ack::Wait);
        assert_eq!(Ack::from_bits(0b100).unwrap(), Ack::Fault);
        assert_eq!(
            Ack::from_bits(0b111).unwrap_err(),
            DapError::NoAcknowledge(0b111)
        );
        assert_eq!(Ack::Wait.check().unwrap_err(), DapError::WaitResponse);
    }
}
