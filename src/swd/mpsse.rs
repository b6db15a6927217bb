//! The MPSSE-backed SWD driver.
//!
//! Each SWD transaction is a short composite MPSSE command stream: shift the
//! request byte out LSB-first, release SWDIO for the turnaround, sample the
//! three ack bits on the falling edge, then run the data phase in whichever
//! direction the ack allows. The MPSSE returns bit-mode reads MSB-justified,
//! so a 3-bit ack lands in the top bits of its response byte.

use std::io;

use crate::probe::mpsse::commands::CommandBuffer;
use crate::probe::{MpsseDevice, MpsseError, Profile};
use crate::swd::{data_parity, request, Ack, DapError, Direction, Port, SwdDriver};
use crate::Error;

/// Per-transaction response deadline, in 1 ms poll attempts.
const RESPONSE_TIMEOUT_MS: u32 = 1000;

/// An SWD driver over an FT232H-class MPSSE engine.
pub struct MpsseSwd<'probe> {
    device: &'probe mut MpsseDevice,
    profile: Profile,
    clock_hz: u32,
}

impl<'probe> MpsseSwd<'probe> {
    pub fn new(device: &'probe mut MpsseDevice, profile: &Profile) -> Self {
        Self {
            device,
            profile: *profile,
            clock_hz: 1_000_000,
        }
    }

    /// Overrides the 1 MHz default SWCLK rate. Takes effect at the next
    /// [`SwdDriver::initialize`].
    pub fn set_clock(&mut self, clock_hz: u32) {
        self.clock_hz = clock_hz;
    }

    /// Releases the bus and clocks the turnaround bit, handing SWDIO to the
    /// target.
    fn turnaround_to_read(&self, cmd: &mut CommandBuffer) {
        cmd.set_pins(self.profile.idle_read).clock_bits(1);
    }

    /// Takes the bus back and clocks the turnaround bit.
    fn turnaround_to_write(&self, cmd: &mut CommandBuffer) {
        cmd.set_pins(self.profile.idle_write).clock_bits(1);
    }

    fn read_ack(&mut self) -> Result<Result<Ack, DapError>, MpsseError> {
        let mut response = [0u8; 1];
        self.device
            .read_bytes(&mut response, RESPONSE_TIMEOUT_MS)?;
        Ok(Ack::from_bits(response[0] >> 5))
    }
}

impl SwdDriver for MpsseSwd<'_> {
    fn initialize(&mut self) -> Result<u32, Error> {
        self.device.configure(self.clock_hz, self.profile.idle_write)?;

        // Line reset: 50 clocks with SWDIO held high, then exactly one idle
        // clock with the bus back in the write state.
        let mut cmd = CommandBuffer::new();
        cmd.set_pins(self.profile.reset_swd)
            .clock_bytes(6)
            .clock_bits(2)
            .set_pins(self.profile.idle_write)
            .clock_bits(1);
        self.device.write_bytes(cmd.as_bytes())?;

        let idcode = self.read(Port::Debug, 0).map_err(|e| {
            MpsseError::InitFailed {
                step: "reading IDCODE after line reset",
                source: io::Error::other(e),
            }
        })?;

        tracing::debug!(
            "debug port IDCODE = {idcode:#010x} (version {:x}, part {:x}, designer {:x})",
            idcode >> 28,
            (idcode >> 12) & 0xffff,
            (idcode >> 1) & 0x7ff,
        );

        Ok(idcode)
    }

    fn enter_reset(&mut self) -> Result<(), Error> {
        let mut cmd = CommandBuffer::new();
        cmd.set_pins(self.profile.reset_target);
        Ok(self.device.write_bytes(cmd.as_bytes())?)
    }

    fn leave_reset(&mut self) -> Result<(), Error> {
        let mut cmd = CommandBuffer::new();
        cmd.set_pins(self.profile.idle_write);
        Ok(self.device.write_bytes(cmd.as_bytes())?)
    }

    fn read(&mut self, port: Port, address: u8) -> Result<u32, Error> {
        tracing::trace!("SWD read {port:?} {address:#x}");

        let mut cmd = CommandBuffer::new();
        cmd.write_bits(8, request(address, port, Direction::Read));
        self.turnaround_to_read(&mut cmd);
        cmd.read_bits(3);
        self.device.write_bytes(cmd.as_bytes())?;

        let outcome = match self.read_ack()? {
            Ok(Ack::Ok) => {
                // Data phase: 32 data bits, then parity and the
                // target-to-host turnaround in one bit-mode read.
                let mut cmd = CommandBuffer::new();
                cmd.read_bytes(4).read_bits(2);
                self.device.write_bytes(cmd.as_bytes())?;

                let mut response = [0u8; 5];
                self.device
                    .read_bytes(&mut response, RESPONSE_TIMEOUT_MS)?;

                Ok((
                    u32::from_le_bytes([response[0], response[1], response[2], response[3]]),
                    (response[4] >> 6) & 1 == 1,
                ))
            }
            Ok(Ack::Wait) => Err(DapError::WaitResponse),
            Ok(Ack::Fault) => Err(DapError::FaultResponse),
            Err(e) => {
                tracing::warn!("received unexpected SWD response: {e}");
                Err(e)
            }
        };

        // Take the bus back whatever the outcome, so the next request
        // starts from a clean turnaround.
        let mut cleanup = CommandBuffer::new();
        self.turnaround_to_write(&mut cleanup);
        self.device.write_bytes(cleanup.as_bytes())?;

        let (data, parity) = outcome?;
        if parity != data_parity(data) {
            return Err(DapError::IncorrectParity.into());
        }

        tracing::trace!("SWD read {port:?} {address:#x} = {data:#010x}");
        Ok(data)
    }

    fn write(&mut self, port: Port, address: u8, data: u32) -> Result<(), Error> {
        tracing::trace!("SWD write {port:?} {address:#x} = {data:#010x}");

        let mut cmd = CommandBuffer::new();
        cmd.write_bits(8, request(address, port, Direction::Write));
        self.turnaround_to_read(&mut cmd);
        cmd.read_bits(3);
        self.turnaround_to_write(&mut cmd);
        self.device.write_bytes(cmd.as_bytes())?;

        let ack = self.read_ack()?;

        if ack == Ok(Ack::Ok) {
            let mut cmd = CommandBuffer::new();
            cmd.write_bytes(&data.to_le_bytes())
                .write_bits(1, if data_parity(data) { 0xff } else { 0x00 });
            self.device.write_bytes(cmd.as_bytes())?;
        }

        match ack {
            Ok(ack) => Ok(ack.check()?),
            Err(e) => {
                tracing::warn!("received unexpected SWD response: {e}");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mpsse::commands::*;
    use crate::probe::mpsse::scripted::ScriptedBackend;
    use crate::probe::UM232H;

    fn parity_byte(data: u32) -> u8 {
        if data_parity(data) {
            0x40
        } else {
            0x00
        }
    }

    fn device() -> (
        MpsseDevice,
        std::rc::Rc<std::cell::RefCell<crate::probe::mpsse::scripted::Script>>,
    ) {
        let (backend, script) = ScriptedBackend::new();
        (MpsseDevice::with_backend(Box::new(backend)), script)
    }

    #[test]
    fn dp_read_emits_the_expected_command_stream() {
        let (mut dev, script) = device();
        let idcode = 0x2ba0_1477u32;
        {
            let mut s = script.borrow_mut();
            s.reads.push_back(vec![0x20]); // ack = OK, MSB-justified
            let mut data = idcode.to_le_bytes().to_vec();
            data.push(parity_byte(idcode));
            s.reads.push_back(data);
        }

        let mut swd = MpsseSwd::new(&mut dev, &UM232H);
        let value = swd.read(Port::Debug, 0).unwrap();
        assert_eq!(value, idcode);

        let written = script.borrow().written.clone();
        #[rustfmt::skip]
        let expected = [
            // Request byte 0xA5, LSB-first.
            MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE, 7, 0xa5,
            // Turnaround to read.
            SET_BITS_LOW, 0x09, 0x09, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BITS, 0,
            // Three ack bits.
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB | MPSSE_BITMODE, 2,
            // Data phase: four bytes, then parity + turnaround.
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB, 3, 0,
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB | MPSSE_BITMODE, 1,
            // Cleanup turnaround back to write.
            SET_BITS_LOW, 0x09, 0x0b, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BITS, 0,
        ];
        assert_eq!(written, expected);
    }

    #[test]
    fn dp_write_sends_data_only_after_ok() {
        let (mut dev, script) = device();
        script.borrow_mut().reads.push_back(vec![0x20]);

        let mut swd = MpsseSwd::new(&mut dev, &UM232H);
        swd.write(Port::Debug, 0, 0x1e).unwrap();

        let written = script.borrow().written.clone();
        #[rustfmt::skip]
        let expected = [
            // Request byte 0x81.
            MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE, 7, 0x81,
            SET_BITS_LOW, 0x09, 0x09, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BITS, 0,
            MPSSE_DO_READ | MPSSE_READ_NEG | MPSSE_LSB | MPSSE_BITMODE, 2,
            SET_BITS_LOW, 0x09, 0x0b, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BITS, 0,
            // Data word 0x0000001E, then the parity bit (even ones → 0).
            MPSSE_DO_WRITE | MPSSE_LSB, 3, 0, 0x1e, 0x00, 0x00, 0x00,
            MPSSE_DO_WRITE | MPSSE_LSB | MPSSE_BITMODE, 0, 0x00,
        ];
        assert_eq!(written, expected);
    }

    #[test]
    fn wait_response_still_runs_cleanup() {
        let (mut dev, script) = device();
        script.borrow_mut().reads.push_back(vec![0x40]); // ack = WAIT

        let mut swd = MpsseSwd::new(&mut dev, &UM232H);
        let err = swd.read(Port::Access, 3).unwrap_err();
        assert!(err.is_transient());

        // The final bytes must be the cleanup turnaround.
        let written = script.borrow().written.clone();
        assert_eq!(
            &written[written.len() - 8..],
            &[SET_BITS_LOW, 0x09, 0x0b, SET_BITS_HIGH, 0x00, 0x00, CLK_BITS, 0]
        );
    }

    #[test]
    fn parity_mismatch_is_fatal() {
        let (mut dev, script) = device();
        {
            let mut s = script.borrow_mut();
            s.reads.push_back(vec![0x20]);
            let mut data = 0xdead_beefu32.to_le_bytes().to_vec();
            data.push(parity_byte(0xdead_beef) ^ 0x40);
            s.reads.push_back(data);
        }

        let mut swd = MpsseSwd::new(&mut dev, &UM232H);
        let err = swd.read(Port::Debug, 0).unwrap_err();
        assert!(matches!(err, Error::Dap(DapError::IncorrectParity)));
    }

    #[test]
    fn line_reset_clocks_fifty_bits_and_one_idle() {
        let (mut dev, script) = device();
        {
            let mut s = script.borrow_mut();
            // configure() handshake, then the IDCODE read transaction.
            s.reads.push_back(vec![BAD_COMMAND_ECHO, SYNC_BAD_COMMAND]);
            s.reads.push_back(vec![0x20]);
            let idcode = 0x2ba0_1477u32;
            let mut data = idcode.to_le_bytes().to_vec();
            data.push(parity_byte(idcode));
            s.reads.push_back(data);
        }

        let mut swd = MpsseSwd::new(&mut dev, &UM232H);
        assert_eq!(swd.initialize().unwrap(), 0x2ba0_1477);

        let written = script.borrow().written.clone();
        #[rustfmt::skip]
        let reset_sequence = [
            SET_BITS_LOW, 0x0b, 0x0b, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BYTES, 5, 0,
            CLK_BITS, 1,
            SET_BITS_LOW, 0x09, 0x0b, SET_BITS_HIGH, 0x00, 0x00,
            CLK_BITS, 0,
        ];
        assert!(
            written
                .windows(reset_sequence.len())
                .any(|w| w == reset_sequence),
            "line reset sequence not found in {written:02x?}"
        );
    }
}
