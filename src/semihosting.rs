//! ARM semihosting, host side.
//!
//! A semihosting target executes `BKPT 0xAB` (the halfword `0xBEAB`) with an
//! operation code in R0 and a parameter in R1. The host services the request
//! and resumes the core past the breakpoint.

use std::io;

use crate::remote::RemotePtr;
use crate::swd::SwdDriver;
use crate::target::registers::Dfsr;
use crate::target::{CoreRegister, Target};
use crate::Error;

/// The semihosting breakpoint instruction.
pub const SEMIHOST_BKPT: u16 = 0xbeab;

mod operation {
    /// Write the byte in R1 to the host console.
    pub const SYS_WRITEC: u32 = 0x3;
    /// Write the zero-terminated string R1 points at.
    pub const SYS_WRITE0: u32 = 0x4;
    /// Read one byte from the host console into R0.
    pub const SYS_READC: u32 = 0x7;
}

#[derive(Debug, thiserror::Error)]
pub enum SemihostingError {
    #[error(transparent)]
    Target(#[from] Error),

    #[error("console I/O failed")]
    Io(#[from] io::Error),

    #[error("core halted for non-breakpoint reason (DFSR {0:#x})")]
    UnexpectedHaltReason(u32),

    #[error("non-semihosting breakpoint {instruction:#06x} at {pc:#010x}")]
    UnexpectedBreakpoint { instruction: u16, pc: u32 },

    #[error("unsupported semihosting operation {0:#x}")]
    UnsupportedOperation(u32),
}

/// The host side of the semihosting console.
pub trait Console {
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// Console over the process's stdin/stdout.
#[derive(Debug, Default)]
pub struct StdioConsole;

impl Console for StdioConsole {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        use io::Write;
        let mut stdout = io::stdout();
        stdout.write_all(&[byte])?;
        stdout.flush()
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        use io::Read;
        let mut byte = [0u8; 1];
        io::stdin().read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Reads a zero-terminated byte string from target memory.
///
/// The target side only supports word transfers, so the string is read a
/// word at a time from the enclosing aligned address and unpacked byte by
/// byte, whatever the string's alignment.
pub fn read_string<SWD: SwdDriver>(
    target: &mut Target<'_, SWD>,
    address: u32,
) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();

    let mut word_addr = RemotePtr::<u32>::new(address & !3);
    let mut word = target.read_word(word_addr)? >> ((address & 3) * 8);
    let mut left_in_word = 4 - (address & 3);

    loop {
        while left_in_word > 0 {
            let byte = (word & 0xff) as u8;
            if byte == 0 {
                return Ok(bytes);
            }
            bytes.push(byte);
            word >>= 8;
            left_in_word -= 1;
        }

        word_addr += 1;
        word = target.read_word(word_addr)?;
        left_in_word = 4;
    }
}

/// Services one halt of a semihosting target.
///
/// Expects the core to be halted at a `BKPT`; decodes the instruction,
/// dispatches the operation, advances the PC past the breakpoint and
/// resumes.
pub fn handle_halt<SWD: SwdDriver, C: Console>(
    target: &mut Target<'_, SWD>,
    console: &mut C,
) -> Result<(), SemihostingError> {
    let reason = target.read_halt_state()?;
    if reason & Dfsr::BKPT == 0 {
        return Err(SemihostingError::UnexpectedHaltReason(reason));
    }

    let pc = target.read_register(CoreRegister::PC)?;

    // The PC is halfword-aligned but the bus only does words: fetch the
    // enclosing word and pick the halfword.
    let instr_word = target.read_word(RemotePtr::new(pc & !3))?;
    let instruction = if pc & 2 != 0 {
        (instr_word >> 16) as u16
    } else {
        instr_word as u16
    };

    if instruction != SEMIHOST_BKPT {
        return Err(SemihostingError::UnexpectedBreakpoint { instruction, pc });
    }

    let op = target.read_register(CoreRegister::R0)?;
    let parameter = target.read_register(CoreRegister::R1)?;

    match op {
        operation::SYS_WRITEC => {
            tracing::debug!("SYS_WRITEC {parameter:#04x}");
            console.write_byte(parameter as u8)?;
        }
        operation::SYS_WRITE0 => {
            tracing::debug!("SYS_WRITE0 {parameter:#010x}");
            for byte in read_string(target, parameter)? {
                console.write_byte(byte)?;
            }
        }
        operation::SYS_READC => {
            tracing::debug!("SYS_READC");
            let byte = console.read_byte()?;
            target.write_register(CoreRegister::R0, u32::from(byte))?;
        }
        other => {
            tracing::warn!("unsupported semihosting operation {other:#x}");
            return Err(SemihostingError::UnsupportedOperation(other));
        }
    }

    // Step past the BKPT and let the target run on.
    target.write_register(CoreRegister::PC, pc.wrapping_add(2))?;
    target.reset_halt_state()?;
    target.resume()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::DebugAccessPort;
    use crate::swd::mock::MockDap;

    struct TestConsole {
        output: Vec<u8>,
        input: std::collections::VecDeque<u8>,
    }

    impl TestConsole {
        fn new() -> Self {
            Self {
                output: Vec::new(),
                input: std::collections::VecDeque::new(),
            }
        }
    }

    impl Console for TestConsole {
        fn write_byte(&mut self, byte: u8) -> io::Result<()> {
            self.output.push(byte);
            Ok(())
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            self.input
                .pop_front()
                .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
        }
    }

    fn fixture() -> DebugAccessPort<MockDap> {
        let mut dap = DebugAccessPort::new(MockDap::new());
        dap.reset_state().unwrap();
        dap
    }

    /// Parks the mock at a semihosting BKPT with the given R0/R1.
    fn arm_semihost(mock: &mut MockDap, pc: u32, r0: u32, r1: u32) {
        let word = if pc & 2 != 0 {
            u32::from(SEMIHOST_BKPT) << 16
        } else {
            u32::from(SEMIHOST_BKPT)
        };
        mock.set_mem(pc & !3, word);
        mock.regs[0] = r0;
        mock.regs[1] = r1;
        mock.debug_enabled = true;
        mock.halt_at_breakpoint(pc);
    }

    #[test]
    fn write0_reads_strings_at_every_alignment() {
        for misalign in 0..4u32 {
            let mut dap = fixture();
            let string_addr = 0x2000_0010 + misalign;
            dap.swd_mut().set_bytes(string_addr, b"hello, target\0");
            arm_semihost(dap.swd_mut(), 0x0000_0020, 0x4, string_addr);

            let mut target = Target::new(&mut dap, 0);
            target.initialize(true).unwrap();

            let mut console = TestConsole::new();
            handle_halt(&mut target, &mut console).unwrap();

            assert_eq!(console.output, b"hello, target", "misalign={misalign}");
            // The core moved past the BKPT and is running again.
            assert_eq!(target.dap().swd_mut().regs[15], 0x22);
            assert!(!target.dap().swd_mut().halted);
        }
    }

    #[test]
    fn writec_emits_one_byte() {
        let mut dap = fixture();
        // PC on the upper halfword of its word.
        arm_semihost(dap.swd_mut(), 0x0000_0102, 0x3, u32::from(b'!'));

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        let mut console = TestConsole::new();
        handle_halt(&mut target, &mut console).unwrap();
        assert_eq!(console.output, b"!");
    }

    #[test]
    fn readc_stores_the_byte_in_r0() {
        let mut dap = fixture();
        arm_semihost(dap.swd_mut(), 0x0000_0040, 0x7, 0);

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        let mut console = TestConsole::new();
        console.input.push_back(b'x');
        handle_halt(&mut target, &mut console).unwrap();

        assert_eq!(target.dap().swd_mut().regs[0], u32::from(b'x'));
    }

    #[test]
    fn foreign_breakpoints_are_reported() {
        let mut dap = fixture();
        arm_semihost(dap.swd_mut(), 0x0000_0060, 0x3, 0);
        // Overwrite the instruction with a non-semihosting BKPT.
        dap.swd_mut().set_mem(0x60, 0xbe00);

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        let mut console = TestConsole::new();
        let err = handle_halt(&mut target, &mut console).unwrap_err();
        assert!(matches!(
            err,
            SemihostingError::UnexpectedBreakpoint {
                instruction: 0xbe00,
                pc: 0x60
            }
        ));
    }

    #[test]
    fn unsupported_operations_are_reported() {
        let mut dap = fixture();
        arm_semihost(dap.swd_mut(), 0x0000_0080, 0x18, 0x20026);

        let mut target = Target::new(&mut dap, 0);
        target.initialize(true).unwrap();

        let mut console = TestConsole::new();
        let err = handle_halt(&mut target, &mut console).unwrap_err();
        assert!(matches!(err, SemihostingError::UnsupportedOperation(0x18)));
    }
}
