//! Host-side flash programming for NXP LPC111x/LPC13xx parts.
//!
//! These parts carry an In-Application-Programming ROM with a fixed entry
//! point. The loader builds a call frame by hand: a command/response table
//! and a scratch stack in SRAM, R0/R1 pointing at the table, LR aimed back
//! at the table with the Thumb bit set, and hardware breakpoint 0 armed on
//! the table address so the ROM "returns" straight into a breakpoint trap.

use std::time::Duration;

use crate::remote::RemotePtr;
use crate::swd::SwdDriver;
use crate::target::{CoreRegister, Target};
use crate::Error;

/// IAP ROM entry point. A real code pointer, not a Thumb-style address.
const IAP_ENTRY: u32 = 0x1fff_1ff0;

/// Base of on-chip SRAM, where the workspace lives.
const WORKSPACE_BASE: u32 = 0x1000_0000;

/// The command/response table never exceeds five words; the table is reused
/// for the response.
const TABLE_WORDS: u32 = 5;

/// Stack top for IAP calls: comfortably past the table, 8-byte aligned,
/// leaving well over the 128 bytes the ROM needs.
const STACK_TOP: u32 = WORKSPACE_BASE + 0x1f8;

/// Staging buffer for flash data, above the stack.
const DATA_BUFFER: u32 = WORKSPACE_BASE + 0x200;

/// Flash geometry shared by the LPC111x/13xx families.
const SECTOR_BYTES: u32 = 4096;
/// Smallest copy-to-flash granule the ROM accepts.
const BLOCK_BYTES: u32 = 256;

/// System clock handed to the IAP ROM, in kHz (the 12 MHz IRC).
const CCLK_KHZ: u32 = 12_000;

/// SYSCON memory remap register; writing `MAP_USER_FLASH` unmaps the boot
/// ROM from address zero.
const SYSMEMREMAP: RemotePtr<u32> = RemotePtr::new(0x4004_8000);
const MAP_USER_FLASH: u32 = 2;

mod iap_command {
    pub const PREPARE_SECTORS: u32 = 50;
    pub const COPY_RAM_TO_FLASH: u32 = 51;
    pub const ERASE_SECTORS: u32 = 52;
}

/// IAP status word for a successful command.
const CMD_SUCCESS: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error(transparent)]
    Target(#[from] Error),

    #[error("IAP command {command} failed with status {status}")]
    Iap { command: u32, status: u32 },

    #[error("core halted with unexpected DFSR reason {0:#x} during IAP call")]
    UnexpectedHaltReason(u32),

    #[error("flash base address {0:#010x} is not sector-aligned")]
    UnalignedBase(u32),

    #[error("image of {0} bytes is too small to carry a vector checksum")]
    ImageTooSmall(usize),
}

/// Recomputes word 7 of an image as the two's complement of the sum of
/// words 0..=6, which the LPC boot ROM checks before it will run the image.
pub fn fix_lpc_checksum(image: &mut [u8]) -> Result<(), FlashError> {
    if image.len() < 32 {
        return Err(FlashError::ImageTooSmall(image.len()));
    }

    let sum = image[..28]
        .chunks_exact(4)
        .fold(0u32, |acc, w| {
            acc.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        });

    image[28..32].copy_from_slice(&0u32.wrapping_sub(sum).to_le_bytes());
    Ok(())
}

/// Programs flat binary images into LPC111x/13xx flash through the IAP ROM.
///
/// The target must already be initialized and halted; the loader leaves it
/// halted at the end of the last IAP call.
pub struct LpcFlasher<'t, 'dap, SWD> {
    target: &'t mut Target<'dap, SWD>,
}

impl<'t, 'dap, SWD: SwdDriver> LpcFlasher<'t, 'dap, SWD> {
    pub fn new(target: &'t mut Target<'dap, SWD>) -> Self {
        Self { target }
    }

    /// Erases the sectors covering `base..base + image.len()` and programs
    /// `image` in 256-byte blocks.
    pub fn program(&mut self, image: &[u8], base: u32) -> Result<(), FlashError> {
        if base % SECTOR_BYTES != 0 {
            return Err(FlashError::UnalignedBase(base));
        }
        if image.is_empty() {
            return Ok(());
        }

        // With the boot ROM mapped over address zero, verification and the
        // ROM's own flash reads would see the wrong memory.
        self.target.write_word(SYSMEMREMAP, MAP_USER_FLASH)?;

        self.target.enable_breakpoints()?;
        self.target.enable_breakpoint(0, WORKSPACE_BASE)?;

        let first_sector = base / SECTOR_BYTES;
        let last_sector = (base + image.len() as u32 - 1) / SECTOR_BYTES;

        tracing::info!(
            "erasing sectors {first_sector}..={last_sector} ({} bytes)",
            image.len()
        );
        self.invoke(iap_command::PREPARE_SECTORS, &[first_sector, last_sector])?;
        self.invoke(
            iap_command::ERASE_SECTORS,
            &[first_sector, last_sector, CCLK_KHZ],
        )?;

        for (index, block) in image.chunks(BLOCK_BYTES as usize).enumerate() {
            let dest = base + index as u32 * BLOCK_BYTES;
            let sector = dest / SECTOR_BYTES;

            // Short final blocks are padded with erased flash.
            let mut words = [0xffff_ffffu32; (BLOCK_BYTES / 4) as usize];
            for (slot, chunk) in words.iter_mut().zip(block.chunks(4)) {
                let mut bytes = [0xff; 4];
                bytes[..chunk.len()].copy_from_slice(chunk);
                *slot = u32::from_le_bytes(bytes);
            }

            tracing::debug!("programming {BLOCK_BYTES} bytes at {dest:#010x}");
            self.target
                .write_words(&words, RemotePtr::new(DATA_BUFFER))?;

            self.invoke(iap_command::PREPARE_SECTORS, &[sector, sector])?;
            self.invoke(
                iap_command::COPY_RAM_TO_FLASH,
                &[dest, DATA_BUFFER, BLOCK_BYTES, CCLK_KHZ],
            )?;
        }

        self.target.disable_breakpoint(0)?;
        Ok(())
    }

    /// One IAP ROM call: populate the table, forge the call frame, run to
    /// the breakpoint, check the status word.
    fn invoke(&mut self, command: u32, params: &[u32]) -> Result<(), FlashError> {
        debug_assert!(params.len() < TABLE_WORDS as usize);

        let table = RemotePtr::<u32>::new(WORKSPACE_BASE);
        let mut table_words = [0u32; TABLE_WORDS as usize];
        table_words[0] = command;
        table_words[1..=params.len()].copy_from_slice(params);
        self.target.write_words(&table_words, table)?;

        self.target.write_register(CoreRegister::R0, table.bits())?;
        self.target.write_register(CoreRegister::R1, table.bits())?;
        self.target.write_register(CoreRegister::SP, STACK_TOP)?;
        self.target.write_register(CoreRegister::PC, IAP_ENTRY)?;
        // Thumb bit set: the ROM returns through LR into our breakpoint.
        self.target
            .write_register(CoreRegister::LR, table.bits() | 1)?;

        self.target.reset_halt_state()?;
        self.target.resume()?;

        self.wait_for_breakpoint()?;

        let status = self.target.read_word(table)?;
        if status != CMD_SUCCESS {
            return Err(FlashError::Iap { command, status });
        }
        Ok(())
    }

    fn wait_for_breakpoint(&mut self) -> Result<(), FlashError> {
        let mut halted = false;
        for _ in 0..100 {
            if self.target.is_halted()? {
                halted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if !halted {
            return Err(Error::Timeout { retries: 100 }.into());
        }

        let reason = self.target.read_halt_state()?;
        if reason & crate::target::registers::Dfsr::BKPT == 0 {
            return Err(FlashError::UnexpectedHaltReason(reason));
        }
        Ok(())
    }
}
