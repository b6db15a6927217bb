//! `ftswd probe`: walk the target's debug topology.
//!
//! Reads the DP IDCODE, enumerates Access Ports, and crawls class-1 ROM
//! tables behind each MEM-AP, naming the Cortex-M debug blocks it
//! recognizes.

use anyhow::Context;
use ftswd::dap::{mem_ap, DebugAccessPort, DpIdr};
use ftswd::swd::{MpsseSwd, SwdDriver};
use ftswd::target::Target;
use ftswd::RemotePtr;
use jep106::JEP106Code;

use crate::common::ProbeOptions;

const ROM_TABLE_CLASS: u8 = 1;
const MEM_AP_CLASS: u8 = 8;

/// ROM-table crawls don't recurse deeper than this; real parts nest one or
/// two levels.
const MAX_DEPTH: usize = 3;

#[derive(Debug, clap::Args)]
pub struct Cmd {
    #[command(flatten)]
    probe: ProbeOptions,
}

impl Cmd {
    pub fn run(self) -> anyhow::Result<()> {
        let (mut device, profile) = self.probe.open()?;
        let mut swd = MpsseSwd::new(&mut device, &profile);
        swd.set_clock(self.probe.speed);

        let idcode = swd.initialize().context("attaching to the target")?;
        print_idcode(DpIdr::from(idcode));

        let mut dap = DebugAccessPort::new(swd);
        dap.reset_state()?;

        for ap in 0..=255u8 {
            let mut target = Target::new(&mut dap, ap);
            let idr = target.read_ap_register(mem_ap::IDR)?;
            if idr == 0 {
                break;
            }

            print_ap(ap, idr);

            if (idr >> 13) & 0xf == u32::from(MEM_AP_CLASS) {
                if let Err(e) = crawl_memory_ap(&mut target) {
                    tracing::warn!("AP {ap}: crawl failed: {e:#}");
                }
            }
        }

        Ok(())
    }
}

fn print_idcode(idr: DpIdr) {
    let designer = idr.designer();
    println!(
        "debug port: IDCODE {:#010x} (DPv{}, part {:#x}, designer {})",
        u32::from(idr),
        idr.version(),
        idr.partno(),
        designer.get().unwrap_or("<unknown>"),
    );
}

fn print_ap(ap: u8, idr: u32) {
    let class = (idr >> 13) & 0xf;
    let ap_type = idr & 0xf;
    let designer = JEP106Code::new(((idr >> 24) & 0xf) as u8, ((idr >> 17) & 0x7f) as u8);

    let kind = match (class as u8, ap_type as u8) {
        (MEM_AP_CLASS, 1) => "AHB MEM-AP",
        (MEM_AP_CLASS, 2) => "APB MEM-AP",
        (MEM_AP_CLASS, 4) => "AXI MEM-AP",
        (MEM_AP_CLASS, _) => "MEM-AP",
        (0, 0) => "JTAG-AP",
        _ => "unknown AP",
    };

    println!(
        "AP {ap:3}: IDR {idr:#010x} ({kind}, designer {})",
        designer.get().unwrap_or("<unknown>"),
    );
}

fn crawl_memory_ap<SWD: SwdDriver>(target: &mut Target<'_, SWD>) -> anyhow::Result<()> {
    let base = target.read_ap_register(mem_ap::BASE)?;

    // The two low bits signal an ADIv5-format BASE with a present debug
    // entry; anything else is a legacy device we cannot crawl.
    if base & 3 != 3 {
        println!("  BASE {base:#010x}: legacy (non-ADIv5) device, not crawling");
        return Ok(());
    }

    target.initialize(false)?;

    let regfile = base & !0xfff;
    println!("  BASE {base:#010x}, register file at {regfile:#010x}");

    crawl_component(target, regfile, 1)
}

fn crawl_component<SWD: SwdDriver>(
    target: &mut Target<'_, SWD>,
    regfile: u32,
    depth: usize,
) -> anyhow::Result<()> {
    let indent = "  ".repeat(depth.min(6));

    // Component ID registers live in the last 16 bytes of the block.
    let mut cid = [0u32; 4];
    target.read_words(RemotePtr::new(regfile + 0xff0), &mut cid)?;

    if (cid[0], cid[2], cid[3]) != (0x0d, 0x05, 0xb1) {
        println!("{indent}component at {regfile:#010x}: bad component ID {cid:08x?}");
        return Ok(());
    }

    // Peripheral ID4 gives the true size of the component in 4 KiB blocks;
    // the register file is the *last* block.
    let pid4 = target.read_word(RemotePtr::new(regfile + 0xfd0))?;
    let size = (1u32 << ((pid4 >> 4) & 0xf)) * 4096;
    let base_addr = regfile + 4096 - size;

    let class = ((cid[1] >> 4) & 0xf) as u8;
    match class {
        ROM_TABLE_CLASS => {
            let memtype = target.read_word(RemotePtr::new(regfile + 0xfcc))?;
            println!(
                "{indent}ROM table at {base_addr:#010x} ({})",
                if memtype & 1 != 0 {
                    "on the system bus"
                } else {
                    "on a dedicated bus"
                }
            );
            crawl_rom_table(target, base_addr, depth)
        }
        _ => {
            describe_peripheral(target, regfile, class, &indent)?;
            Ok(())
        }
    }
}

fn crawl_rom_table<SWD: SwdDriver>(
    target: &mut Target<'_, SWD>,
    base_addr: u32,
    depth: usize,
) -> anyhow::Result<()> {
    if depth >= MAX_DEPTH {
        tracing::warn!("ROM table nesting exceeds {MAX_DEPTH}, not descending");
        return Ok(());
    }

    let mut children = Vec::new();
    let mut entry_addr = RemotePtr::<u32>::new(base_addr);
    let entries_end = RemotePtr::<u32>::new(base_addr + 0xf00);

    while entry_addr < entries_end {
        let mut entry = target.read_word(entry_addr)?;
        entry_addr += 1;

        if entry & (1 << 1) == 0 {
            // 8-bit entry: the value is spread over four consecutive words.
            entry <<= 24;
            for _ in 0..3 {
                let part = target.read_word(entry_addr)?;
                entry_addr += 1;
                entry = (entry >> 8) | (part << 24);
            }
        }

        if entry == 0 {
            break;
        }
        if entry & 1 == 0 {
            continue;
        }

        let offset = entry & !0xfff;
        children.push(base_addr.wrapping_add(offset));
    }

    for child in children {
        if let Err(e) = crawl_component(target, child, depth + 1) {
            tracing::warn!("component at {child:#010x}: {e:#}");
        }
    }

    Ok(())
}

fn describe_peripheral<SWD: SwdDriver>(
    target: &mut Target<'_, SWD>,
    regfile: u32,
    class: u8,
    indent: &str,
) -> anyhow::Result<()> {
    // The generic-IP class on Cortex-M0 parts is unreliable; recognize the
    // architectural blocks by their fixed addresses instead.
    let name = match regfile {
        0xe000_e000 => "System Control Space",
        0xe000_1000 => "Data Watchpoint and Trace",
        0xe000_2000 => "Breakpoint Unit",
        0xe000_0000 => "Instrumentation Trace Macrocell",
        _ => {
            println!("{indent}peripheral at {regfile:#010x} (class {class:#x})");
            return Ok(());
        }
    };

    if regfile == 0xe000_e000 {
        let cpuid = target.read_word(RemotePtr::new(0xe000_ed00))?;
        println!(
            "{indent}{name} (CPUID {cpuid:#010x}, {})",
            cortex_m_name(cpuid)
        );
    } else {
        println!("{indent}{name}");
    }

    Ok(())
}

fn cortex_m_name(cpuid: u32) -> &'static str {
    match (cpuid >> 4) & 0xfff {
        0xc20 => "Cortex-M0",
        0xc60 => "Cortex-M0+",
        0xc21 => "Cortex-M1",
        0xc23 => "Cortex-M3",
        0xc24 => "Cortex-M4",
        0xc27 => "Cortex-M7",
        _ => "unknown core",
    }
}
