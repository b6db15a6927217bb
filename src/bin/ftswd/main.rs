mod common;
mod dump;
mod flash;
mod host;
mod probe;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser)]
#[command(
    name = "ftswd",
    about = "SWD debug toolkit for Cortex-M targets behind FTDI bridges",
    version
)]
struct Cli {
    /// Log verbosity: 0 = warnings, 1 = info, 2 = debug, 3+ = trace.
    /// RUST_LOG overrides this when set.
    #[arg(long, global = true, default_value_t = 0)]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Explore the target's debug topology (DP, APs, ROM tables)
    Probe(probe::Cmd),
    /// Dump words of target memory
    Dump(dump::Cmd),
    /// Program a binary image into LPC111x/13xx flash
    Flash(flash::Cmd),
    /// Run a semihosting console against the target
    Host(host::Cmd),
}

fn init_logging(level: u8) {
    let default = match level {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Command::Probe(cmd) => cmd.run(),
        Command::Dump(cmd) => cmd.run(),
        Command::Flash(cmd) => cmd.run(),
        Command::Host(cmd) => cmd.run(),
    };

    if let Err(error) = result {
        // Innermost cause first, the way the failure actually unfolded.
        for (depth, cause) in error.chain().rev().enumerate() {
            eprintln!("error[{depth}]: {cause}");
        }
        std::process::exit(1);
    }
}
