use crate::probe::MpsseError;
use crate::swd::DapError;

/// Errors produced by the SWD/DAP/target stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error in the USB/MPSSE transport below the SWD link.
    #[error("probe transport error")]
    Probe(#[from] MpsseError),

    /// An error reported by the target over the SWD wire protocol.
    #[error("SWD transaction failed")]
    Dap(#[from] DapError),

    /// An Access Port or memory address with nonzero low bits was passed to
    /// an operation that requires word alignment.
    #[error("address {0:#010x} is not word-aligned")]
    NotAligned(u32),

    /// A pipelined Access Port read was started while a previous one was
    /// still in flight. Consume it with `step_read_ap` or `read_rdbuff`
    /// first.
    #[error("a pipelined AP read is already pending")]
    ReadPending,

    /// The target kept answering WAIT (or stayed un-halted) for the whole
    /// retry budget.
    #[error("target did not respond within {retries} retries")]
    Timeout { retries: usize },

    /// Hardware breakpoints can only cover the code region (the low 512 MiB).
    #[error("address {0:#010x} is outside the breakpoint-capable code region")]
    BreakpointAddress(u32),

    /// The requested comparator does not exist on this part.
    #[error("breakpoint {index} exceeds the {available} comparators implemented")]
    BreakpointIndex { index: usize, available: usize },
}

impl Error {
    /// True for responses that a bounded retry may recover: an SWD WAIT.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Dap(DapError::WaitResponse))
    }
}
