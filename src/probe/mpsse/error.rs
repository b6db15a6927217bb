use std::io;

/// Errors from the USB/MPSSE transport layer.
#[derive(Debug, thiserror::Error)]
pub enum MpsseError {
    #[error("unknown programmer '{0}' (known: um232h, bus_blaster)")]
    UnknownProgrammer(String),

    #[error("no USB device found with VID:PID {vid:04x}:{pid:04x}")]
    OpenFailed { vid: u16, pid: u16 },

    #[error("could not claim FTDI interface {interface}")]
    InterfaceFailed {
        interface: u8,
        #[source]
        source: io::Error,
    },

    #[error("USB reset of the FTDI device failed")]
    ResetFailed(#[source] io::Error),

    #[error("FTDI setup failed while {step}")]
    InitFailed {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("MPSSE synchronization handshake failed (expected FA AA, got {response:02x?})")]
    SyncFailed { response: Vec<u8> },

    #[error("read timed out with {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },

    #[error("short bulk write ({written} of {requested} bytes)")]
    ShortWrite { requested: usize, written: usize },

    #[error("USB transfer failed")]
    Usb(#[from] io::Error),
}
