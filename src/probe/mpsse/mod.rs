//! The USB/MPSSE shim.
//!
//! [`MpsseDevice`] owns the USB side of an FT232H-class chip and exposes the
//! two primitives the SWD driver needs: `write_bytes` (bulk OUT) and
//! `read_bytes` (bulk IN with a millisecond poll loop). The FTDI silicon is
//! driven with raw vendor control requests; no libftdi is involved.

pub mod commands;
mod error;

pub use error::MpsseError;

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use nusb::DeviceInfo;

use crate::probe::usb::InterfaceExt;
use crate::probe::{PinState, Profile};
use commands::CommandBuffer;

// FTDI vendor request codes.
const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0b;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Upper bound for a single bulk OUT transfer.
const WRITE_CHUNK_SIZE: usize = 65536;

/// How long the FTDI chip buffers data before pushing a short packet to the
/// host. One millisecond keeps the `read_bytes` poll loop tight.
const LATENCY_TIMER_MS: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    Reset = 0,
    Mpsse = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    Am,
    Bm,
    FT2232C,
    R,
    FT2232H,
    FT4232H,
    FT232H,
    FT230X,
}

/// The USB operations the shim needs from an FTDI chip. Production code uses
/// [`FtdiUsb`]; tests substitute a scripted transport.
pub(crate) trait FtdiBackend {
    fn usb_reset(&mut self) -> Result<(), MpsseError>;
    fn purge_buffers(&mut self) -> Result<(), MpsseError>;
    fn set_latency_timer(&mut self, ms: u8) -> Result<(), MpsseError>;
    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), MpsseError>;
    fn write(&mut self, data: &[u8]) -> Result<usize, MpsseError>;
    /// One read attempt; returns however many payload bytes were available,
    /// possibly zero.
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, MpsseError>;
}

/// Raw-USB FTDI backend over nusb.
struct FtdiUsb {
    interface: nusb::Interface,
    /// FTDI port index, 1-based as the control requests expect.
    index: u16,
    read_ep: u8,
    write_ep: u8,
    /// Data left over from a bulk packet after the destination filled up.
    read_queue: VecDeque<u8>,
    packet_buf: Box<[u8]>,
    max_packet_size: usize,
}

impl FtdiUsb {
    fn open(info: &DeviceInfo, ftdi_interface: u8) -> Result<Self, MpsseError> {
        let device = info.open().map_err(|e| MpsseError::InitFailed {
            step: "opening the USB device",
            source: e,
        })?;

        // Find the matching interface's bulk endpoints so we can size the
        // status-stripping buffer correctly.
        let mut max_packet_size = 64;
        if let Ok(config) = device.active_configuration() {
            for intf in config.interfaces() {
                if intf.interface_number() != ftdi_interface {
                    continue;
                }
                for alt in intf.alt_settings() {
                    for ep in alt.endpoints() {
                        max_packet_size = max_packet_size.max(ep.max_packet_size());
                    }
                }
            }
        }

        let interface =
            device
                .claim_interface(ftdi_interface)
                .map_err(|e| MpsseError::InterfaceFailed {
                    interface: ftdi_interface,
                    source: e,
                })?;

        Ok(Self {
            interface,
            index: ftdi_interface as u16 + 1,
            read_ep: 0x81 + 2 * ftdi_interface,
            write_ep: 0x02 + 2 * ftdi_interface,
            read_queue: VecDeque::new(),
            packet_buf: vec![0; max_packet_size].into_boxed_slice(),
            max_packet_size,
        })
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), io::Error> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.index,
                },
                &[],
                Duration::from_secs(1),
            )
            .map_err(io::Error::other)?;
        Ok(())
    }
}

impl FtdiBackend for FtdiUsb {
    fn usb_reset(&mut self) -> Result<(), MpsseError> {
        self.read_queue.clear();
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
            .map_err(MpsseError::ResetFailed)
    }

    fn purge_buffers(&mut self) -> Result<(), MpsseError> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.read_queue.clear();
        Ok(())
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<(), MpsseError> {
        Ok(self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, ms as u16)?)
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), MpsseError> {
        Ok(self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([mask, mode as u8]),
        )?)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, MpsseError> {
        let mut total = 0;
        for chunk in data.chunks(self.max_packet_size) {
            total += self
                .interface
                .write_bulk(self.write_ep, chunk, Duration::from_secs(5))?;
        }
        Ok(total)
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, MpsseError> {
        let mut total = 0;

        while total < buf.len() {
            if let Some(byte) = self.read_queue.pop_front() {
                buf[total] = byte;
                total += 1;
                continue;
            }

            let read = match self.interface.read_bulk(
                self.read_ep,
                &mut self.packet_buf,
                Duration::from_millis(1),
            ) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            };

            // Every bulk IN packet starts with two modem-status bytes.
            if read <= 2 {
                break;
            }
            let payload = &self.packet_buf[2..read];

            let copy = payload.len().min(buf.len() - total);
            buf[total..total + copy].copy_from_slice(&payload[..copy]);
            total += copy;
            self.read_queue.extend(&payload[copy..]);
        }

        Ok(total)
    }
}

/// An FT232H-class chip in MPSSE mode.
///
/// Single-threaded: the owner serializes all operations. Dropping the device
/// resets the bitmode, releasing the pins before the USB handles close.
pub struct MpsseDevice {
    backend: Box<dyn FtdiBackend>,
    chip_type: Option<ChipType>,
}

impl std::fmt::Debug for MpsseDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpsseDevice")
            .field("chip_type", &self.chip_type)
            .finish()
    }
}

impl MpsseDevice {
    /// Opens the first USB device matching the profile's VID:PID and claims
    /// the configured FTDI interface.
    pub fn open(profile: &Profile) -> Result<Self, MpsseError> {
        let info = nusb::list_devices()
            .map_err(|e| MpsseError::InitFailed {
                step: "enumerating USB devices",
                source: e,
            })?
            .find(|d| d.vendor_id() == profile.vid && d.product_id() == profile.pid)
            .ok_or(MpsseError::OpenFailed {
                vid: profile.vid,
                pid: profile.pid,
            })?;

        let chip_type = match info.device_version() {
            0x200 if info.serial_number().is_none() => Some(ChipType::Bm),
            0x200 => Some(ChipType::Am),
            0x400 => Some(ChipType::Bm),
            0x500 => Some(ChipType::FT2232C),
            0x600 => Some(ChipType::R),
            0x700 => Some(ChipType::FT2232H),
            0x800 => Some(ChipType::FT4232H),
            0x900 => Some(ChipType::FT232H),
            0x1000 => Some(ChipType::FT230X),
            version => {
                tracing::warn!("unknown FTDI device version {version:#x}");
                None
            }
        };

        let mut backend = FtdiUsb::open(&info, profile.interface)?;
        backend.usb_reset()?;

        tracing::debug!("opened FTDI device: {chip_type:?}");

        Ok(Self {
            backend: Box::new(backend),
            chip_type,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(backend: Box<dyn FtdiBackend>) -> Self {
        Self {
            backend,
            chip_type: None,
        }
    }

    pub fn chip_type(&self) -> Option<ChipType> {
        self.chip_type
    }

    /// Puts the chip into MPSSE mode, verifies it is alive, and programs the
    /// clock and idle pin state.
    ///
    /// The liveness check writes the deliberately-invalid opcode `0xAA` and
    /// expects the `0xFA 0xAA` bad-command echo back.
    pub fn configure(&mut self, clock_hz: u32, idle: PinState) -> Result<(), MpsseError> {
        self.backend.set_latency_timer(LATENCY_TIMER_MS)?;
        self.backend.purge_buffers()?;
        self.backend.set_bitmode(0x00, BitMode::Reset)?;
        self.backend.set_bitmode(0x00, BitMode::Mpsse)?;

        self.synchronize()?;

        let mut setup = CommandBuffer::new();
        setup
            .push(commands::DIS_DIV_5)
            .push(commands::DIS_ADAPTIVE)
            .push(commands::DIS_3_PHASE)
            .push(commands::EN_3_PHASE)
            .tck_divisor(clock_hz)
            .set_pins(idle);
        self.write_bytes(setup.as_bytes())?;

        tracing::debug!("MPSSE configured for {clock_hz} Hz");
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), MpsseError> {
        self.write_bytes(&[commands::SYNC_BAD_COMMAND])?;

        let mut response = [0u8; 2];
        self.read_bytes(&mut response, 1000)?;

        if response != [commands::BAD_COMMAND_ECHO, commands::SYNC_BAD_COMMAND] {
            return Err(MpsseError::SyncFailed {
                response: response.to_vec(),
            });
        }
        Ok(())
    }

    /// Submits a bulk OUT transfer; the whole buffer must go through.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), MpsseError> {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            let written = self.backend.write(chunk)?;
            if written != chunk.len() {
                return Err(MpsseError::ShortWrite {
                    requested: chunk.len(),
                    written,
                });
            }
        }
        Ok(())
    }

    /// Polls bulk IN until `dst` is full or `timeout_ms` elapses, sleeping
    /// one latency period between attempts. Returns the number of attempts
    /// taken, for diagnostics.
    pub fn read_bytes(&mut self, dst: &mut [u8], timeout_ms: u32) -> Result<u32, MpsseError> {
        let mut received = 0;

        for attempt in 0..timeout_ms {
            received += self.backend.poll_read(&mut dst[received..])?;

            if received >= dst.len() {
                tracing::trace!("response took {} attempts", attempt + 1);
                return Ok(attempt + 1);
            }

            thread::sleep(Duration::from_millis(u64::from(LATENCY_TIMER_MS)));
        }

        Err(MpsseError::Timeout {
            expected: dst.len(),
            received,
        })
    }
}

impl Drop for MpsseDevice {
    fn drop(&mut self) {
        // Releases the pins; the USB handles close when the backend drops.
        if let Err(e) = self.backend.set_bitmode(0xff, BitMode::Reset) {
            tracing::warn!("failed to reset bitmode on close: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! A scripted FTDI transport for unit tests: records everything the shim
    //! writes and plays back canned read data.

    use super::{BitMode, FtdiBackend, MpsseError};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub struct Script {
        pub written: Vec<u8>,
        pub reads: VecDeque<Vec<u8>>,
        pub bitmodes: Vec<(u8, BitMode)>,
        pub latency: Option<u8>,
        pub purges: usize,
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        pub state: Rc<RefCell<Script>>,
    }

    impl ScriptedBackend {
        pub fn new() -> (Self, Rc<RefCell<Script>>) {
            let state = Rc::new(RefCell::new(Script::default()));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl FtdiBackend for ScriptedBackend {
        fn usb_reset(&mut self) -> Result<(), MpsseError> {
            Ok(())
        }

        fn purge_buffers(&mut self) -> Result<(), MpsseError> {
            self.state.borrow_mut().purges += 1;
            Ok(())
        }

        fn set_latency_timer(&mut self, ms: u8) -> Result<(), MpsseError> {
            self.state.borrow_mut().latency = Some(ms);
            Ok(())
        }

        fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), MpsseError> {
            self.state.borrow_mut().bitmodes.push((mask, mode));
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, MpsseError> {
            self.state.borrow_mut().written.extend_from_slice(data);
            Ok(data.len())
        }

        fn poll_read(&mut self, buf: &mut [u8]) -> Result<usize, MpsseError> {
            let mut state = self.state.borrow_mut();
            let Some(front) = state.reads.front_mut() else {
                return Ok(0);
            };
            let n = front.len().min(buf.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            if front.is_empty() {
                state.reads.pop_front();
            }
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedBackend;
    use super::*;
    use crate::probe::UM232H;

    #[test]
    fn configure_synchronizes_then_programs_the_clock() {
        let (backend, script) = ScriptedBackend::new();
        script
            .borrow_mut()
            .reads
            .push_back(vec![commands::BAD_COMMAND_ECHO, commands::SYNC_BAD_COMMAND]);

        let mut dev = MpsseDevice::with_backend(Box::new(backend));
        dev.configure(1_000_000, UM232H.idle_write).unwrap();

        let state = script.borrow();
        assert_eq!(state.latency, Some(1));
        assert_eq!(state.purges, 1);
        assert_eq!(
            state.bitmodes,
            vec![(0x00, BitMode::Reset), (0x00, BitMode::Mpsse)]
        );
        assert_eq!(
            state.written,
            vec![
                commands::SYNC_BAD_COMMAND,
                commands::DIS_DIV_5,
                commands::DIS_ADAPTIVE,
                commands::DIS_3_PHASE,
                commands::EN_3_PHASE,
                commands::TCK_DIVISOR,
                29,
                0,
                commands::SET_BITS_LOW,
                0x09,
                0x0b,
                commands::SET_BITS_HIGH,
                0x00,
                0x00,
            ]
        );
    }

    #[test]
    fn configure_fails_on_bad_handshake() {
        let (backend, script) = ScriptedBackend::new();
        script.borrow_mut().reads.push_back(vec![0x00, 0x00]);

        let mut dev = MpsseDevice::with_backend(Box::new(backend));
        let err = dev.configure(1_000_000, UM232H.idle_write).unwrap_err();
        assert!(matches!(err, MpsseError::SyncFailed { .. }));
    }

    #[test]
    fn read_times_out_when_data_never_arrives() {
        let (backend, _script) = ScriptedBackend::new();
        let mut dev = MpsseDevice::with_backend(Box::new(backend));

        let mut buf = [0u8; 4];
        let err = dev.read_bytes(&mut buf, 3).unwrap_err();
        assert!(matches!(
            err,
            MpsseError::Timeout {
                expected: 4,
                received: 0
            }
        ));
    }

    #[test]
    fn read_reports_attempts_taken() {
        let (backend, script) = ScriptedBackend::new();
        let mut dev = MpsseDevice::with_backend(Box::new(backend));

        script.borrow_mut().reads.push_back(vec![0xaa, 0xbb]);
        let mut buf = [0u8; 2];
        assert_eq!(dev.read_bytes(&mut buf, 10).unwrap(), 1);
        assert_eq!(buf, [0xaa, 0xbb]);
    }
}
