use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};

/// How long a blocking transport call may sleep before returning empty.
///
/// The underlying OS handle cannot be made non-blocking, so reads and
/// writes poll at this granularity; it bounds how long connection
/// shutdown waits for an in-flight call when cancellation is
/// unsupported.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// [RS-232 modem control line](https://en.wikipedia.org/wiki/RS-232#Data_and_control_signals)
/// state, outgoing ("DTE to DCE") and incoming ("DCE to DTE").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSignals {
    /// Data Terminal Ready (outgoing).
    pub dtr: bool,
    /// Data Set Ready (incoming).
    pub dsr: bool,
    /// Clear To Send (incoming).
    pub cts: bool,
    /// Ready To Send (outgoing).
    pub rts: bool,
    /// Ring Indicator (incoming).
    pub ri: bool,
    /// Carrier Detect (incoming).
    pub cd: bool,
    /// Whether a continuous BREAK condition is being sent (outgoing).
    pub sending_break: bool,
}

/// One open serial device handle.
///
/// This is the capability the I/O engine drives: a minimal blocking
/// byte-pipe plus line-control access. Implementations may return
/// `Ok(0)` from [`Transport::read_some`] and [`Transport::write_some`]
/// after an internal poll timeout; callers are expected to re-check
/// their own state and retry.
pub trait Transport: Send {
    /// Blocks until at least one byte arrives (or the internal poll
    /// timeout passes), reading into `buf`.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// How many more bytes can be read right now without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Writes some prefix of `buf`, blocking no longer than the internal
    /// poll timeout. Short writes are allowed.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Blocks until queued output has been transmitted.
    fn flush(&mut self) -> io::Result<()>;

    /// Best-effort cancellation of in-flight blocking calls on any clone
    /// of this handle.
    fn cancel_pending(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cancellation not supported",
        ))
    }

    /// Current control line state.
    fn signals(&mut self) -> io::Result<ControlSignals>;

    /// Asserts or clears Data Terminal Ready.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Asserts or clears Ready To Send.
    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Starts or stops sending a continuous BREAK condition.
    fn set_break(&mut self, enabled: bool) -> io::Result<()>;

    /// The underlying OS descriptor, if there is one, for handle-level
    /// locking.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// A second handle to the same open device, so reader and writer
    /// roles can block independently.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

/// Opens transports by device name.
pub trait TransportFactory: Send + Sync {
    /// Opens the named device at the given baud rate.
    ///
    /// A device held by someone else maps to [`Error::PortBusy`], any
    /// other failure to [`Error::OpenFailed`].
    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn Transport>>;
}

/// The [`serialport`]-backed factory used for real devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransport;

impl TransportFactory for SystemTransport {
    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn Transport>> {
        let port = serialport::new(name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open_native()
            .map_err(|e| open_error(name, &e))?;

        #[cfg(unix)]
        let fd = port.as_raw_fd();

        Ok(Box::new(SystemPort {
            port: Box::new(port),
            shadow: Arc::new(Mutex::new(OutputShadow::default())),
            #[cfg(unix)]
            fd: Some(fd),
        }))
    }
}

fn open_error(name: &str, error: &serialport::Error) -> Error {
    // The OS reports contention in several dialects; "busy" on unix,
    // "denied" on Windows.
    let text = error.to_string().to_lowercase();
    if text.contains("busy") || text.contains("denied") {
        Error::port_busy(name, error)
    } else {
        Error::open_failed(name, error)
    }
}

/// Output line state the OS cannot read back; tracked per device and
/// shared between clones of the same handle.
#[derive(Debug, Default, Clone, Copy)]
struct OutputShadow {
    dtr: bool,
    rts: bool,
    sending_break: bool,
}

struct SystemPort {
    port: Box<dyn serialport::SerialPort>,
    shadow: Arc<Mutex<OutputShadow>>,
    #[cfg(unix)]
    fd: Option<RawFd>,
}

impl SystemPort {
    fn shadow(&self) -> MutexGuard<'_, OutputShadow> {
        self.shadow.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for SystemPort {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(n as usize)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.port.flush() {
            Ok(()) => Ok(()),
            // Output still draining; the writer loop will flush again.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn signals(&mut self) -> io::Result<ControlSignals> {
        let shadow = *self.shadow();
        Ok(ControlSignals {
            dtr: shadow.dtr,
            rts: shadow.rts,
            sending_break: shadow.sending_break,
            dsr: self.port.read_data_set_ready().map_err(io::Error::from)?,
            cts: self.port.read_clear_to_send().map_err(io::Error::from)?,
            ri: self.port.read_ring_indicator().map_err(io::Error::from)?,
            cd: self.port.read_carrier_detect().map_err(io::Error::from)?,
        })
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(io::Error::from)?;
        self.shadow().dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_request_to_send(level)
            .map_err(io::Error::from)?;
        self.shadow().rts = level;
        Ok(())
    }

    fn set_break(&mut self, enabled: bool) -> io::Result<()> {
        if enabled {
            self.port.set_break().map_err(io::Error::from)?;
        } else {
            self.port.clear_break().map_err(io::Error::from)?;
        }
        self.shadow().sending_break = enabled;
        Ok(())
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SystemPort {
            port,
            shadow: Arc::clone(&self.shadow),
            #[cfg(unix)]
            fd: None,
        }))
    }
}
