use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::filter::PortFilter;
use crate::lock::{self, MarkerLock, SharingMode};
use crate::scan::{PortScanner, SystemScanner};
use crate::transport::{ControlSignals, SystemTransport, TransportFactory};

pub(crate) mod engine;

use self::engine::Shared;

/// Optional parameters for [`SerialConnection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// The [baud rate](https://en.wikipedia.org/wiki/Baud) to use.
    pub baud: u32,

    /// Port access negotiation strategy.
    pub sharing: SharingMode,

    /// Where lock files live. Injectable so tests can redirect locking
    /// into a sandbox.
    pub lock_dir: PathBuf,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            baud: 115_200,
            sharing: SharingMode::default(),
            lock_dir: PathBuf::from(lock::DEFAULT_LOCK_DIR),
        }
    }
}

/// Resources released at close time, in reverse acquisition order.
struct Teardown {
    threads: Vec<JoinHandle<()>>,
    #[cfg(unix)]
    handle_lock: Option<lock::HandleLock>,
    marker: MarkerLock,
}

/// An open connection to a serial device.
///
/// Opening acquires the device locks, opens the transport, and starts
/// the I/O engine. All methods are callable from any thread. Call
/// [`SerialConnection::close`] to release the device; dropping the
/// connection closes it too.
pub struct SerialConnection {
    name: String,
    shared: Arc<Shared>,
    teardown: Mutex<Option<Teardown>>,
}

impl SerialConnection {
    /// Opens the named system device, eg. `/dev/ttyACM0` or `COM3`.
    ///
    /// Errors:
    /// - [`Error::PortBusy`]: another owner holds the device
    /// - [`Error::OpenFailed`]: any other open problem
    pub fn open(name: &str, options: &ConnectionOptions) -> Result<Self> {
        Self::open_with(&SystemTransport, name, options)
    }

    /// Scans the system and opens the single device matching `filter`.
    ///
    /// Zero matches, or more than one, is an error: the filter must
    /// identify the device unambiguously.
    ///
    /// Errors:
    /// - [`Error::OpenFailed`]: no match, several matches, or the open
    ///   itself failed
    /// - [`Error::PortBusy`]: another owner holds the device
    /// - [`Error::ScanFailed`]: system error scanning devices
    pub fn open_matching(filter: &PortFilter, options: &ConnectionOptions) -> Result<Self> {
        Self::open_matching_with(&mut SystemScanner, &SystemTransport, filter, options)
    }

    /// [`SerialConnection::open_matching`] against an injected scanner
    /// and transport factory.
    pub fn open_matching_with(
        scanner: &mut dyn PortScanner,
        factory: &dyn TransportFactory,
        filter: &PortFilter,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        let found = scanner.scan()?;
        if found.is_empty() {
            return Err(Error::open_failed(
                &filter.to_string(),
                "no serial ports found",
            ));
        }

        let matched: Vec<_> = found
            .into_iter()
            .filter(|port| filter.matches(&port.attrs))
            .collect();
        match matched.as_slice() {
            [] => Err(Error::open_failed(&filter.to_string(), "no ports match")),
            [port] => {
                debug!(%filter, port = %port.name, "scanned");
                Self::open_with(factory, &port.name, options)
            }
            several => {
                let listing = several.iter().map(|port| port.name.as_str()).join(", ");
                Err(Error::open_failed(
                    &filter.to_string(),
                    format!("multiple ports match: {listing}"),
                ))
            }
        }
    }

    /// Opens `name` through an injected transport factory.
    pub fn open_with(
        factory: &dyn TransportFactory,
        name: &str,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        let marker = lock::acquire_marker(&options.lock_dir, name, options.sharing)?;

        let transport = factory.open(name, options.baud)?;
        debug!(%name, baud = options.baud, sharing = ?options.sharing, "opened");

        #[cfg(unix)]
        let handle_lock = match transport.raw_fd() {
            Some(fd) => Some(lock::lock_handle(name, fd, options.sharing)?),
            None => None,
        };

        let (shared, threads) = engine::start(name, transport)?;

        Ok(Self {
            name: name.to_string(),
            shared,
            teardown: Mutex::new(Some(Teardown {
                threads,
                #[cfg(unix)]
                handle_lock,
                marker,
            })),
        })
    }

    /// The device name, eg. `/dev/ttyACM0` or `COM3`.
    pub fn port_name(&self) -> &str {
        &self.name
    }

    /// Waits up to `timeout` (forever for `None`) for data, then
    /// returns all of it (empty on timeout).
    ///
    /// Errors:
    /// - [`Error::IoFailed`]: device I/O failed and there is no data
    /// - [`Error::Closed`]: the connection was closed and there is no
    ///   data
    pub fn read_sync(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.shared.read_sync(timeout)
    }

    /// Like [`SerialConnection::read_sync`], but suspends the calling
    /// task instead of blocking the thread, and waits indefinitely.
    pub async fn read_async(&self) -> Result<Bytes> {
        self.shared.read_async().await
    }

    /// Adds data to the outgoing buffer to be sent immediately.
    ///
    /// Never blocks; the buffer can grow indefinitely. Use
    /// [`SerialConnection::outgoing_size`] and the drain operations to
    /// manage buffer growth. A zero-length write performs no I/O but
    /// still surfaces any recorded fault, making it usable as a
    /// liveness probe.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.shared.write(data)
    }

    /// Waits up to `timeout` (forever for `None`) until all buffered
    /// data is transmitted. Returns whether the drain completed before
    /// the timeout.
    pub fn drain_sync(&self, timeout: Option<Duration>) -> Result<bool> {
        self.shared.drain_below_sync(timeout, 0)
    }

    /// Like [`SerialConnection::drain_sync`], but completes once at
    /// most `threshold` bytes remain buffered.
    pub fn drain_below_sync(&self, timeout: Option<Duration>, threshold: usize) -> Result<bool> {
        self.shared.drain_below_sync(timeout, threshold)
    }

    /// Like [`SerialConnection::drain_sync`], but suspends the calling
    /// task instead of blocking the thread, and waits indefinitely.
    pub async fn drain_async(&self) -> Result<bool> {
        self.shared.drain_async().await
    }

    /// The number of bytes waiting to be read.
    pub fn incoming_size(&self) -> usize {
        self.shared.incoming_size()
    }

    /// The number of bytes waiting to be sent.
    pub fn outgoing_size(&self) -> usize {
        self.shared.outgoing_size()
    }

    /// The current control line state.
    pub fn get_signals(&self) -> Result<ControlSignals> {
        self.shared.get_signals()
    }

    /// Sets outgoing control line state (`None` for no change):
    /// - `dtr`: assert Data Terminal Ready
    /// - `rts`: assert Ready To Send
    /// - `send_break`: send a continuous BREAK condition
    pub fn set_signals(
        &self,
        dtr: Option<bool>,
        rts: Option<bool>,
        send_break: Option<bool>,
    ) -> Result<()> {
        self.shared.set_signals(dtr, rts, send_break)
    }

    /// Releases the device and any associated locks.
    ///
    /// Any I/O operation in progress or attempted after closure fails
    /// with [`Error::Closed`]. Idempotent; also runs on drop.
    pub fn close(&self) {
        let taken = self
            .teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(teardown) = taken else {
            return;
        };

        let control = self.shared.begin_close();

        if let Some(control) = &control {
            match control.cancel_pending() {
                Ok(()) => debug!(port = %self.name, "cancelled in-flight I/O"),
                Err(e) => warn!(port = %self.name, %e, "can't cancel in-flight I/O"),
            }
        }

        debug!(port = %self.name, "joining I/O threads");
        for thread in teardown.threads {
            let _ = thread.join();
        }

        // Reverse acquisition order: the handle lock comes off while the
        // descriptor is still open, then the transport closes, then the
        // lock file goes away.
        #[cfg(unix)]
        drop(teardown.handle_lock);
        drop(control);
        drop(teardown.marker);
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
