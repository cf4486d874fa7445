use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{ConnectionOptions, SerialConnection};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::filter::PortFilter;
use crate::scan::{PortScanner, ScannedPort, SystemScanner};
use crate::transport::{SystemTransport, TransportFactory};

/// Optional parameters for [`PortTracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerOptions {
    /// How often the system is re-scanned while waiting for a device.
    pub scan_interval: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(500),
        }
    }
}

/// Maintains a connection to a serial device of interest, re-scanning
/// and re-connecting as needed after errors, with periodic retry.
///
/// Use this for robust communication with a device which might be
/// plugged and unplugged during operation: `connect_*` returns the
/// remembered connection while it stays healthy, and otherwise waits
/// for a matching device to appear and opens a fresh one.
pub struct PortTracker {
    filter: PortFilter,
    tracker_opts: TrackerOptions,
    conn_opts: ConnectionOptions,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<TrackState>,
}

struct TrackState {
    scanner: Box<dyn PortScanner>,
    matched: Vec<ScannedPort>,
    next_scan: Deadline,
    conn: Option<Arc<SerialConnection>>,
}

impl PortTracker {
    /// Prepares to manage a connection to the device matching `filter`.
    ///
    /// Scans and connections only happen once `find_*` or `connect_*`
    /// methods are called.
    ///
    /// Errors:
    /// - [`Error::FilterInvalid`]: bad format of the filter expression
    pub fn new(filter: &str, topts: TrackerOptions, copts: ConnectionOptions) -> Result<Self> {
        Ok(Self::with_backend(
            PortFilter::parse(filter)?,
            Box::new(SystemScanner),
            Arc::new(SystemTransport),
            topts,
            copts,
        ))
    }

    /// A tracker over an injected scanner and transport factory.
    pub fn with_backend(
        filter: PortFilter,
        scanner: Box<dyn PortScanner>,
        factory: Arc<dyn TransportFactory>,
        topts: TrackerOptions,
        copts: ConnectionOptions,
    ) -> Self {
        debug!(%filter, "tracking");
        Self {
            filter,
            tracker_opts: topts,
            conn_opts: copts,
            factory,
            state: Mutex::new(TrackState {
                scanner,
                matched: Vec::new(),
                next_scan: Deadline::after(Some(Duration::ZERO)),
                conn: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The filter used by this tracker.
    pub fn filter(&self) -> &PortFilter {
        &self.filter
    }

    /// Closes any active connection.
    ///
    /// I/O on the existing connection fails immediately with
    /// [`Error::Closed`]; a later `connect_*` call establishes a new
    /// connection.
    pub fn close(&self) {
        let state = self.state();
        if let Some(conn) = &state.conn {
            conn.close();
        }
    }

    /// Waits up to `timeout` (forever for `None`) until device(s)
    /// matching this tracker's filter appear, re-scanning no more often
    /// than the configured interval. Returns the matches, empty on
    /// timeout.
    ///
    /// Errors:
    /// - [`Error::ScanFailed`]: system error scanning devices
    pub fn find_sync(&self, timeout: Option<Duration>) -> Result<Vec<ScannedPort>> {
        let deadline = Deadline::after(timeout);
        loop {
            let next_scan;
            {
                let mut state = self.state();
                if state.next_scan.expired() {
                    let found = state.scanner.scan()?;
                    let matched: Vec<ScannedPort> = found
                        .iter()
                        .filter(|port| self.filter.matches(&port.attrs))
                        .cloned()
                        .collect();
                    debug!(
                        matched = matched.len(),
                        found = found.len(),
                        filter = %self.filter,
                        "scanned"
                    );
                    state.next_scan = Deadline::after(Some(self.tracker_opts.scan_interval));
                    state.matched = matched;
                }

                if !state.matched.is_empty() {
                    return Ok(state.matched.clone());
                }
                next_scan = state.next_scan;
            }

            let scan_wait = next_scan.remaining().unwrap_or_default();
            match deadline.remaining() {
                Some(left) if left < scan_wait => return Ok(Vec::new()),
                _ => {
                    debug!(wait = ?scan_wait, "next scan");
                    thread::sleep(scan_wait);
                }
            }
        }
    }

    /// Like [`PortTracker::find_sync`], but suspends the calling task
    /// between scans instead of blocking the thread.
    pub async fn find_async(&self, timeout: Option<Duration>) -> Result<Vec<ScannedPort>> {
        let deadline = Deadline::after(timeout);
        loop {
            let ports = self.find_sync(Some(Duration::ZERO))?;
            if !ports.is_empty() {
                return Ok(ports);
            }

            let scan_wait = self.state().next_scan.remaining().unwrap_or_default();
            match deadline.remaining() {
                Some(left) if left < scan_wait => return Ok(Vec::new()),
                _ => {
                    debug!(wait = ?scan_wait, "next scan");
                    tokio::time::sleep(scan_wait).await;
                }
            }
        }
    }

    /// If a connection is established and healthy, returns it
    /// immediately.
    ///
    /// Otherwise waits up to `timeout` (forever for `None`) for
    /// matching device(s) to appear, then attempts a new connection to
    /// each of them in turn; the first success is remembered and
    /// returned. Open failures are never fatal here, they only advance
    /// to the next candidate or scan cycle. Returns `None` on timeout.
    ///
    /// Errors:
    /// - [`Error::ScanFailed`]: system error scanning devices
    pub fn connect_sync(&self, timeout: Option<Duration>) -> Result<Option<Arc<SerialConnection>>> {
        let deadline = Deadline::after(timeout);
        let mut candidates: Vec<ScannedPort> = Vec::new();
        loop {
            {
                let mut state = self.state();

                if let Some(conn) = state.conn.clone() {
                    // A zero-byte write is a pure liveness probe.
                    match conn.write(&[]) {
                        Ok(()) => return Ok(Some(conn)),
                        Err(Error::Closed { .. }) => {
                            debug!(port = %conn.port_name(), "closed");
                            state.conn = None;
                        }
                        Err(e) => {
                            warn!(port = %conn.port_name(), %e, "failed");
                            conn.close();
                            state.conn = None;
                        }
                    }
                }

                for port in &candidates {
                    match SerialConnection::open_with(&*self.factory, &port.name, &self.conn_opts)
                    {
                        Ok(conn) => {
                            let conn = Arc::new(conn);
                            state.conn = Some(Arc::clone(&conn));
                            return Ok(Some(conn));
                        }
                        Err(e) => {
                            warn!(port = %port.name, %e, "can't open");
                            state.matched.clear(); // force a re-scan on error
                        }
                    }
                }
            }

            candidates = self.find_sync(deadline.remaining())?;
            if candidates.is_empty() {
                return Ok(None);
            }
        }
    }

    /// Like [`PortTracker::connect_sync`], but suspends the calling
    /// task between attempts instead of blocking the thread.
    pub async fn connect_async(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<SerialConnection>>> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(conn) = self.connect_sync(Some(Duration::ZERO))? {
                return Ok(Some(conn));
            }

            let scan_wait = self.state().next_scan.remaining().unwrap_or_default();
            match deadline.remaining() {
                Some(left) if left < scan_wait => return Ok(None),
                _ => {
                    debug!(wait = ?scan_wait, "next scan");
                    tokio::time::sleep(scan_wait).await;
                }
            }
        }
    }
}

impl Drop for PortTracker {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PortTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTracker")
            .field("filter", &self.filter)
            .field("tracker_opts", &self.tracker_opts)
            .field("conn_opts", &self.conn_opts)
            .finish_non_exhaustive()
    }
}
