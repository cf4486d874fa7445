//! Mocked serial transports and scanners, useful to test serial
//! functionality without the actual serial ports.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::scan::{PortScanner, ScannedPort};
use crate::transport::{ControlSignals, Transport, TransportFactory};

/// How long a mock read may sleep before returning empty, mirroring the
/// poll granularity of a real device handle.
const MOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct WireState {
    /// Bytes the device has produced, not yet read by the transport.
    readable: BytesMut,

    /// Bytes written through the transport, as seen by the peer.
    written: BytesMut,

    fail_reads: bool,
    fail_writes: bool,
    cancelled: bool,

    signals: ControlSignals,
}

#[derive(Debug, Default)]
struct Wire {
    state: Mutex<WireState>,
    activity: Condvar,
}

impl Wire {
    fn state(&self) -> MutexGuard<'_, WireState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The device side of a [`MockTransport`].
///
/// Tests drive this end: inject bytes for the connection to read,
/// observe bytes the connection wrote, and simulate device failure.
#[derive(Debug, Clone)]
pub struct MockPeer {
    wire: Arc<Wire>,
}

impl MockPeer {
    /// Makes `bytes` available for the transport to read.
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.wire.state();
        state.readable.extend_from_slice(bytes);
        drop(state);
        self.wire.activity.notify_all();
    }

    /// Takes everything written through the transport so far.
    pub fn take_written(&self) -> Vec<u8> {
        self.wire.state().written.split().to_vec()
    }

    /// Waits until at least `len` bytes have been written through the
    /// transport (or `timeout` passes), then takes them all.
    pub fn wait_written(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Deadline::after(Some(timeout));
        let mut state = self.wire.state();
        loop {
            if state.written.len() >= len {
                return state.written.split().to_vec();
            }
            match deadline.remaining() {
                Some(wait) if wait.is_zero() => return state.written.split().to_vec(),
                Some(wait) => {
                    let (guard, _) = self
                        .wire
                        .activity
                        .wait_timeout(state, wait)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
                None => unreachable!("deadline is bounded"),
            }
        }
    }

    /// Makes every subsequent read on the transport fail, as if the
    /// device fell off the bus.
    pub fn fail_reads(&self) {
        self.wire.state().fail_reads = true;
        self.wire.activity.notify_all();
    }

    /// Makes every subsequent write on the transport fail.
    pub fn fail_writes(&self) {
        self.wire.state().fail_writes = true;
        self.wire.activity.notify_all();
    }

    /// Sets the incoming ("DCE to DTE") control lines.
    pub fn set_incoming(&self, dsr: bool, cts: bool, ri: bool, cd: bool) {
        let mut state = self.wire.state();
        state.signals.dsr = dsr;
        state.signals.cts = cts;
        state.signals.ri = ri;
        state.signals.cd = cd;
    }

    /// The outgoing control line state the connection has asserted.
    pub fn outgoing_signals(&self) -> ControlSignals {
        self.wire.state().signals
    }
}

/// An in-memory [`Transport`] with a test-controlled peer on the other
/// end of the wire.
#[derive(Debug)]
pub struct MockTransport {
    wire: Arc<Wire>,
}

impl MockTransport {
    /// A connected transport/peer pair.
    pub fn pair() -> (MockTransport, MockPeer) {
        let wire = Arc::new(Wire::default());
        (
            MockTransport {
                wire: Arc::clone(&wire),
            },
            MockPeer { wire },
        )
    }
}

impl Transport for MockTransport {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.wire.state();

        if state.readable.is_empty() && !state.fail_reads && !state.cancelled {
            let (guard, _) = self
                .wire
                .activity
                .wait_timeout(state, MOCK_POLL)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        if state.fail_reads {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "injected read failure",
            ));
        }
        if state.readable.is_empty() {
            return Ok(0);
        }

        let n = state.readable.len().min(buf.len());
        buf[..n].copy_from_slice(&state.readable[..n]);
        state.readable.advance(n);
        Ok(n)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.wire.state().readable.len())
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.wire.state();
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "injected write failure",
            ));
        }
        state.written.extend_from_slice(buf);
        drop(state);
        self.wire.activity.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.wire.state().fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "injected write failure",
            ));
        }
        Ok(())
    }

    fn cancel_pending(&self) -> io::Result<()> {
        self.wire.state().cancelled = true;
        self.wire.activity.notify_all();
        Ok(())
    }

    fn signals(&mut self) -> io::Result<ControlSignals> {
        Ok(self.wire.state().signals)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.wire.state().signals.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.wire.state().signals.rts = level;
        Ok(())
    }

    fn set_break(&mut self, enabled: bool) -> io::Result<()> {
        self.wire.state().signals.sending_break = enabled;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(MockTransport {
            wire: Arc::clone(&self.wire),
        }))
    }
}

#[derive(Debug, Default)]
struct BackendState {
    attached: BTreeMap<String, BTreeMap<String, String>>,
    busy: BTreeSet<String>,
    peers: HashMap<String, MockPeer>,
    scans: usize,
    fail_scans: bool,
}

/// A scriptable scanner + transport factory in one: tests attach and
/// detach simulated devices while a tracker or connection runs against
/// it.
#[derive(Debug, Default, Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    /// An empty backend with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, BackendState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes a device visible to scans and openable.
    pub fn attach(&self, name: &str, attrs: &[(&str, &str)]) {
        debug!(%name, "attaching mock device");
        self.inner().attached.insert(
            name.to_string(),
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    /// Removes a device from scans and makes opens fail.
    pub fn detach(&self, name: &str) {
        debug!(%name, "detaching mock device");
        self.inner().attached.remove(name);
    }

    /// Marks a device as held by someone else; opens fail with
    /// [`Error::PortBusy`] until cleared.
    pub fn set_busy(&self, name: &str, busy: bool) {
        let mut inner = self.inner();
        if busy {
            inner.busy.insert(name.to_string());
        } else {
            inner.busy.remove(name);
        }
    }

    /// The peer end of the most recent open of `name`.
    pub fn peer(&self, name: &str) -> Option<MockPeer> {
        self.inner().peers.get(name).cloned()
    }

    /// How many scans have been performed.
    pub fn scan_count(&self) -> usize {
        self.inner().scans
    }

    /// Makes subsequent scans fail with [`Error::ScanFailed`].
    pub fn fail_scans(&self, fail: bool) {
        self.inner().fail_scans = fail;
    }
}

impl PortScanner for MockBackend {
    fn scan(&mut self) -> Result<Vec<ScannedPort>> {
        let mut inner = self.inner();
        inner.scans += 1;
        if inner.fail_scans {
            return Err(Error::ScanFailed("injected scan failure".into()));
        }
        Ok(inner
            .attached
            .iter()
            .map(|(name, attrs)| ScannedPort {
                name: name.clone(),
                attrs: attrs.clone(),
            })
            .collect())
    }
}

impl TransportFactory for MockBackend {
    fn open(&self, name: &str, _baud: u32) -> Result<Box<dyn Transport>> {
        let mut inner = self.inner();
        if inner.busy.contains(name) {
            return Err(Error::port_busy(name, "mock device is busy"));
        }
        if !inner.attached.contains_key(name) {
            return Err(Error::open_failed(name, "no such mock device"));
        }

        let (transport, peer) = MockTransport::pair();
        inner.peers.insert(name.to_string(), peer);
        Ok(Box::new(transport))
    }
}
