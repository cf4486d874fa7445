//! The per-connection I/O engine: two worker threads moving bytes
//! between the transport and a pair of buffers, serialized through one
//! monitor.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, debug_span, trace, warn};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::transport::{ControlSignals, Transport};

/// Upper bound on a single wire write. Some devices block unboundedly
/// or corrupt data on large writes; the writer loop feeds them at most
/// this much at a time.
const WRITE_CHUNK: usize = 256;

/// State shared between the worker threads and every caller.
///
/// All mutation goes through the one mutex; the condvar wakes blocking
/// callers and the writer loop, the [`Notify`] wakes suspended async
/// tasks. The lock is never held across a blocking transport call.
pub(crate) struct Shared {
    name: String,
    pipe: Mutex<Pipe>,
    monitor: Condvar,
    wakeups: Notify,
}

struct Pipe {
    incoming: BytesMut,
    outgoing: BytesMut,

    /// Terminal error; once set, every operation fails with it.
    fault: Option<Error>,

    /// Handle used for control signal access and close-time
    /// cancellation; taken out when the connection closes.
    control: Option<Box<dyn Transport>>,
}

/// Clones the transport for the reader and writer roles and starts both
/// worker threads.
pub(crate) fn start(
    name: &str,
    transport: Box<dyn Transport>,
) -> Result<(Arc<Shared>, Vec<JoinHandle<()>>)> {
    let reader_port = transport
        .try_clone()
        .map_err(|e| Error::open_failed(name, format!("can't clone handle: {e}")))?;
    let writer_port = transport
        .try_clone()
        .map_err(|e| Error::open_failed(name, format!("can't clone handle: {e}")))?;

    let shared = Arc::new(Shared {
        name: name.to_string(),
        pipe: Mutex::new(Pipe {
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            fault: None,
            control: Some(transport),
        }),
        monitor: Condvar::new(),
        wakeups: Notify::new(),
    });

    let mut threads = Vec::with_capacity(2);
    let reader_shared = Arc::clone(&shared);
    threads.push(
        thread::Builder::new()
            .name(format!("{name} reader"))
            .spawn(move || read_loop(&reader_shared, reader_port))
            .map_err(|e| Error::open_failed(name, format!("can't spawn reader: {e}")))?,
    );
    let writer_shared = Arc::clone(&shared);
    threads.push(
        thread::Builder::new()
            .name(format!("{name} writer"))
            .spawn(move || write_loop(&writer_shared, writer_port))
            .map_err(|e| Error::open_failed(name, format!("can't spawn writer: {e}")))?,
    );

    Ok((shared, threads))
}

impl Shared {
    fn pipe(&self) -> MutexGuard<'_, Pipe> {
        self.pipe.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Pipe>) -> MutexGuard<'a, Pipe> {
        self.monitor
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner())
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Pipe>,
        timeout: Duration,
    ) -> MutexGuard<'a, Pipe> {
        self.monitor
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner())
            .0
    }

    /// Wakes every blocked caller, the writer loop, and every suspended
    /// async task. Call after mutating the pipe.
    fn wake_all(&self) {
        self.monitor.notify_all();
        self.wakeups.notify_waiters();
    }

    fn is_faulted(&self) -> bool {
        self.pipe().fault.is_some()
    }

    pub(crate) fn read_sync(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let deadline = Deadline::after(timeout);
        let mut pipe = self.pipe();
        loop {
            if !pipe.incoming.is_empty() {
                return Ok(pipe.incoming.split().freeze());
            }
            if let Some(fault) = &pipe.fault {
                return Err(fault.clone());
            }
            match deadline.remaining() {
                Some(wait) if wait.is_zero() => return Ok(Bytes::new()),
                Some(wait) => pipe = self.wait_timeout(pipe, wait),
                None => pipe = self.wait(pipe),
            }
        }
    }

    pub(crate) async fn read_async(&self) -> Result<Bytes> {
        loop {
            let wakeup = self.wakeups.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable(); // register before checking

            let out = self.read_sync(Some(Duration::ZERO))?;
            if !out.is_empty() {
                return Ok(out);
            }
            wakeup.await;
        }
    }

    pub(crate) fn write(&self, data: &[u8]) -> Result<()> {
        let mut pipe = self.pipe();
        if let Some(fault) = &pipe.fault {
            return Err(fault.clone());
        }
        if !data.is_empty() {
            pipe.outgoing.extend_from_slice(data);
            drop(pipe);
            self.wake_all();
        }
        Ok(())
    }

    pub(crate) fn drain_below_sync(
        &self,
        timeout: Option<Duration>,
        threshold: usize,
    ) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        let mut pipe = self.pipe();
        loop {
            if let Some(fault) = &pipe.fault {
                return Err(fault.clone());
            }
            if pipe.outgoing.len() <= threshold {
                return Ok(true);
            }
            match deadline.remaining() {
                Some(wait) if wait.is_zero() => return Ok(false),
                Some(wait) => pipe = self.wait_timeout(pipe, wait),
                None => pipe = self.wait(pipe),
            }
        }
    }

    pub(crate) async fn drain_async(&self) -> Result<bool> {
        loop {
            let wakeup = self.wakeups.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable(); // register before checking

            if self.drain_below_sync(Some(Duration::ZERO), 0)? {
                return Ok(true);
            }
            wakeup.await;
        }
    }

    pub(crate) fn incoming_size(&self) -> usize {
        self.pipe().incoming.len()
    }

    pub(crate) fn outgoing_size(&self) -> usize {
        self.pipe().outgoing.len()
    }

    pub(crate) fn get_signals(&self) -> Result<ControlSignals> {
        let mut pipe = self.pipe();
        if let Some(fault) = &pipe.fault {
            return Err(fault.clone());
        }
        let Some(control) = pipe.control.as_mut() else {
            return Err(Error::Closed {
                port: self.name.clone(),
            });
        };
        match control.signals() {
            Ok(signals) => Ok(signals),
            Err(e) => {
                let fault = Error::io_failed(&self.name, format!("can't get control signals: {e}"));
                pipe.fault = Some(fault.clone());
                drop(pipe);
                self.wake_all();
                Err(fault)
            }
        }
    }

    pub(crate) fn set_signals(
        &self,
        dtr: Option<bool>,
        rts: Option<bool>,
        send_break: Option<bool>,
    ) -> Result<()> {
        let mut pipe = self.pipe();
        if let Some(fault) = &pipe.fault {
            return Err(fault.clone());
        }
        let Some(control) = pipe.control.as_mut() else {
            return Err(Error::Closed {
                port: self.name.clone(),
            });
        };

        let mut apply = || -> std::io::Result<()> {
            if let Some(level) = dtr {
                control.set_dtr(level)?;
            }
            if let Some(level) = rts {
                control.set_rts(level)?;
            }
            if let Some(enabled) = send_break {
                control.set_break(enabled)?;
            }
            Ok(())
        };

        match apply() {
            Ok(()) => Ok(()),
            Err(e) => {
                let fault = Error::io_failed(&self.name, format!("can't set control signals: {e}"));
                pipe.fault = Some(fault.clone());
                drop(pipe);
                self.wake_all();
                Err(fault)
            }
        }
    }

    /// Installs the terminal [`Error::Closed`] fault and hands back the
    /// control handle for cancellation and closing.
    ///
    /// A `Closed` fault replaces any I/O fault that raced it, so new
    /// callers always learn the connection was deliberately shut down;
    /// callers already unblocked keep the error they took.
    pub(crate) fn begin_close(&self) -> Option<Box<dyn Transport>> {
        let mut pipe = self.pipe();
        if !matches!(pipe.fault, Some(Error::Closed { .. })) {
            let prior = pipe.fault.replace(Error::Closed {
                port: self.name.clone(),
            });
            if let Some(prior) = prior {
                debug!(port = %self.name, %prior, "closing over an earlier fault");
            }
        }
        let control = pipe.control.take();
        drop(pipe);
        self.wake_all();
        control
    }
}

fn read_loop(shared: &Shared, mut port: Box<dyn Transport>) {
    let _span = debug_span!("reader", port = %shared.name).entered();
    debug!("starting thread");

    while !shared.is_faulted() {
        let mut first = [0u8; 1];
        let mut chunk = Vec::new();
        let mut error = None;

        match port.read_some(&mut first) {
            Ok(0) => {} // poll timeout; re-check the fault and retry
            Ok(_) => {
                chunk.push(first[0]);
                // Block for a single byte, then grab whatever else
                // already arrived in the same pass.
                match port.bytes_available() {
                    Ok(more) if more > 0 => {
                        chunk.resize(1 + more, 0);
                        match port.read_some(&mut chunk[1..]) {
                            Ok(n) => chunk.truncate(1 + n),
                            Err(e) => {
                                chunk.truncate(1);
                                error = Some(Error::io_failed(&shared.name, format!("read: {e}")));
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error = Some(Error::io_failed(&shared.name, format!("read: {e}")));
                    }
                }
            }
            Err(e) => error = Some(Error::io_failed(&shared.name, format!("read: {e}"))),
        }

        if chunk.is_empty() && error.is_none() {
            continue;
        }

        let mut pipe = shared.pipe();
        if !chunk.is_empty() {
            trace!(read = chunk.len(), buffered = pipe.incoming.len(), "read");
            pipe.incoming.extend_from_slice(&chunk);
        }
        if let Some(error) = error {
            warn!(%error, "read failed");
            pipe.fault.get_or_insert(error);
        }
        drop(pipe);
        shared.wake_all();
    }
}

fn write_loop(shared: &Shared, mut port: Box<dyn Transport>) {
    let _span = debug_span!("writer", port = %shared.name).entered();
    debug!("starting thread");

    loop {
        let chunk = {
            let mut pipe = shared.pipe();
            while pipe.fault.is_none() && pipe.outgoing.is_empty() {
                pipe = shared.wait(pipe);
            }
            if pipe.fault.is_some() {
                return;
            }
            let len = pipe.outgoing.len().min(WRITE_CHUNK);
            pipe.outgoing[..len].to_vec()
        };

        let mut written = 0;
        let mut error = None;
        while written < chunk.len() && !shared.is_faulted() {
            match port.write_some(&chunk[written..]) {
                Ok(0) => continue, // poll timeout; re-check and retry
                Ok(n) => written += n,
                Err(e) => {
                    error = Some(Error::io_failed(&shared.name, format!("write: {e}")));
                    break;
                }
            }
        }
        if error.is_none() && written > 0 {
            if let Err(e) = port.flush() {
                error = Some(Error::io_failed(&shared.name, format!("flush: {e}")));
            }
        }

        let mut pipe = shared.pipe();
        if written > 0 {
            trace!(wrote = written, outgoing = pipe.outgoing.len(), "wrote");
            // Only this loop drains `outgoing`, so the written prefix is
            // still in place.
            debug_assert!(pipe.outgoing[..written] == chunk[..written]);
            pipe.outgoing.advance(written);
        }
        let mut exit = false;
        if let Some(error) = error {
            warn!(%error, "write failed");
            pipe.fault.get_or_insert(error);
            exit = true;
        }
        drop(pipe);
        shared.wake_all();
        if exit {
            return;
        }
    }
}
