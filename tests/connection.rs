use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::Result;
use pretty_assertions::assert_eq;

use serial_tether::connection::{ConnectionOptions, SerialConnection};
use serial_tether::error::Error;
use serial_tether::filter::PortFilter;
use serial_tether::mock::{MockBackend, MockPeer};

const AMPLE: Option<Duration> = Some(Duration::from_secs(10));
const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

fn connect(name: &str) -> Result<(SerialConnection, MockPeer, tempfile::TempDir)> {
    let lock_dir = tempfile::tempdir()?;
    let backend = MockBackend::new();
    backend.attach(name, &[]);

    let options = ConnectionOptions {
        lock_dir: lock_dir.path().to_path_buf(),
        ..Default::default()
    };
    let conn = SerialConnection::open_with(&backend, name, &options)?;
    let peer = backend.peer(name).expect("peer exists after open");

    Ok((conn, peer, lock_dir))
}

#[test]
fn byte_exact_echo() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock0")?;

    peer.inject(b"TO SERIAL");
    assert_eq!(conn.read_sync(AMPLE)?.as_ref(), b"TO SERIAL".as_slice());

    conn.write(b"FROM SERIAL")?;
    assert!(conn.drain_sync(AMPLE)?);
    assert_eq!(
        peer.wait_written(b"FROM SERIAL".len(), Duration::from_secs(10)),
        b"FROM SERIAL".to_vec()
    );

    Ok(())
}

#[test]
fn echo_across_chunked_peer_writes() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock1")?;

    let injector = peer.clone();
    let handle = thread::spawn(move || {
        for chunk in [b"one ".as_slice(), b"two ", b"three"] {
            thread::sleep(Duration::from_millis(20));
            injector.inject(chunk);
        }
    });

    let wanted = b"one two three".len();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    while received.len() < wanted && Instant::now() < deadline {
        received.extend_from_slice(&conn.read_sync(Some(Duration::from_secs(1)))?);
    }
    handle.join().unwrap();

    assert_eq!(received, b"one two three".to_vec());
    Ok(())
}

#[test]
fn read_sync_times_out_on_empty_buffer() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock2")?;

    let start = Instant::now();
    let data = conn.read_sync(Some(Duration::from_millis(100)))?;
    let elapsed = start.elapsed();

    assert!(data.is_empty());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed <= Duration::from_millis(500));
    Ok(())
}

#[test]
fn read_sync_zero_timeout_checks_once() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock3")?;

    let start = Instant::now();
    let data = conn.read_sync(NO_WAIT)?;

    assert!(data.is_empty());
    assert!(start.elapsed() < Duration::from_millis(100));
    Ok(())
}

#[test]
fn write_never_blocks() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock4")?;

    let payload = vec![b'X'; 1024 * 1024];
    let start = Instant::now();
    conn.write(&payload)?;
    assert!(start.elapsed() < Duration::from_millis(100));

    assert!(conn.drain_sync(AMPLE)?);
    assert_eq!(conn.outgoing_size(), 0);
    assert_eq!(
        peer.wait_written(payload.len(), Duration::from_secs(10)),
        payload
    );
    Ok(())
}

#[test]
fn drain_sync_zero_timeout_returns_immediately() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock5")?;

    conn.write(b"TEST DATA")?;
    let start = Instant::now();
    let _completed = conn.drain_sync(NO_WAIT)?;
    assert!(start.elapsed() < Duration::from_millis(100));
    Ok(())
}

#[test]
fn drain_below_completes_at_threshold() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock6")?;

    conn.write(b"1234567890")?;
    assert!(conn.drain_below_sync(AMPLE, 10)?);
    assert!(conn.drain_sync(AMPLE)?);
    assert_eq!(conn.outgoing_size(), 0);
    Ok(())
}

#[test]
fn incoming_size_tracks_buffered_bytes() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock7")?;

    assert_eq!(conn.incoming_size(), 0);
    peer.inject(b"HELLO");

    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.incoming_size() < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(conn.incoming_size(), 5);

    conn.read_sync(AMPLE)?;
    assert_eq!(conn.incoming_size(), 0);
    Ok(())
}

#[test]
fn zero_byte_write_is_a_probe() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock8")?;

    conn.write(&[])?;
    assert_eq!(conn.outgoing_size(), 0);
    assert!(conn.drain_sync(NO_WAIT)?);

    conn.close();
    assert!(matches!(conn.write(&[]), Err(Error::Closed { .. })));
    Ok(())
}

#[test]
fn operations_after_close_fail_with_closed() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock9")?;
    conn.close();

    assert!(matches!(conn.read_sync(AMPLE), Err(Error::Closed { .. })));
    assert!(matches!(conn.write(b"test"), Err(Error::Closed { .. })));
    assert!(matches!(conn.drain_sync(AMPLE), Err(Error::Closed { .. })));
    assert!(matches!(conn.get_signals(), Err(Error::Closed { .. })));
    assert!(matches!(
        conn.set_signals(Some(true), None, None),
        Err(Error::Closed { .. })
    ));
    Ok(())
}

#[test]
fn multiple_close_is_safe() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/mock10")?;
    conn.close();
    conn.close();
    conn.close();
    Ok(())
}

#[test]
fn read_failure_becomes_a_sticky_fault() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock11")?;

    peer.fail_reads();

    let error = conn
        .read_sync(Some(Duration::from_secs(5)))
        .expect_err("fault surfaces instead of timing out");
    assert!(matches!(error, Error::IoFailed { .. }));

    // Every further operation fails identically.
    assert!(matches!(conn.write(b"data"), Err(Error::IoFailed { .. })));
    assert!(matches!(conn.write(&[]), Err(Error::IoFailed { .. })));
    assert!(matches!(conn.drain_sync(NO_WAIT), Err(Error::IoFailed { .. })));
    Ok(())
}

#[test]
fn close_wins_over_an_earlier_fault_for_new_callers() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock12")?;

    peer.fail_reads();
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.write(&[]).is_ok() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(conn.write(&[]), Err(Error::IoFailed { .. })));

    conn.close();
    assert!(matches!(conn.read_sync(NO_WAIT), Err(Error::Closed { .. })));
    assert!(matches!(conn.write(&[]), Err(Error::Closed { .. })));
    Ok(())
}

#[test]
fn concurrent_reads_and_writes() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock13")?;
    let conn = Arc::new(conn);

    peer.inject(b"WORLD");

    let reader = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.read_sync(Some(Duration::from_secs(5))))
    };
    let writer = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            conn.write(b"HELLO")?;
            conn.drain_sync(Some(Duration::from_secs(5)))
        })
    };

    let read = reader.join().unwrap()?;
    let wrote = writer.join().unwrap()?;

    assert_eq!(read.as_ref(), b"WORLD".as_slice());
    assert!(wrote);
    assert_eq!(
        peer.wait_written(b"HELLO".len(), Duration::from_secs(5)),
        b"HELLO".to_vec()
    );
    Ok(())
}

#[test]
fn concurrent_writers_never_interleave_within_a_call() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock14")?;
    let conn = Arc::new(conn);

    let mut handles = Vec::new();
    for byte in [b'A', b'B', b'C', b'D'] {
        let conn = Arc::clone(&conn);
        handles.push(thread::spawn(move || conn.write(&[byte; 100])));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    assert!(conn.drain_sync(AMPLE)?);
    let written = peer.wait_written(400, Duration::from_secs(10));
    assert_eq!(written.len(), 400);

    // Each call's bytes appear as one contiguous run.
    for run in written.chunks(100) {
        assert!(run.iter().all(|b| *b == run[0]));
    }
    Ok(())
}

#[test]
fn control_signals_round_trip() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/mock15")?;

    conn.set_signals(Some(true), Some(false), Some(true))?;
    let outgoing = peer.outgoing_signals();
    assert!(outgoing.dtr);
    assert!(!outgoing.rts);
    assert!(outgoing.sending_break);

    peer.set_incoming(true, true, false, false);
    let signals = conn.get_signals()?;
    assert!(signals.dsr);
    assert!(signals.cts);
    assert!(!signals.ri);
    assert!(!signals.cd);
    assert!(signals.dtr);
    assert!(signals.sending_break);
    Ok(())
}

#[test]
fn marker_lock_lives_with_the_connection() -> Result<()> {
    let lock_dir = tempfile::tempdir()?;
    let backend = MockBackend::new();
    backend.attach("/dev/mock16", &[]);

    let options = ConnectionOptions {
        lock_dir: lock_dir.path().to_path_buf(),
        ..Default::default()
    };
    let conn = SerialConnection::open_with(&backend, "/dev/mock16", &options)?;

    let marker = lock_dir.path().join("LCK..mock16");
    let text = std::fs::read_to_string(&marker)?;
    assert_eq!(text.trim().parse::<u32>()?, std::process::id());

    conn.close();
    assert!(!marker.exists());
    Ok(())
}

#[test]
fn open_errors_map_to_the_taxonomy() -> Result<()> {
    let lock_dir = tempfile::tempdir()?;
    let backend = MockBackend::new();
    let options = ConnectionOptions {
        lock_dir: lock_dir.path().to_path_buf(),
        ..Default::default()
    };

    let missing = SerialConnection::open_with(&backend, "/dev/mock17", &options).unwrap_err();
    assert!(matches!(missing, Error::OpenFailed { .. }));
    assert!(missing.is_open_error());

    backend.attach("/dev/mock17", &[]);
    backend.set_busy("/dev/mock17", true);
    let busy = SerialConnection::open_with(&backend, "/dev/mock17", &options).unwrap_err();
    assert!(matches!(busy, Error::PortBusy { .. }));
    assert!(busy.is_open_error());
    Ok(())
}

#[test]
fn open_matching_requires_exactly_one_match() -> Result<()> {
    let lock_dir = tempfile::tempdir()?;
    let backend = MockBackend::new();
    let options = ConnectionOptions {
        lock_dir: lock_dir.path().to_path_buf(),
        ..Default::default()
    };
    let filter = PortFilter::parse("product:widget")?;

    backend.attach("/dev/mock18", &[("product", "other")]);
    let none = SerialConnection::open_matching_with(
        &mut backend.clone(),
        &backend,
        &filter,
        &options,
    )
    .unwrap_err();
    assert!(matches!(none, Error::OpenFailed { .. }));

    backend.attach("/dev/mock19", &[("product", "widget")]);
    let conn = SerialConnection::open_matching_with(
        &mut backend.clone(),
        &backend,
        &filter,
        &options,
    )?;
    assert_eq!(conn.port_name(), "/dev/mock19");
    conn.close();

    backend.attach("/dev/mock20", &[("product", "widget")]);
    let several = SerialConnection::open_matching_with(
        &mut backend.clone(),
        &backend,
        &filter,
        &options,
    )
    .unwrap_err();
    assert!(matches!(several, Error::OpenFailed { .. }));
    Ok(())
}

#[tokio::test]
async fn async_read_basic() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/amock0")?;

    peer.inject(b"ASYNC TEST");
    let data = conn.read_async().await?;
    assert_eq!(data.as_ref(), b"ASYNC TEST".as_slice());
    Ok(())
}

#[tokio::test]
async fn async_read_wakes_on_late_data() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/amock1")?;

    let injector = peer.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        injector.inject(b"LATE");
    });

    let data = tokio::time::timeout(Duration::from_secs(5), conn.read_async()).await??;
    handle.join().unwrap();

    assert_eq!(data.as_ref(), b"LATE".as_slice());
    Ok(())
}

#[tokio::test]
async fn async_drain_completes() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/amock2")?;

    conn.write(b"DRAIN TEST")?;
    assert!(conn.drain_async().await?);
    assert_eq!(
        peer.wait_written(b"DRAIN TEST".len(), Duration::from_secs(5)),
        b"DRAIN TEST".to_vec()
    );
    Ok(())
}

#[tokio::test]
async fn async_read_and_drain_concurrently() -> Result<()> {
    let (conn, peer, _lock_dir) = connect("/dev/amock3")?;

    peer.inject(b"HELLO");
    conn.write(b"WRITE")?;

    let (read, drained) = tokio::join!(conn.read_async(), conn.drain_async());

    assert_eq!(read?.as_ref(), b"HELLO".as_slice());
    assert!(drained?);
    Ok(())
}

#[tokio::test]
async fn async_operations_after_close_fail_with_closed() -> Result<()> {
    let (conn, _peer, _lock_dir) = connect("/dev/amock4")?;
    conn.close();

    assert!(matches!(conn.read_async().await, Err(Error::Closed { .. })));
    assert!(matches!(conn.drain_async().await, Err(Error::Closed { .. })));
    Ok(())
}
