use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Port access negotiation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Don't perform any locking.
    Oblivious,

    /// Defer to other users; probe for contention but hold only a
    /// shared claim.
    Polite,

    /// Require exclusive access: lock the device or fail.
    #[default]
    Exclusive,

    /// Try to kill other users, try to lock the device, open it
    /// regardless. Use with care!
    Stomp,
}

/// Where lock files live unless overridden in
/// [`ConnectionOptions`](crate::connection::ConnectionOptions).
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// How many times a lost creation race is retried before giving up.
const CLAIM_ATTEMPTS: usize = 10;

/// A held lock file for a device; released on drop.
///
/// The lock file makes ownership visible to unrelated processes, even
/// across restarts: it records the owning process id, and a recorded
/// owner that is no longer alive is removed as stale by the next
/// claimant.
#[derive(Debug)]
pub struct MarkerLock {
    path: Option<PathBuf>,
}

/// Claims the lock file for `port` under `lock_dir`.
///
/// A missing lock directory, or an I/O failure creating the file,
/// degrades to running without this layer of protection. Only genuine
/// contention (a live foreign owner, or repeatedly losing the creation
/// race) fails, with [`Error::PortBusy`].
pub fn acquire_marker(lock_dir: &Path, port: &str, sharing: SharingMode) -> Result<MarkerLock> {
    if sharing == SharingMode::Oblivious {
        return Ok(MarkerLock { path: None });
    }
    if !lock_dir.is_dir() {
        debug!(lock_dir = %lock_dir.display(), "no lock directory");
        return Ok(MarkerLock { path: None });
    }

    let path = lock_dir.join(marker_name(port));
    for _ in 0..CLAIM_ATTEMPTS {
        if try_claim(&path, port, sharing)? {
            return Ok(MarkerLock { path: Some(path) });
        }
    }
    Err(Error::port_busy(port, "contention retries exceeded"))
}

fn marker_name(port: &str) -> String {
    let base = Path::new(port)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| port.to_string());
    format!("LCK..{base}")
}

fn try_claim(path: &Path, port: &str, sharing: SharingMode) -> Result<bool> {
    if let Some(owner) = marker_owner(path) {
        if owner == std::process::id() {
            debug!(path = %path.display(), "we already own the lock file");
            return Ok(true);
        }

        if sharing == SharingMode::Stomp {
            terminate(owner, path);
        } else {
            debug!(%owner, path = %path.display(), "lock file is owned");
            return Err(Error::port_busy(
                port,
                format!("{}: pid={owner}", path.display()),
            ));
        }
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if sharing == SharingMode::Stomp {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    match options.open(path) {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{:>10}", std::process::id()) {
                warn!(path = %path.display(), %e, "can't record owner in lock file");
            }
            debug!(path = %path.display(), "claimed lock file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "conflict creating lock file");
            Ok(false) // try again, with a retry limit
        }
        Err(e) => {
            warn!(path = %path.display(), %e, "can't create lock file");
            Ok(true) // proceed anyway
        }
    }
}

/// The live owner of the lock file, repairing stale or malformed files
/// along the way.
fn marker_owner(path: &Path) -> Option<u32> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), %e, "can't check lock file");
            return None;
        }
    };

    match text.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Some(pid),
        _ => {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed bad/stale lock file"),
                Err(e) => warn!(path = %path.display(), %e, "can't remove lock file"),
            }
            None
        }
    }
}

impl MarkerLock {
    fn release(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        // Never delete another process's lock file, even a stale-looking
        // one; staleness repair happens at claim time.
        let owner = fs::read_to_string(&path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok());
        if owner != Some(std::process::id()) {
            return;
        }

        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "released lock file"),
            Err(e) => warn!(path = %path.display(), %e, "can't release lock file"),
        }
    }
}

impl Drop for MarkerLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM and friends: the process exists, we just can't signal it.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No portable liveness check; assume the recorded owner is alive.
    true
}

#[cfg(unix)]
fn terminate(owner: u32, path: &Path) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(owner as i32), Signal::SIGTERM) {
        Ok(()) => debug!(%owner, path = %path.display(), "killed lock file owner"),
        Err(e) => warn!(%owner, path = %path.display(), %e, "can't kill lock file owner"),
    }
}

#[cfg(not(unix))]
fn terminate(owner: u32, path: &Path) {
    warn!(%owner, path = %path.display(), "can't kill lock file owner on this platform");
}

/// A held handle-level lock on an open device descriptor; released on
/// drop, before the descriptor is closed.
///
/// Complements [`MarkerLock`]: the lock file protects against total
/// strangers, while `flock` and `TIOCEXCL` on the live handle protect
/// against concurrent opens of the same device node by cooperating
/// code.
#[cfg(unix)]
#[derive(Debug)]
pub struct HandleLock {
    fd: Option<RawFd>,
    sharing: SharingMode,
    port: String,
}

/// Takes the handle-level lock on `fd` per `sharing`.
///
/// `Polite` probes for conflicts without holding anything exclusive,
/// then keeps a shared claim. `Exclusive` and `Stomp` hold the
/// exclusive advisory lock and additionally mark the device `TIOCEXCL`
/// so other opens of the node fail outright. Contention raises
/// [`Error::PortBusy`], except under `Stomp` which proceeds regardless;
/// every other failure is logged and non-fatal.
#[cfg(unix)]
pub fn lock_handle(port: &str, fd: RawFd, sharing: SharingMode) -> Result<HandleLock> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};

    if sharing == SharingMode::Oblivious {
        return Ok(HandleLock {
            fd: None,
            sharing,
            port: port.into(),
        });
    }

    let flocked = match sharing {
        SharingMode::Polite => flock(fd, FlockArg::LockExclusiveNonblock)
            .and_then(|_| flock(fd, FlockArg::UnlockNonblock))
            .and_then(|_| flock(fd, FlockArg::LockSharedNonblock)),
        _ => flock(fd, FlockArg::LockExclusiveNonblock),
    };

    match flocked {
        Ok(()) => debug!(%port, ?sharing, "acquired flock"),
        Err(Errno::EWOULDBLOCK) if sharing == SharingMode::Stomp => {
            warn!(%port, "can't lock (flock), proceeding");
        }
        Err(Errno::EWOULDBLOCK) => {
            return Err(Error::port_busy(port, "flock"));
        }
        Err(e) => warn!(%port, %e, "can't lock (flock)"),
    }

    if matches!(sharing, SharingMode::Exclusive | SharingMode::Stomp) {
        match unsafe { ioctl::tiocexcl(fd) } {
            Ok(_) => debug!(%port, "acquired TIOCEXCL"),
            Err(e) => warn!(%port, %e, "can't lock (TIOCEXCL)"),
        }
    }

    Ok(HandleLock {
        fd: Some(fd),
        sharing,
        port: port.into(),
    })
}

#[cfg(unix)]
impl Drop for HandleLock {
    fn drop(&mut self) {
        use nix::fcntl::{flock, FlockArg};

        let Some(fd) = self.fd.take() else {
            return;
        };

        if matches!(self.sharing, SharingMode::Exclusive | SharingMode::Stomp) {
            match unsafe { ioctl::tiocnxcl(fd) } {
                Ok(_) => debug!(port = %self.port, "released TIOCEXCL"),
                Err(e) => warn!(port = %self.port, %e, "can't release TIOCEXCL"),
            }
        }

        match flock(fd, FlockArg::UnlockNonblock) {
            Ok(()) => debug!(port = %self.port, "released flock"),
            Err(e) => warn!(port = %self.port, %e, "can't release flock"),
        }
    }
}

#[cfg(unix)]
mod ioctl {
    nix::ioctl_none_bad!(tiocexcl, nix::libc::TIOCEXCL);
    nix::ioctl_none_bad!(tiocnxcl, nix::libc::TIOCNXCL);
}
