use thiserror::Error;

/// Any error this library might encounter.
///
/// Faults recorded on a connection are re-reported to every later caller,
/// so the type is cheap to clone and carries no raw OS error values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The device could not be opened, for a reason other than contention.
    #[error("{port}: serial port open error: {reason}")]
    OpenFailed {
        /// The device in question.
        port: String,

        /// What went wrong.
        reason: String,
    },

    /// Another owner holds the device per the lock protocol, or the OS
    /// reports the device as busy.
    #[error("{port}: serial port busy ({reason})")]
    PortBusy {
        /// The device in question.
        port: String,

        /// Which layer reported contention.
        reason: String,
    },

    /// A read, write or signal operation failed against an open device.
    #[error("{port}: serial I/O error: {reason}")]
    IoFailed {
        /// The device in question.
        port: String,

        /// What went wrong.
        reason: String,
    },

    /// The connection was deliberately closed.
    ///
    /// Distinguished from other I/O faults so callers can tell an
    /// intentional shutdown apart from a device falling over.
    #[error("{port}: serial port closed")]
    Closed {
        /// The device in question.
        port: String,
    },

    /// Serial devices could not be enumerated.
    #[error("can't scan serial ports: {0}")]
    ScanFailed(String),

    /// A port filter expression failed to parse.
    #[error("bad port filter: {0}")]
    FilterInvalid(String),
}

impl Error {
    pub(crate) fn open_failed(port: &str, reason: impl ToString) -> Self {
        Self::OpenFailed {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn port_busy(port: &str, reason: impl ToString) -> Self {
        Self::PortBusy {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io_failed(port: &str, reason: impl ToString) -> Self {
        Self::IoFailed {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from an attempt to open a device.
    ///
    /// [`Error::PortBusy`] is the contention special case of
    /// [`Error::OpenFailed`].
    pub fn is_open_error(&self) -> bool {
        matches!(self, Self::OpenFailed { .. } | Self::PortBusy { .. })
    }

    /// Whether this error came from I/O against an already-open device.
    ///
    /// [`Error::Closed`] is the deliberate-shutdown special case of
    /// [`Error::IoFailed`].
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::IoFailed { .. } | Self::Closed { .. })
    }
}

/// Short-hand result type used throughout this library.
pub type Result<T> = std::result::Result<T, Error>;
