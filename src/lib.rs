#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// An open connection to a serial device.
pub mod connection;

/// Relates to config files.
pub mod config;

/// Conversion between relative timeouts and absolute monotonic deadlines.
pub mod deadline;

/// Possible errors in this library.
pub mod error;

/// Expressions for picking serial devices of interest.
pub mod filter;

/// The device locking protocol: lock files plus handle-level locks.
pub mod lock;

/// Logging/tracing setup.
pub mod logging;

/// Mocked serial transports and scanners.
pub mod mock;

/// Enumeration of serial devices attached to the system.
pub mod scan;

/// Keeps a connection to a matching device alive across faults and
/// unplug events.
pub mod tracker;

/// The capability boundary to an actual serial device.
pub mod transport;

pub use connection::{ConnectionOptions, SerialConnection};
pub use error::Error;
pub use filter::PortFilter;
pub use lock::SharingMode;
pub use scan::ScannedPort;
pub use tracker::{PortTracker, TrackerOptions};
pub use transport::ControlSignals;
