use std::time::{Duration, Instant};

/// An absolute point in monotonic time beyond which a bounded wait gives
/// up, or the sentinel "wait forever".
///
/// Blocking operations take a relative `Option<Duration>` timeout
/// (`None` meaning unbounded), convert it once with [`Deadline::after`],
/// and recompute the remaining wait from the deadline on every wakeup.
/// This keeps spurious wakeups from extending the effective wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    /// Give up at this instant.
    At(Instant),

    /// Never give up.
    Never,
}

impl Deadline {
    /// The deadline `timeout` from now.
    ///
    /// `None` waits forever, a zero timeout is already expired, and a
    /// timeout too large for the clock saturates to [`Deadline::Never`].
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::Never,
            Some(timeout) => match Instant::now().checked_add(timeout) {
                Some(at) => Self::At(at),
                None => Self::Never,
            },
        }
    }

    /// The remaining wait: `None` for unbounded, [`Duration::ZERO`] once
    /// expired.
    ///
    /// Converting back with [`Deadline::after`] never overshoots the
    /// original deadline.
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(self) -> bool {
        self.remaining().is_some_and(|wait| wait.is_zero())
    }
}
