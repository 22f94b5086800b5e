//! Wall-clock timestamps handed to read callbacks.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock timestamp with microsecond resolution.
///
/// Each event loop records one of these when its poll call returns and
/// passes it to every read callback dispatched in that iteration, so all
/// messages received in one wakeup share a receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Capture the current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(since_epoch.as_micros() as u64)
    }

    /// Build a timestamp from microseconds since the Unix epoch.
    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Microseconds since the Unix epoch.
    #[inline]
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns false for the default (zero) timestamp.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}
