//! Monotonic local clock for `last_updated` stamps

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Hands out strictly increasing timestamps that never fall behind wall time.
///
/// Two edits made on the same device are always ordered, even if the system
/// clock steps backwards between them. Cross-device skew is not corrected.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp for a local mutation
    pub fn tick(&self) -> DateTime<Utc> {
        self.tick_from(Utc::now())
    }

    /// Same as [`Clock::tick`] with an explicit wall-clock reading
    pub fn tick_from(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = match *last {
            Some(prev) if wall <= prev => prev + Duration::milliseconds(1),
            _ => wall,
        };
        *last = Some(next);
        next
    }

    /// Make sure future ticks land after a timestamp observed elsewhere
    /// (e.g. a remote revision adopted during merge).
    pub fn observe(&self, seen: DateTime<Utc>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.map_or(true, |prev| seen > prev) {
            *last = Some(seen);
        }
    }
}

/// Default timestamp for documents that carry none
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}
