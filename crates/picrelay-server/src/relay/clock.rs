//! Delivery timestamps.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Issues RFC 3339 timestamps that never go backwards, even if the wall
/// clock is stepped back. Ties are allowed.
#[derive(Debug, Default)]
pub struct DeliveryClock {
    last_millis: AtomicI64,
}

impl DeliveryClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp for a delivery happening now.
    pub fn now(&self) -> String {
        self.stamp(Utc::now())
    }

    fn stamp(&self, wall: DateTime<Utc>) -> String {
        let wall_millis = wall.timestamp_millis();
        let prev = self.last_millis.fetch_max(wall_millis, Ordering::AcqRel);
        let millis = prev.max(wall_millis);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(wall)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
