//! Time utilities for queue liveness and match ordering

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Render a stored millisecond timestamp as RFC 3339 for logs and the demo binary
pub fn format_millis(millis: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{}ms", millis))
}

/// Source of the logical clock written into queue and match documents.
///
/// Every timestamp the coordinator stores or compares goes through a `Clock`,
/// so all participants sharing one clock agree on staleness.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        unix_millis()
    }
}

/// Clock anchored at a chosen epoch that then advances with
/// `tokio::time`. Under a paused runtime it moves only when tokio's clock does.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_millis: u64,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(origin_millis: u64) -> Self {
        Self {
            origin_millis,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis + self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_virtual_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now_millis(), 31_000);
    }

    #[test]
    fn formats_epoch_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00+00:00");
    }
}
