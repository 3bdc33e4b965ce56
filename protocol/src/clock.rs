//! Clock-offset estimation from a four-timestamp exchange.
//!
//! All timestamps share one unit and epoch (UNIX milliseconds). `t1` and `t4` are read from the
//! client clock, `t2` and `t3` from the server clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Offset and delay derived from one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEstimate {
    /// Client clock minus server clock, as seen through this exchange.
    pub offset_ms: i64,
    /// Round trip minus server processing time.
    pub delay_ms: i64,
}

/// One completed time-sync exchange, correlated by `t1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Client send time.
    pub t1: i64,
    /// Server receive time.
    pub t2: i64,
    /// Server send time.
    pub t3: i64,
    /// Client receive time.
    pub t4: i64,
}

impl ClockSample {
    pub fn estimate(&self) -> ClockEstimate {
        compute_offset_delay(self.t1, self.t2, self.t3, self.t4)
    }
}

/// Pure arithmetic, no validation: callers decide what to do with a negative delay.
pub fn compute_offset_delay(t1: i64, t2: i64, t3: i64, t4: i64) -> ClockEstimate {
    let delay_ms = (t4 - t1) - (t3 - t2);
    let offset_ms = ((t2 - t1) + (t3 - t4)) / 2;
    ClockEstimate {
        offset_ms,
        delay_ms,
    }
}

/// Picks the estimate with the smallest delay; the earliest sample wins ties.
pub fn best_estimate<I>(samples: I) -> Option<ClockEstimate>
where
    I: IntoIterator<Item = ClockSample>,
{
    samples
        .into_iter()
        .map(|sample| sample.estimate())
        .fold(None, |best: Option<ClockEstimate>, candidate| match best {
            Some(current) if current.delay_ms <= candidate.delay_ms => Some(current),
            _ => Some(candidate),
        })
}

/// Wall clock in UNIX milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or(0)
}
