//! Window planning for backfill runs.
//!
//! A backfill ignores stored watermarks and re-reads `[from, end]` in fixed-width
//! blocks, oldest first. Writes stay idempotent, so re-running a backfill over
//! data that is already present only costs API calls.

use crate::services::fetch::FetchWindow;
use chrono::{Duration, NaiveDateTime};

/// Consecutive windows covering `[from, end]`; the last one is clipped to `end`.
pub fn backfill_windows(from: NaiveDateTime, end: NaiveDateTime, block: Duration) -> Vec<FetchWindow> {
    let step = if block <= Duration::zero() { Duration::days(1) } else { block };
    let mut out = Vec::new();
    let mut start = from;
    while start < end {
        let stop = start.checked_add_signed(step).map_or(end, |s| s.min(end));
        out.push(FetchWindow { start, end: stop });
        start = stop;
    }
    out
}
