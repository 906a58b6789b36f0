//! Exponential backoff iterators for retry loops.

use std::{cmp::min, time::Duration};

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// [`tokio::time::sleep`](https://docs.rs/tokio/latest/tokio/time/fn.sleep.html)
/// to observe time-based exponential backoff: 250ms, 500ms, 1s, .. capped at
/// 32s.
pub fn iter() -> impl Iterator<Item = Duration> {
    iter_with_initial_wait_ms(INITIAL_WAIT_MS)
}

/// [`iter`], but starting from a custom initial wait. Used where the first
/// retry should come quickly (e.g. aggregator proof polls, whose rounds are
/// about two seconds).
pub fn iter_with_initial_wait_ms(initial_wait_ms: u64) -> impl Iterator<Item = Duration> {
    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_wait_ms.saturating_mul(factor);
        Duration::from_millis(min(wait_ms, MAXIMUM_WAIT_MS))
    })
}
