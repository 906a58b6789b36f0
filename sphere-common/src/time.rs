//! Unix-epoch millisecond timestamps.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// Internally a non-negative [`i64`] for interoperability with serialization
/// targets that lack unsigned ints. Can represent any time up to roughly 292
/// million years past epoch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);

    /// The current [`SystemTime`], as a [`TimestampMs`].
    ///
    /// Panics if the system clock is set before 1970.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).expect("system clock before epoch")
    }

    pub const fn from_ms(ms: i64) -> Option<Self> {
        if ms >= 0 {
            Some(Self(ms))
        } else {
            None
        }
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Saturating add of a [`Duration`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        let add_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(add_ms))
    }

    /// Millis elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Self) -> Duration {
        let delta = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_millis(delta as u64)
    }
}

impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let ms = u64::try_from(timestamp.0).expect("non-negative invariant");
        UNIX_EPOCH + Duration::from_millis(ms)
    }
}

impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Time is before January 1st, 1970")?
            .context("Time is too far past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Self::from_ms(value).ok_or_else(|| {
            de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"unix timestamp must be non-negative",
            )
        })
    }
}

impl fmt::Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0..i64::MAX).prop_map(TimestampMs).boxed()
        }
    }
}
