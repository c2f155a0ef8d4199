use core::time::Duration;

pub(crate) trait DurationNanos {
    /// Whole nanoseconds, saturating at `u64::MAX`.
    fn as_nanos_u64(&self) -> u64;
}

impl DurationNanos for Duration {
    #[inline]
    fn as_nanos_u64(&self) -> u64 {
        u64::try_from(self.as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Converts an accumulated (possibly decayed) nanosecond figure back into a
/// `Duration`.
#[inline]
pub(crate) fn duration_from_nanos_f64(nanos: f64) -> Duration {
    if nanos.is_finite() && nanos > 0.0 {
        // Saturating float-to-int cast.
        Duration::from_nanos(nanos.round() as u64)
    } else {
        Duration::ZERO
    }
}
