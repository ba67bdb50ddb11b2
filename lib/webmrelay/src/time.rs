use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in microseconds since 1970-01-01.
pub type Usec = i64;

pub const USEC_PER_SEC: Usec = 1_000_000;

/// Returns the current wall-clock time in microseconds since the epoch.
#[inline]
pub fn time_now() -> Usec {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch");

    now.as_secs() as Usec * USEC_PER_SEC + Usec::from(now.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_now_is_monotonic_enough() {
        let a = time_now();
        let b = time_now();

        // 2001-09-09 in usecs; anything earlier means the conversion is off
        assert!(a > 1_000_000_000_000_000);
        assert!(b >= a);
    }
}
