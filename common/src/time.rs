// A simple module to define the time types used in the project
//
// The functions here use SystemTime::now() which is non-deterministic:
// only use them for logging, liveness bookkeeping and admission control.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    let start = SystemTime::now();

    start
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from get_current_time")
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return timestamp in milliseconds
// We cast it to u64 as we have plenty of time before it overflows
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_is_seconds_scaled() {
        let seconds = get_current_time_in_seconds();
        let millis = get_current_time_in_millis();
        assert!(millis / 1000 >= seconds);
        assert!(millis / 1000 <= seconds + 1);
    }
}
