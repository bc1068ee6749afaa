//! Registry timestamps
//!
//! Key modification times are 100-nanosecond ticks since 1601-01-01, the
//! native resolution of the persisted `#time=` fields. The section headers of
//! the text format additionally carry Unix epoch seconds for readability, so
//! both conversions live here.

use std::time::{SystemTime, UNIX_EPOCH};

/// 100 ns ticks per second.
pub const TICKS_PER_SEC: u64 = 10_000_000;

/// Ticks between 1601-01-01 and 1970-01-01.
pub const TICKS_1601_TO_1970: u64 = 86400 * (369 * 365 + 89) * TICKS_PER_SEC;

/// A modification timestamp in ticks since 1601. Zero is reserved for
/// "not yet assigned" during file loads.
pub type Ticks = u64;

/// Current time in ticks since 1601.
pub fn now() -> Ticks {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => TICKS_1601_TO_1970 + d.as_secs() * TICKS_PER_SEC + u64::from(d.subsec_nanos()) / 100,
        Err(_) => TICKS_1601_TO_1970,
    }
}

/// Convert ticks to Unix epoch seconds, saturating below 1970.
pub fn ticks_to_epoch(ticks: Ticks) -> u64 {
    ticks.saturating_sub(TICKS_1601_TO_1970) / TICKS_PER_SEC
}

/// Convert Unix epoch seconds to ticks.
pub fn epoch_to_ticks(secs: u64) -> Ticks {
    secs * TICKS_PER_SEC + TICKS_1601_TO_1970
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_round_trip() {
        assert_eq!(ticks_to_epoch(epoch_to_ticks(1_000_000_000)), 1_000_000_000);
    }

    #[test]
    fn test_epoch_origin() {
        assert_eq!(ticks_to_epoch(TICKS_1601_TO_1970), 0);
        assert_eq!(ticks_to_epoch(0), 0);
    }

    #[test]
    fn test_now_is_past_1970() {
        assert!(now() > TICKS_1601_TO_1970);
    }
}
