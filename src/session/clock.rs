//! Wall-clock timestamps for sender reports

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

fn since_unix_epoch(time: SystemTime) -> Duration {
    time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO)
}

/// 64-bit NTP timestamp: 32 bits of seconds, 32 bits of fraction
pub fn ntp_timestamp(time: SystemTime) -> u64 {
    let since_epoch = since_unix_epoch(time);
    let seconds = (since_epoch.as_secs() + NTP_UNIX_OFFSET_SECS) & 0xFFFF_FFFF;
    let fraction = (since_epoch.subsec_nanos() as u64 * (1u64 << 32)) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Media timestamp matching `time` at `clock_rate` Hz. Wraps at 32 bits.
pub fn rtp_timestamp(time: SystemTime, clock_rate: u32) -> u32 {
    let millis = since_unix_epoch(time).as_millis() as u64;
    (millis.wrapping_mul(clock_rate as u64) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_epoch_offset() {
        let ntp = ntp_timestamp(UNIX_EPOCH);
        assert_eq!(ntp >> 32, NTP_UNIX_OFFSET_SECS);
        assert_eq!(ntp & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn test_ntp_half_second_fraction() {
        let ntp = ntp_timestamp(UNIX_EPOCH + Duration::from_millis(1500));
        assert_eq!(ntp >> 32, NTP_UNIX_OFFSET_SECS + 1);
        assert_eq!(ntp & 0xFFFF_FFFF, 1 << 31);
    }

    #[test]
    fn test_rtp_timestamp_scale() {
        assert_eq!(rtp_timestamp(UNIX_EPOCH + Duration::from_millis(10), 90_000), 900);
    }
}
