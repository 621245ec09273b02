//! Battery voltage → state-of-charge conversion for the 2S Li-ion pack.

/// Pack voltage treated as fully charged.
pub const FULL_VOLTAGE: f32 = 7.8;

/// Pack voltage treated as empty.
pub const EMPTY_VOLTAGE: f32 = 6.7;

/// Convert a pack voltage to a percentage in `0.0..=100.0`.
///
/// At or above [`FULL_VOLTAGE`] reads 100 %, at or below [`EMPTY_VOLTAGE`]
/// reads 0 %, and anything in between is interpolated linearly.
///
/// ```
/// use warden_hal::battery::voltage_to_percent;
///
/// assert_eq!(voltage_to_percent(8.2), 100.0);
/// assert_eq!(voltage_to_percent(6.0), 0.0);
/// ```
pub fn voltage_to_percent(volts: f32) -> f32 {
    if volts >= FULL_VOLTAGE {
        100.0
    } else if volts <= EMPTY_VOLTAGE {
        0.0
    } else {
        (volts - EMPTY_VOLTAGE) / (FULL_VOLTAGE - EMPTY_VOLTAGE) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_saturate() {
        assert_eq!(voltage_to_percent(FULL_VOLTAGE), 100.0);
        assert_eq!(voltage_to_percent(EMPTY_VOLTAGE), 0.0);
    }

    #[test]
    fn midpoint_is_half_charge() {
        let mid = (FULL_VOLTAGE + EMPTY_VOLTAGE) / 2.0;
        assert!((voltage_to_percent(mid) - 50.0).abs() < 0.01);
    }

    #[test]
    fn conversion_is_monotonic() {
        let low = voltage_to_percent(7.0);
        let high = voltage_to_percent(7.5);
        assert!(low < high);
        assert!((low - 27.27).abs() < 0.05);
    }
}
