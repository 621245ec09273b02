//! `HazardSensors` trait: the three readings the hazard monitor polls every
//! tick.

use warden_types::WardenError;

/// Sensors that feed hazard classification.
///
/// Every read may fail independently; the caller decides how to degrade.
pub trait HazardSensors: Send {
    /// Forward ultrasonic range in centimetres.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::SensorFault`] when no echo was received.
    fn read_distance(&mut self) -> Result<f32, WardenError>;

    /// Raw readings of the left, middle and right grayscale line sensors.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::SensorFault`] if the ADC read fails.
    fn read_grayscale(&mut self) -> Result<[u16; 3], WardenError>;

    /// Battery pack voltage in volts.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::SensorFault`] if the ADC read fails.
    fn read_battery_voltage(&mut self) -> Result<f32, WardenError>;
}

/// `true` when any line sensor reads at or below `edge_threshold`, i.e. the
/// floor under it has dropped away.
pub fn cliff_detected(triplet: [u16; 3], edge_threshold: u16) -> bool {
    triplet.iter().any(|&value| value <= edge_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_under_all_sensors_is_not_a_cliff() {
        assert!(!cliff_detected([900, 850, 1000], 200));
    }

    #[test]
    fn any_dark_sensor_is_a_cliff() {
        assert!(cliff_detected([900, 120, 1000], 200));
        assert!(cliff_detected([30, 850, 1000], 200));
    }

    #[test]
    fn reading_equal_to_threshold_counts_as_cliff() {
        assert!(cliff_detected([200, 850, 1000], 200));
    }
}
