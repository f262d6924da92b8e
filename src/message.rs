use serde::{Deserialize, Serialize};

/// Number of series cells reported in every frame.
pub const CELL_COUNT: usize = 16;

/// One telemetry sample as sent by the battery monitor.
///
/// Values are kept in the units used on the wire; the helper methods convert
/// to volts, amps and degrees when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub timestamp_seconds: u32,
    // Index order is the physical series position
    pub cell_millivolts: [u16; CELL_COUNT],
    pub pack_total_millivolts: u16,
    pub pack_load_millivolts: u16,
    pub pack_sum_active_millivolts: u16,
    // Positive while charging, negative while discharging
    pub current_milliamps: i16,
    pub temp_ts1_centidegrees_c: i16,
    pub temp_int_centidegrees_c: i16,
    pub state_of_charge_percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargingStatus {
    Charging,
    Discharging,
    Inactive,
}

const LOW_SOC_PERCENT: u8 = 20;
const CRITICAL_SOC_PERCENT: u8 = 5;

impl TelemetryReading {
    pub fn min_cell_millivolts(&self) -> u16 {
        self.cell_millivolts.iter().copied().min().unwrap_or_default()
    }

    pub fn max_cell_millivolts(&self) -> u16 {
        self.cell_millivolts.iter().copied().max().unwrap_or_default()
    }

    /// Spread between the highest and the lowest cell.
    pub fn cell_delta_millivolts(&self) -> u16 {
        self.max_cell_millivolts() - self.min_cell_millivolts()
    }

    pub fn is_imbalanced(&self, threshold_millivolts: u16) -> bool {
        self.cell_delta_millivolts() > threshold_millivolts
    }

    pub fn charging_status(&self) -> ChargingStatus {
        match self.current_milliamps {
            c if c > 0 => ChargingStatus::Charging,
            c if c < 0 => ChargingStatus::Discharging,
            _ => ChargingStatus::Inactive,
        }
    }

    pub fn is_low(&self) -> bool {
        self.state_of_charge_percent < LOW_SOC_PERCENT
    }

    pub fn is_critical(&self) -> bool {
        self.state_of_charge_percent < CRITICAL_SOC_PERCENT
    }

    pub fn pack_total_volts(&self) -> f64 {
        f64::from(self.pack_total_millivolts) / 1000.0
    }

    pub fn pack_load_volts(&self) -> f64 {
        f64::from(self.pack_load_millivolts) / 1000.0
    }

    pub fn current_amps(&self) -> f64 {
        f64::from(self.current_milliamps) / 1000.0
    }

    pub fn temp_ts1_celsius(&self) -> f64 {
        f64::from(self.temp_ts1_centidegrees_c) / 100.0
    }

    pub fn temp_int_celsius(&self) -> f64 {
        f64::from(self.temp_int_centidegrees_c) / 100.0
    }

    pub fn cell_volts(&self) -> Vec<f64> {
        self.cell_millivolts
            .iter()
            .map(|&mv| f64::from(mv) / 1000.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> TelemetryReading {
        TelemetryReading {
            timestamp_seconds: 1000,
            cell_millivolts: [
                3580, 3600, 3590, 3590, 3600, 3570, 3620, 3620, 3590, 3580, 3570, 3580, 3590,
                3580, 3580, 3600,
            ],
            pack_total_millivolts: 57440,
            pack_load_millivolts: 56870,
            pack_sum_active_millivolts: 57300,
            current_milliamps: -19830,
            temp_ts1_centidegrees_c: 3700,
            temp_int_centidegrees_c: 2500,
            state_of_charge_percent: 100,
        }
    }

    #[test]
    fn cell_statistics() {
        let r = reading();
        assert_eq!(r.min_cell_millivolts(), 3570);
        assert_eq!(r.max_cell_millivolts(), 3620);
        assert_eq!(r.cell_delta_millivolts(), 50);
        assert!(!r.is_imbalanced(200));
        assert!(r.is_imbalanced(49));
    }

    #[test]
    fn charging_status_follows_current_sign() {
        let mut r = reading();
        assert_eq!(r.charging_status(), ChargingStatus::Discharging);
        r.current_milliamps = 1;
        assert_eq!(r.charging_status(), ChargingStatus::Charging);
        r.current_milliamps = 0;
        assert_eq!(r.charging_status(), ChargingStatus::Inactive);
    }

    #[test]
    fn unit_conversions() {
        let r = reading();
        assert!((r.pack_total_volts() - 57.44).abs() < 1e-9);
        assert!((r.current_amps() + 19.83).abs() < 1e-9);
        assert!((r.temp_ts1_celsius() - 37.0).abs() < 1e-9);
        assert!((r.temp_int_celsius() - 25.0).abs() < 1e-9);
        assert_eq!(r.cell_volts().len(), CELL_COUNT);
    }

    #[test]
    fn soc_thresholds() {
        let mut r = reading();
        assert!(!r.is_low());
        r.state_of_charge_percent = 19;
        assert!(r.is_low() && !r.is_critical());
        r.state_of_charge_percent = 4;
        assert!(r.is_critical());
    }

    #[test]
    fn charging_status_serializes_upper_case() {
        let s = serde_json::to_string(&ChargingStatus::Inactive).unwrap();
        assert_eq!(s, "\"INACTIVE\"");
    }
}
