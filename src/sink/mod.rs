mod console;
mod file;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ChargingStatus, TelemetryReading};

/// The JSON object forwarded for every accepted reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub email: String,
    pub battery_id: String,
    pub received_at: DateTime<Utc>,
    pub timestamp_seconds: u32,
    pub total_battery_voltage: f64,
    pub output_voltage: f64,
    pub cell_temperature: f64,
    pub internal_temperature: f64,
    pub current_amps: f64,
    pub state_of_charge: u8,
    pub charging_status: ChargingStatus,
    pub cell_voltages: Vec<f64>,
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub cell_imbalance: bool,
    pub reading: TelemetryReading,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("user email/uid is required")]
    MissingUser,
    #[error("battery id is required")]
    MissingBatteryId,
}

impl Envelope {
    pub fn new(
        user: &str,
        battery_id: &str,
        reading: &TelemetryReading,
        imbalance_threshold_mv: u16,
    ) -> Result<Self, EnvelopeError> {
        let user = user.trim();
        if user.is_empty() {
            return Err(EnvelopeError::MissingUser);
        }
        let battery_id = battery_id.trim();
        if battery_id.is_empty() {
            return Err(EnvelopeError::MissingBatteryId);
        }

        Ok(Self {
            email: user.to_string(),
            battery_id: battery_id.to_string(),
            received_at: Utc::now(),
            timestamp_seconds: reading.timestamp_seconds,
            total_battery_voltage: reading.pack_total_volts(),
            output_voltage: reading.pack_load_volts(),
            cell_temperature: reading.temp_ts1_celsius(),
            internal_temperature: reading.temp_int_celsius(),
            current_amps: reading.current_amps(),
            state_of_charge: reading.state_of_charge_percent,
            charging_status: reading.charging_status(),
            cell_voltages: reading.cell_volts(),
            min_cell_voltage: f64::from(reading.min_cell_millivolts()) / 1000.0,
            max_cell_voltage: f64::from(reading.max_cell_millivolts()) / 1000.0,
            cell_imbalance: reading.is_imbalanced(imbalance_threshold_mv),
            reading: *reading,
        })
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn update(&mut self, envelope: &Envelope) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum SinkConfig {
    Console,
    File(file::Config),
}

impl SinkConfig {
    pub async fn into_sink(self) -> anyhow::Result<Box<dyn Sink>> {
        match self {
            SinkConfig::Console => Ok(Box::new(console::ConsoleSink)),
            SinkConfig::File(config) => Ok(Box::new(
                file::FileSink::new(config)
                    .await
                    .context("failed to create file sink")?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::mock_reading;

    #[test]
    fn envelope_requires_identifiers() {
        let reading = mock_reading(1);
        assert_eq!(
            Envelope::new("  ", "battery", &reading, 200),
            Err(EnvelopeError::MissingUser)
        );
        assert_eq!(
            Envelope::new("user@example.com", "", &reading, 200),
            Err(EnvelopeError::MissingBatteryId)
        );
    }

    #[test]
    fn envelope_serializes_like_the_ingestion_api() {
        let reading = mock_reading(1);
        let envelope = Envelope::new(" user@example.com ", "primary-battery-001", &reading, 200)
            .unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["email"], "user@example.com");
        assert_eq!(json["batteryId"], "primary-battery-001");
        assert_eq!(json["stateOfCharge"], 76);
        assert_eq!(json["chargingStatus"], "DISCHARGING");
        assert_eq!(json["cellVoltages"].as_array().unwrap().len(), 16);
        assert_eq!(json["cellImbalance"], false);
        assert_eq!(json["reading"]["current_milliamps"], -1200);
    }
}
