use async_trait::async_trait;

use super::{Envelope, Sink};

pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn update(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        println!(
            "[update] {}: battery {} reports {:.2}V, {:.2}A ({:?}), soc {}%, ts1 {:.2}C, int {:.2}C, cells {:.3}-{:.3}V{}",
            envelope.received_at,
            envelope.battery_id,
            envelope.total_battery_voltage,
            envelope.current_amps,
            envelope.charging_status,
            envelope.state_of_charge,
            envelope.cell_temperature,
            envelope.internal_temperature,
            envelope.min_cell_voltage,
            envelope.max_cell_voltage,
            if envelope.cell_imbalance {
                " [cell imbalance]"
            } else {
                ""
            }
        );
        Ok(())
    }
}
