use std::time::Duration;

use cellwatch::{
    hub,
    permission::Unrestricted,
    sim::{mock_reading, Simulator, SimulatorConfig},
    sink::Envelope,
    Config, Status,
};
use futures::StreamExt;
use tokio::time::timeout;

fn quick() -> SimulatorConfig {
    SimulatorConfig {
        advertise_interval: Duration::from_millis(20),
        frame_interval: Duration::from_millis(20),
        jitter_millivolts: 0,
        ..SimulatorConfig::default()
    }
}

#[tokio::test]
async fn simulated_monitor_end_to_end() {
    let config = Config::default();
    let (transport, events) = Simulator::new(quick(), config.event_capacity);
    let (hub, backend) = hub::init(&config, transport, events, Unrestricted);
    let backend = tokio::spawn(backend.serve());

    let mut discoveries = Box::pin(hub.discoveries());
    let mut readings = Box::pin(hub.readings());
    hub.start_scan().await.unwrap();
    let monitor = timeout(Duration::from_secs(5), discoveries.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(monitor.name(), Some("ESP32-Mock-Streamer"));

    // The speaker never makes it past the name filter
    assert!(hub
        .candidates()
        .iter()
        .all(|p| p.id() == "sim:esp32-mock-streamer"));

    assert_eq!(hub.connect(monitor.clone()).await, Ok(Status::Streaming));
    let reading = timeout(Duration::from_secs(5), readings.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reading.cell_millivolts, mock_reading(0).cell_millivolts);
    assert_eq!(reading.pack_total_millivolts, 58472);

    let envelope =
        Envelope::new("rider@example.com", "primary-battery-001", &reading, 200).unwrap();
    assert!(!envelope.cell_imbalance);
    assert_eq!(envelope.cell_voltages.len(), 16);

    assert_eq!(hub.disconnect().await, Ok(Status::Idle));
    assert_eq!(hub.state().active_peripheral, None);

    hub.shutdown();
    timeout(Duration::from_secs(5), backend)
        .await
        .unwrap()
        .unwrap();
}
