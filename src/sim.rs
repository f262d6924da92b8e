//! A stand-in for the radio that behaves like the mock streamer firmware:
//! one advertised monitor, one notify characteristic, one frame per interval.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, Instant},
};
use uuid::Uuid;

use crate::{
    frame,
    message::{TelemetryReading, CELL_COUNT},
    transport::{CharacteristicInfo, Transport, TransportError, TransportEvent},
};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xaaaaaaaa_bbbb_cccc_dddd_eeeeeeeeeee0);
pub const LIVE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xaaaaaaaa_bbbb_cccc_dddd_eeeeeeeeeee1);

/// The firmware's canned sample: cells around 3.65 V, discharging at 1.2 A.
pub fn mock_reading(timestamp_seconds: u32) -> TelemetryReading {
    let mut cell_millivolts = [0u16; CELL_COUNT];
    for (i, cell) in cell_millivolts.iter_mut().enumerate() {
        *cell = 3650 + (i % 4) as u16 * 3;
    }

    let mut reading = TelemetryReading {
        timestamp_seconds,
        cell_millivolts,
        pack_total_millivolts: 0,
        pack_load_millivolts: 0,
        pack_sum_active_millivolts: 0,
        current_milliamps: -1200,
        temp_ts1_centidegrees_c: 2550,
        temp_int_centidegrees_c: 2800,
        state_of_charge_percent: 76,
    };
    sum_pack(&mut reading);
    reading
}

// The firmware reports the pack as the sum of its cells, 50 mV less under load
fn sum_pack(reading: &mut TelemetryReading) {
    let total: u32 = reading.cell_millivolts.iter().map(|&mv| u32::from(mv)).sum();
    let total = u16::try_from(total).unwrap_or(u16::MAX);
    reading.pack_total_millivolts = total;
    reading.pack_sum_active_millivolts = total;
    reading.pack_load_millivolts = total.saturating_sub(50);
}

/// Shift every cell up by a random amount of at most `max` mV.
fn jitter<R: Rng>(reading: &mut TelemetryReading, max: u16, rng: &mut R) {
    if max == 0 {
        return;
    }
    for cell in reading.cell_millivolts.iter_mut() {
        *cell = cell.saturating_add(rng.gen_range(0..=max));
    }
    sum_pack(reading);
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub id: String,
    pub name: String,
    pub rssi: i16,
    pub advertise_interval: Duration,
    pub frame_interval: Duration,
    // Random variation applied to each cell, in mV
    pub jitter_millivolts: u16,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            id: "sim:esp32-mock-streamer".to_string(),
            name: "ESP32-Mock-Streamer".to_string(),
            rssi: -58,
            advertise_interval: Duration::from_millis(500),
            frame_interval: Duration::from_secs(1),
            jitter_millivolts: 5,
        }
    }
}

pub struct Simulator {
    config: SimulatorConfig,
    sender: mpsc::Sender<TransportEvent>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    streamer: Mutex<Option<JoinHandle<()>>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                config,
                sender,
                advertiser: Mutex::new(None),
                streamer: Mutex::new(None),
            },
            receiver,
        )
    }

    fn check_id(&self, id: &str) -> Result<(), TransportError> {
        if id == self.config.id {
            Ok(())
        } else {
            Err(TransportError::UnknownPeripheral(id.to_string()))
        }
    }
}

async fn advertise(config: SimulatorConfig, sender: mpsc::Sender<TransportEvent>) {
    let mut ticker = interval(config.advertise_interval);
    loop {
        ticker.tick().await;
        let sightings = [
            TransportEvent::Advertisement {
                id: config.id.clone(),
                name: Some(config.name.clone()),
                rssi: Some(config.rssi),
            },
            // Neighbouring noise the filter has to reject
            TransportEvent::Advertisement {
                id: "sim:speaker".to_string(),
                name: Some("RandomSpeaker".to_string()),
                rssi: Some(-71),
            },
        ];
        for sighting in sightings {
            if sender.send(sighting).await.is_err() {
                return;
            }
        }
    }
}

async fn stream(config: SimulatorConfig, sender: mpsc::Sender<TransportEvent>) {
    let started = Instant::now();
    let mut ticker = interval(config.frame_interval);
    loop {
        ticker.tick().await;
        let mut reading = mock_reading(started.elapsed().as_secs() as u32);
        jitter(&mut reading, config.jitter_millivolts, &mut rand::thread_rng());
        let event = TransportEvent::Notification {
            id: config.id.clone(),
            characteristic: LIVE_CHARACTERISTIC_UUID,
            value: frame::encode(&reading).to_vec(),
        };
        if sender.send(event).await.is_err() {
            return;
        }
    }
}

fn replace(slot: &mut Option<JoinHandle<()>>, task: Option<JoinHandle<()>>) {
    if let Some(previous) = std::mem::replace(slot, task) {
        previous.abort();
    }
}

#[async_trait]
impl Transport for Simulator {
    async fn powered(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        let task = tokio::spawn(advertise(self.config.clone(), self.sender.clone()));
        replace(&mut *self.advertiser.lock().await, Some(task));
        debug!("simulated scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        replace(&mut *self.advertiser.lock().await, None);
        debug!("simulated scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        self.check_id(id)?;
        info!("simulated link to {} up", id);
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<Vec<CharacteristicInfo>, TransportError> {
        self.check_id(id)?;
        Ok(vec![CharacteristicInfo {
            service: SERVICE_UUID,
            uuid: LIVE_CHARACTERISTIC_UUID,
            notify: true,
            indicate: false,
        }])
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError> {
        self.check_id(id)?;
        if characteristic.uuid != LIVE_CHARACTERISTIC_UUID {
            return Err(TransportError::UnknownCharacteristic(characteristic.uuid));
        }
        let task = tokio::spawn(stream(self.config.clone(), self.sender.clone()));
        replace(&mut *self.streamer.lock().await, Some(task));
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        self.check_id(id)?;
        replace(&mut *self.streamer.lock().await, None);
        info!("simulated link to {} down", id);
        Ok(())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        replace(self.advertiser.get_mut(), None);
        replace(self.streamer.get_mut(), None);
    }
}
