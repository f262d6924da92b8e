#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use cellwatch::{
    frame,
    hub::{self, Hub},
    permission::{PermissionGate, PermissionStatus},
    sim::{mock_reading, LIVE_CHARACTERISTIC_UUID, SERVICE_UUID},
    transport::{CharacteristicInfo, Transport, TransportError, TransportEvent},
    Config, PeripheralHandle, Status,
};
use tokio::sync::mpsc;

/// What the fake radio does, and what was asked of it.
pub struct Script {
    pub powered: bool,
    pub fail_scan: bool,
    pub fail_connect: bool,
    pub hold_connect: bool,
    pub fail_discovery: bool,
    pub fail_subscribe: bool,
    // Push one frame the moment notifications are enabled
    pub frame_on_subscribe: bool,
    pub characteristics: Vec<CharacteristicInfo>,
    pub calls: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            powered: true,
            fail_scan: false,
            fail_connect: false,
            hold_connect: false,
            fail_discovery: false,
            fail_subscribe: false,
            frame_on_subscribe: false,
            characteristics: vec![live_characteristic()],
            calls: Vec::new(),
        }
    }
}

pub fn live_characteristic() -> CharacteristicInfo {
    CharacteristicInfo {
        service: SERVICE_UUID,
        uuid: LIVE_CHARACTERISTIC_UUID,
        notify: true,
        indicate: false,
    }
}

pub struct FakeTransport {
    script: Arc<Mutex<Script>>,
    radio: mpsc::Sender<TransportEvent>,
}

impl FakeTransport {
    fn record(&self, call: String) {
        self.script.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn powered(&self) -> Result<bool, TransportError> {
        Ok(self.script.lock().unwrap().powered)
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.record("start_scan".to_string());
        if self.script.lock().unwrap().fail_scan {
            return Err(TransportError::Other("radio busy".to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record("stop_scan".to_string());
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        self.record(format!("connect {}", id));
        let (fail, hold) = {
            let script = self.script.lock().unwrap();
            (script.fail_connect, script.hold_connect)
        };
        if hold {
            futures::future::pending::<()>().await;
        }
        if fail {
            return Err(TransportError::Other("out of range".to_string()));
        }
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<Vec<CharacteristicInfo>, TransportError> {
        self.record(format!("discover {}", id));
        let script = self.script.lock().unwrap();
        if script.fail_discovery {
            return Err(TransportError::Other("gatt error".to_string()));
        }
        Ok(script.characteristics.clone())
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError> {
        self.record(format!("subscribe {} {}", id, characteristic.uuid));
        let (fail, emit) = {
            let script = self.script.lock().unwrap();
            (script.fail_subscribe, script.frame_on_subscribe)
        };
        if fail {
            return Err(TransportError::Other("descriptor write rejected".to_string()));
        }
        if emit {
            let event = TransportEvent::Notification {
                id: id.to_string(),
                characteristic: characteristic.uuid,
                value: frame::encode(&mock_reading(1)).to_vec(),
            };
            self.radio.send(event).await.ok();
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        self.record(format!("disconnect {}", id));
        Ok(())
    }
}

pub struct FixedGate(pub PermissionStatus);

#[async_trait]
impl PermissionGate for FixedGate {
    fn check(&self) -> PermissionStatus {
        self.0
    }

    async fn request(&self) -> bool {
        self.0 == PermissionStatus::Granted
    }
}

pub struct Harness {
    pub hub: Hub,
    pub script: Arc<Mutex<Script>>,
    pub radio: mpsc::Sender<TransportEvent>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::with(Config::default(), script, PermissionStatus::Granted)
    }

    pub fn with(config: Config, script: Script, permission: PermissionStatus) -> Self {
        let script = Arc::new(Mutex::new(script));
        let (radio, events) = mpsc::channel(64);
        let transport = FakeTransport {
            script: script.clone(),
            radio: radio.clone(),
        };
        let (hub, backend) = hub::init(&config, transport, events, FixedGate(permission));
        tokio::spawn(backend.serve());
        Self { hub, script, radio }
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub async fn advertise(&self, id: &str, name: Option<&str>, rssi: i16) {
        self.radio
            .send(TransportEvent::Advertisement {
                id: id.to_string(),
                name: name.map(str::to_string),
                rssi: Some(rssi),
            })
            .await
            .unwrap();
    }

    pub async fn notify(&self, id: &str, value: Vec<u8>) {
        self.radio
            .send(TransportEvent::Notification {
                id: id.to_string(),
                characteristic: LIVE_CHARACTERISTIC_UUID,
                value,
            })
            .await
            .unwrap();
    }

    pub async fn notify_frame(&self, id: &str, timestamp: u32) {
        self.notify(id, frame::encode(&mock_reading(timestamp)).to_vec())
            .await
    }

    pub async fn lose_link(&self, id: &str) {
        self.radio
            .send(TransportEvent::LinkLost {
                id: id.to_string(),
                reason: "supervision timeout".to_string(),
            })
            .await
            .unwrap();
    }

    /// Wait until the published status is `status`.
    pub async fn wait_for(&self, status: Status) {
        let mut state = self.hub.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                if state.borrow_and_update().status == status {
                    return;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status {} never reached", status));
    }

    /// Connect to `id` and wait for the stream to start.
    pub async fn stream_from(&self, id: &str) -> PeripheralHandle {
        let peripheral = monitor(id);
        assert_eq!(
            self.hub.connect(peripheral.clone()).await,
            Ok(Status::Streaming)
        );
        peripheral
    }
}

pub fn monitor(id: &str) -> PeripheralHandle {
    PeripheralHandle::new(id, Some(format!("ESP32-{}", id)), Some(-60)).unwrap()
}
