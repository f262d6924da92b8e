use async_trait::async_trait;
use uuid::Uuid;

/// Radio events, delivered out of band from the calls made on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Advertisement {
        id: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Notification {
        id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    LinkLost {
        id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service: Uuid,
    pub uuid: Uuid,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicInfo {
    pub fn is_notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("cannot find bluetooth adapter")]
    NoAdapter,
    #[error("peripheral `{0}` is unknown to the adapter")]
    UnknownPeripheral(String),
    #[error("characteristic {0} not found")]
    UnknownCharacteristic(Uuid),
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

/// The radio, as seen by the connection state machine.
///
/// Implementations push [`TransportEvent`]s into the channel handed out at
/// construction; the methods here only acknowledge requests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// `false` when the adapter is known to be powered off.
    async fn powered(&self) -> Result<bool, TransportError>;

    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &str) -> Result<(), TransportError>;

    async fn discover(&self, id: &str) -> Result<Vec<CharacteristicInfo>, TransportError>;

    /// Enable notifications; payloads arrive as [`TransportEvent::Notification`].
    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, id: &str) -> Result<(), TransportError>;
}

/// Pick the data channel: `preferred` if present and notifiable, otherwise
/// the first characteristic that can notify or indicate.
pub fn select_characteristic(
    characteristics: &[CharacteristicInfo],
    preferred: Option<Uuid>,
) -> Option<CharacteristicInfo> {
    let mut notifiable = characteristics.iter().filter(|c| c.is_notifiable());
    if let Some(preferred) = preferred {
        if let Some(c) = notifiable.clone().find(|c| c.uuid == preferred) {
            return Some(*c);
        }
    }
    notifiable.next().copied()
}
