use std::fmt::{self, Display};

use crate::devices::PeripheralHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl Status {
    /// Whether a link is being established or is up.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::Connected | Status::Streaming
        )
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Scanning => "scanning",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Streaming => "streaming",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Failures surfaced to subscribers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth adapter is powered off")]
    AdapterPoweredOff,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("service discovery failed")]
    ServiceDiscoveryFailed,
    #[error("peripheral has no notifiable characteristic")]
    NoNotifiableCharacteristic,
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("malformed frame: expected {0} bytes, got {1}")]
    MalformedFrame(usize, usize),
    #[error("disconnected: {0}")]
    Disconnected(String),
}

impl From<crate::frame::MalformedFrame> for ErrorKind {
    fn from(e: crate::frame::MalformedFrame) -> Self {
        ErrorKind::MalformedFrame(e.expected, e.actual)
    }
}

/// Snapshot of the connection, published by the hub after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: Status,
    pub active_peripheral: Option<PeripheralHandle>,
    pub last_error: Option<ErrorKind>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            active_peripheral: None,
            last_error: None,
        }
    }
}
