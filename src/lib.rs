//! Stream cell telemetry from BLE battery monitors.
//!
//! The monitor advertises under a name carrying a product marker (`ESP32` by
//! default) and pushes one fixed 49 byte frame per notification on its live
//! characteristic. This crate finds such monitors, keeps a single link to one
//! of them and decodes every frame into a [`TelemetryReading`].
//!
//! ```no_run
//! # use futures::StreamExt;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = cellwatch::Config::default();
//! let (transport, events) = cellwatch::ble::BleTransport::new(config.event_capacity).await?;
//! let (hub, backend) = cellwatch::hub::init(&config, transport, events, cellwatch::permission::Unrestricted);
//! tokio::spawn(backend.serve());
//!
//! let mut discoveries = Box::pin(hub.discoveries());
//! hub.start_scan().await?;
//! if let Some(monitor) = discoveries.next().await {
//!     let mut readings = Box::pin(hub.readings());
//!     hub.connect(monitor).await?;
//!     while let Some(reading) = readings.next().await {
//!         println!("{:?}", reading);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod config;
pub mod devices;
pub mod frame;
pub mod hub;
pub mod message;
pub mod permission;
pub mod sim;
pub mod sink;
pub mod state;
pub mod transport;

pub use config::Config;
pub use devices::{PeripheralFilter, PeripheralHandle};
pub use hub::{Error, Hub};
pub use message::TelemetryReading;
pub use state::{ConnectionState, ErrorKind, Status};
