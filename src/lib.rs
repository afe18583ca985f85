//! # emotiva-control
//!
//! Async client library for controlling Emotiva XMC-series A/V processors
//! over their LAN remote-control protocol (UDP + XML, protocol versions
//! 2.0/3.0/3.1).
//!
//! The crate is the protocol engine: device discovery, the four UDP
//! endpoints, command/ack correlation with retry and backoff, subscription
//! management, notification fan-out with bounded concurrency and per-callback
//! deadlines, keepalive surveillance, and a coordinated connect/reconnect/
//! close lifecycle. One [`EmotivaController`] instance controls one device.
//!
//! # Quick start
//!
//! ```no_run
//! use emotiva_control::{EmotivaController, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("192.168.1.40".parse()?)
//!         .with_default_subscriptions(["power", "volume"]);
//!     let controller = EmotivaController::new(config)?;
//!
//!     let device = controller.connect().await?;
//!     println!("connected to {} ({})", device.name, device.model);
//!
//!     let _watch = controller.on_property("volume", |event| {
//!         println!("volume is now {}", event.value);
//!     });
//!
//!     controller.set_volume(-35.0).await?;
//!     controller.close().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod codec;
mod config;
mod controller;
mod discovery;
mod dispatch;
mod error;
mod keepalive;
pub mod logging;
pub mod names;
mod protocol;
mod socket;
mod types;

pub use config::EngineConfig;
pub use controller::EmotivaController;
pub use dispatch::Registration;
pub use error::{ConnectError, DiscoveryError, ProtocolError, Result, TransportError};
pub use types::{
    AckResult, AckStatus, Command, ConnectionEvent, ConnectionState, DeviceDescriptor,
    EndpointRole, EngineStats, LossReason, PropertyEvent, ProtocolVersion, RawNotification,
    SubscribeOutcome,
};
