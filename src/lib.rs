// MIT License - Copyright (c) 2021 TJForc
// Waterguard Linkbox LAN bridge
//
//! # waterguard-linkbox
//!
//! Local-network monitoring and control of Waterguard Linkbox water-leak
//! protection hubs over BACnet/IP.
//!
//! A hub reports its main valve, a wired sensor tape and a wireless sensor
//! node (two leak points, temperature, humidity and battery). This library
//! polls those points at an adaptive cadence, turns them into a typed
//! [`SystemState`], detects alarm edges, and renders notifications. It also
//! drives the valve and resets latched alarms.
//!
//! ## Quick Start
//!
//! ```no_run
//! use waterguard_linkbox::{HubConfig, HubEvent, LinkboxHub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HubConfig::builder()
//!         .host("192.168.1.40")
//!         .device_id(2229704)
//!         .build();
//!
//!     let mut hub = LinkboxHub::connect(config).await?;
//!
//!     let mut events = hub.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let HubEvent::Alarm(t) = event {
//!                 println!("{} {:?} on {}", t.kind, t.edge, t.source);
//!             }
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     hub.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod devices;
pub mod error;
pub mod event;
pub mod hub;
pub mod notify;
pub mod poller;
pub mod protocol;
pub mod service;
pub mod setup;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{DeviceClient, DeviceInfo};
pub use config::{DeviceIdentity, HubAddress, HubConfig, HubConfigBuilder, HubOptions, NotificationOptions, PollPolicy};
pub use devices::{AlarmConditions, AlarmKind, AlarmSource, AlarmTransition, Edge};
pub use devices::{ValveCommand, ValveControlState, ValveStatus};
pub use devices::{Connectivity, PointCheck, WirelessReport};
pub use error::{LinkboxError, Rejection, Result};
pub use event::{EventReceiver, HubEvent};
pub use hub::{Diagnostics, LinkboxHub};
pub use notify::{Action, Channel, Dispatcher, Notification, Priority};
pub use poller::PollStats;
pub use service::HubRegistry;
pub use setup::{HubInfo, SetupError};
pub use state::{RawReading, SystemState};
pub use transport::discovery::DiscoveredHub;
pub use transport::{Transport, UdpTransport};
