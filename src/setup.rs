// MIT License - Copyright (c) 2021 TJForc
// First-time setup: finding a hub's device id and checking it answers

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{DeviceClient, DeviceInfo};
use crate::config::{DeviceIdentity, HubAddress, HubConfig};
use crate::error::LinkboxError;
use crate::transport::discovery::{self, query_device_id};
use crate::transport::{Transport, UdpTransport};

/// Setup failures, each with the code a setup form shows.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Cannot connect to hub: {0}")]
    CannotConnect(String),

    #[error("Discovery timed out")]
    DiscoveryTimeout,

    #[error("Discovery failed: {0}")]
    DiscoveryError(String),

    /// Reserved; hubs do not authenticate.
    #[error("Invalid authentication")]
    InvalidAuth,

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl SetupError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CannotConnect(_) => "cannot_connect",
            Self::DiscoveryTimeout => "discovery_timeout",
            Self::DiscoveryError(_) => "discovery_error",
            Self::InvalidAuth => "invalid_auth",
            Self::Unknown(_) => "unknown",
        }
    }

    fn from_connect(e: LinkboxError) -> Self {
        match e {
            LinkboxError::Io(_)
            | LinkboxError::Timeout { .. }
            | LinkboxError::Rejected(_)
            | LinkboxError::UnknownDevice(_)
            | LinkboxError::InvalidConfig(_)
            | LinkboxError::ChannelClosed => Self::CannotConnect(e.to_string()),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// What a successful validation learned about the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubInfo {
    /// Suggested entry title
    pub title: String,
    pub address: HubAddress,
    #[serde(flatten)]
    pub device: DeviceInfo,
}

/// Device ids of the hubs answering at `address`.
///
/// Broadcasts a Who-Is for the whole window. If nothing answers, the address
/// is queried directly with a wildcard read. An empty list means the user has
/// to enter the id by hand; it is not an error.
pub async fn discover(
    address: &HubAddress,
    window: Duration,
) -> std::result::Result<Vec<DeviceIdentity>, SetupError> {
    let hubs = discovery::discover(address, window).await.map_err(|e| match e {
        LinkboxError::Timeout { .. } => SetupError::DiscoveryTimeout,
        other => SetupError::DiscoveryError(other.to_string()),
    })?;

    let mut ids: Vec<u32> = hubs.iter().map(|h| h.device_id).collect();
    if ids.is_empty() {
        if let Some(id) = query_wildcard(address, window).await {
            ids.push(id);
        }
    }
    Ok(unique_identities(ids))
}

async fn query_wildcard(address: &HubAddress, wait: Duration) -> Option<u32> {
    let config = HubConfig::builder()
        .address(address.clone())
        .request_timeout_ms(wait.as_millis() as u64)
        .request_retries(0)
        .build();
    let transport = match UdpTransport::connect(&config).await {
        Ok(t) => t,
        Err(e) => {
            debug!("Wildcard read skipped: {}", e);
            return None;
        }
    };
    let found = match query_device_id(&transport, wait).await {
        Ok(id) => id,
        Err(e) => {
            debug!("Wildcard read failed: {}", e);
            None
        }
    };
    transport.close().await;
    if let Some(id) = found {
        info!("Hub at {} reports device id {}", address, id);
    }
    found
}

fn unique_identities(ids: Vec<u32>) -> Vec<DeviceIdentity> {
    let mut out: Vec<DeviceIdentity> = Vec::new();
    for id in ids {
        match DeviceIdentity::new(id) {
            Ok(identity) if !out.contains(&identity) => out.push(identity),
            Ok(_) => {}
            Err(e) => warn!("Ignoring discovered id: {}", e),
        }
    }
    out
}

/// Pick the device id for a hub configured without one.
///
/// Nothing answering is reported as `DiscoveryTimeout`. With several
/// candidates the first is used.
pub async fn resolve_device_id(
    address: &HubAddress,
    window: Duration,
) -> std::result::Result<DeviceIdentity, SetupError> {
    let ids = discover(address, window).await?;
    match ids.as_slice() {
        [] => Err(SetupError::DiscoveryTimeout),
        [only] => Ok(*only),
        [first, ..] => {
            warn!(
                "{} hubs answered at {}, using device id {}",
                ids.len(),
                address,
                first
            );
            Ok(*first)
        }
    }
}

/// Check that `device` answers at `address` and read its identity.
pub async fn validate(
    address: &HubAddress,
    device: DeviceIdentity,
) -> std::result::Result<HubInfo, SetupError> {
    let config = HubConfig::builder()
        .address(address.clone())
        .device_id(device.id())
        .build();
    let transport = Arc::new(UdpTransport::connect(&config).await.map_err(SetupError::from_connect)?);
    let result = validate_with(transport.clone(), address, device).await;
    transport.close().await;
    result
}

pub(crate) async fn validate_with<T: Transport>(
    transport: Arc<T>,
    address: &HubAddress,
    device: DeviceIdentity,
) -> std::result::Result<HubInfo, SetupError> {
    let client = DeviceClient::new(transport, device.id());
    client.test_connection().await.map_err(|e| {
        warn!("Failed to connect to hub {} at {}: {}", device, address, e);
        SetupError::from_connect(e)
    })?;

    let info = match client.read_device_info().await {
        Ok(info) => info,
        Err(e) => {
            debug!("Device info unavailable: {}", e);
            DeviceInfo {
                device_id: device.id(),
                ..DeviceInfo::default()
            }
        }
    };

    Ok(HubInfo {
        title: format!("Waterguard Hub ({})", address.host),
        address: address.clone(),
        device: info,
    })
}
