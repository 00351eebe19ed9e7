// MIT License - Copyright (c) 2021 TJForc
// Session configuration and live-tunable options

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAST_POLL_INTERVAL_SECS, DEFAULT_PORT,
    DEFAULT_REQUEST_RETRIES, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SCAN_INTERVAL_SECS,
    DEFAULT_WIRELESS_POLL_INTERVAL_SECS, MAX_FAST_POLL_INTERVAL_SECS, MAX_INSTANCE,
    MAX_SCAN_INTERVAL_SECS, MIN_FAST_POLL_INTERVAL_SECS, MIN_SCAN_INTERVAL_SECS,
};
use crate::error::{LinkboxError, Result};

/// Where a hub lives on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HubAddress {
    pub host: String,
    pub port: u16,
}

impl HubAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address (first IPv4 result preferred).
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| LinkboxError::InvalidConfig(format!("cannot resolve host {}", self.host)))
    }
}

impl Default for HubAddress {
    fn default() -> Self {
        Self::new("192.168.1.100", DEFAULT_PORT)
    }
}

impl fmt::Display for HubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Device instance of a hub's device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(pub u32);

impl DeviceIdentity {
    pub fn new(device_id: u32) -> Result<Self> {
        if device_id > MAX_INSTANCE {
            return Err(LinkboxError::InvalidConfig(format!(
                "device id {device_id} exceeds {MAX_INSTANCE}"
            )));
        }
        Ok(Self(device_id))
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Poll cadence.
///
/// Intervals are clamped on construction and on deserialize. The fields are
/// public, so the interval getters clamp again when the schedule reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PollPolicyToml")]
pub struct PollPolicy {
    /// Interval while no alarm is active (1-300 s)
    pub scan_interval_secs: u64,
    /// Interval while any alarm is active (1-10 s)
    pub fast_poll_interval_secs: u64,
    /// Whether wireless sensor points are read at all
    pub poll_wireless: bool,
    /// Minimum spacing of wireless reads when idle
    pub wireless_poll_interval_secs: u64,
}

#[derive(Deserialize)]
struct PollPolicyToml {
    #[serde(default = "default_scan_interval")]
    scan_interval_secs: u64,
    #[serde(default = "default_fast_poll_interval")]
    fast_poll_interval_secs: u64,
    #[serde(default = "default_true")]
    poll_wireless: bool,
    #[serde(default = "default_wireless_interval")]
    wireless_poll_interval_secs: u64,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}
fn default_fast_poll_interval() -> u64 {
    DEFAULT_FAST_POLL_INTERVAL_SECS
}
fn default_wireless_interval() -> u64 {
    DEFAULT_WIRELESS_POLL_INTERVAL_SECS
}
fn default_true() -> bool {
    true
}

impl From<PollPolicyToml> for PollPolicy {
    fn from(t: PollPolicyToml) -> Self {
        let mut policy = PollPolicy::new(t.scan_interval_secs, t.fast_poll_interval_secs);
        policy.poll_wireless = t.poll_wireless;
        policy.wireless_poll_interval_secs = t.wireless_poll_interval_secs.max(1);
        policy
    }
}

impl PollPolicy {
    /// Build a policy, clamping both intervals into their allowed ranges.
    pub fn new(scan_interval_secs: u64, fast_poll_interval_secs: u64) -> Self {
        Self {
            scan_interval_secs,
            fast_poll_interval_secs,
            poll_wireless: true,
            wireless_poll_interval_secs: DEFAULT_WIRELESS_POLL_INTERVAL_SECS,
        }
        .clamped()
    }

    /// The same policy with both intervals brought back into range.
    pub fn clamped(self) -> Self {
        Self {
            scan_interval_secs: self
                .scan_interval_secs
                .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS),
            fast_poll_interval_secs: self
                .fast_poll_interval_secs
                .clamp(MIN_FAST_POLL_INTERVAL_SECS, MAX_FAST_POLL_INTERVAL_SECS),
            ..self
        }
    }

    pub fn normal_interval(&self) -> Duration {
        Duration::from_secs(self.clamped().scan_interval_secs)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.clamped().fast_poll_interval_secs)
    }

    pub fn wireless_interval(&self) -> Duration {
        Duration::from_secs(self.wireless_poll_interval_secs)
    }

    /// Delay before the next poll given whether an alarm is currently active.
    pub fn interval_for(&self, alarm_active: bool) -> Duration {
        if alarm_active {
            self.fast_interval()
        } else {
            self.normal_interval()
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_INTERVAL_SECS, DEFAULT_FAST_POLL_INTERVAL_SECS)
    }
}

/// Notification routing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub mobile: bool,
    #[serde(default = "default_true")]
    pub persistent: bool,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            mobile: true,
            persistent: true,
        }
    }
}

/// Options that can change while a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HubOptions {
    #[serde(default)]
    pub polling: PollPolicy,
    #[serde(default)]
    pub notifications: NotificationOptions,
}

/// Configuration for one hub session.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Hub address (default port: 47808)
    pub address: HubAddress,
    /// Device instance of the hub
    pub device: DeviceIdentity,
    /// Display name used in logs and the bridge
    pub name: Option<String>,
    /// Per-request response timeout
    pub request_timeout: Duration,
    /// Extra attempts after a timed-out request
    pub request_retries: u32,
    /// Consecutive failed polls before connection_lost
    pub failure_threshold: u32,
    /// Local UDP port to bind (0 = ephemeral)
    pub local_port: u16,
    /// Live-tunable options
    pub options: HubOptions,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: HubAddress::default(),
            device: DeviceIdentity(0),
            name: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            request_retries: DEFAULT_REQUEST_RETRIES,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            local_port: 0,
            options: HubOptions::default(),
        }
    }
}

impl HubConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }

    /// Name for logs: the configured name, or host plus device id.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Waterguard Hub ({} #{})", self.address.host, self.device),
        }
    }
}

/// Builder for HubConfig.
#[derive(Debug, Clone, Default)]
pub struct HubConfigBuilder {
    config: HubConfig,
}

impl HubConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.address.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.address.port = port;
        self
    }

    pub fn address(mut self, address: HubAddress) -> Self {
        self.config.address = address;
        self
    }

    pub fn device_id(mut self, device_id: u32) -> Self {
        self.config.device = DeviceIdentity(device_id & MAX_INSTANCE);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout = Duration::from_millis(ms.max(1));
        self
    }

    pub fn request_retries(mut self, retries: u32) -> Self {
        self.config.request_retries = retries;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn polling(mut self, policy: PollPolicy) -> Self {
        self.config.options.polling = policy.clamped();
        self
    }

    pub fn notifications(mut self, options: NotificationOptions) -> Self {
        self.config.options.notifications = options;
        self
    }

    pub fn build(self) -> HubConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_policy_clamps() {
        let p = PollPolicy::new(0, 0);
        assert_eq!(p.scan_interval_secs, 1);
        assert_eq!(p.fast_poll_interval_secs, 1);

        let p = PollPolicy::new(1000, 60);
        assert_eq!(p.scan_interval_secs, 300);
        assert_eq!(p.fast_poll_interval_secs, 10);
    }

    #[test]
    fn test_interval_for() {
        let p = PollPolicy::new(30, 5);
        assert_eq!(p.interval_for(false), Duration::from_secs(30));
        assert_eq!(p.interval_for(true), Duration::from_secs(5));
    }

    #[test]
    fn test_struct_literal_cannot_escape_range() {
        let p = PollPolicy {
            scan_interval_secs: 0,
            fast_poll_interval_secs: 600,
            ..PollPolicy::default()
        };
        assert_eq!(p.interval_for(false), Duration::from_secs(1));
        assert_eq!(p.interval_for(true), Duration::from_secs(10));

        let config = HubConfig::builder().polling(p).build();
        assert_eq!(config.options.polling.scan_interval_secs, 1);
        assert_eq!(config.options.polling.fast_poll_interval_secs, 10);
    }

    #[test]
    fn test_poll_policy_deserialize_clamps() {
        let p: PollPolicy = toml::from_str("scan_interval_secs = 900\nfast_poll_interval_secs = 0").unwrap();
        assert_eq!(p.scan_interval_secs, 300);
        assert_eq!(p.fast_poll_interval_secs, 1);
        assert!(p.poll_wireless);
    }

    #[test]
    fn test_defaults() {
        let config = HubConfig::builder().build();
        assert_eq!(config.address.port, 47808);
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert_eq!(config.request_retries, 2);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.options.polling.scan_interval_secs, 2);
        assert_eq!(config.options.polling.fast_poll_interval_secs, 1);
        assert_eq!(config.options.notifications, NotificationOptions::default());
        assert!(config.options.notifications.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = HubConfig::builder()
            .host("10.0.0.7")
            .port(47809)
            .device_id(2229704)
            .name("Basement")
            .request_timeout_ms(1500)
            .build();
        assert_eq!(config.address, HubAddress::new("10.0.0.7", 47809));
        assert_eq!(config.device.id(), 2229704);
        assert_eq!(config.display_name(), "Basement");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_device_identity_bounds() {
        assert!(DeviceIdentity::new(4_194_303).is_ok());
        assert!(DeviceIdentity::new(4_194_304).is_err());
    }

    #[test]
    fn test_display_name_fallback() {
        let config = HubConfig::builder().host("hub.local").device_id(12).build();
        assert_eq!(config.display_name(), "Waterguard Hub (hub.local #12)");
    }
}
