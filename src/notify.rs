// MIT License - Copyright (c) 2021 TJForc
// Alarm notification rendering and routing

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NotificationOptions;
use crate::devices::alarm::{AlarmKind, AlarmSource, AlarmTransition, Edge};

/// Urgency hint passed to the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl AlarmKind {
    pub fn priority(&self) -> Priority {
        match self {
            Self::WaterAlarm | Self::WaterLeak => Priority::High,
            Self::ValveAlarm | Self::ConnectionLost => Priority::Medium,
            Self::LowBattery => Priority::Low,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::WaterAlarm => "mdi:water-alert",
            Self::WaterLeak => "mdi:water",
            Self::ValveAlarm => "mdi:valve-closed",
            Self::LowBattery => "mdi:battery-low",
            Self::ConnectionLost => "mdi:wifi-off",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::WaterAlarm => "Water Alarm Detected",
            Self::WaterLeak => "Water Leak Detected",
            Self::ValveAlarm => "Valve Alarm",
            Self::LowBattery => "Low Battery Warning",
            Self::ConnectionLost => "Connection Lost",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            Self::WaterAlarm => {
                "Water alarm has been triggered on your Waterguard system. Please check your water sensors immediately."
            }
            Self::WaterLeak => {
                "Water leak detected by sensor. Please check the monitored area and reset the alarm after addressing the issue."
            }
            Self::ValveAlarm => {
                "A valve alarm has been triggered on your Waterguard system. This may indicate a disconnected or malfunctioning valve."
            }
            Self::LowBattery => {
                "Low battery detected on a wireless sensor. Please replace the battery soon to ensure continued operation."
            }
            Self::ConnectionLost => {
                "Connection to the Waterguard hub has been lost. Please check the hub's power and network connection."
            }
        }
    }
}

/// Where a notification goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Push message to a phone
    Mobile,
    /// Banner that stays until dismissed
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Show,
    Dismiss,
}

/// Text and presentation hints for one alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub icon: &'static str,
}

/// One message for one sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: AlarmKind,
    pub source: AlarmSource,
    pub device_id: u32,
    pub channel: Channel,
    pub action: Action,
    /// Stable id so a sink can replace or dismiss an earlier banner
    pub notification_id: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub icon: &'static str,
    pub is_test: bool,
    pub timestamp: DateTime<Utc>,
}

/// Banner id shared by every source of one alarm kind on one hub.
pub fn notification_id(kind: AlarmKind, device_id: u32) -> String {
    format!("waterguard_linkbox_{device_id}_{kind}")
}

/// Turns alarm transitions into notifications according to the configured
/// options.
///
/// A condition notifies once when it rises and again only after it has
/// fallen. Transitions must be fed in emission order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    options: NotificationOptions,
    active: HashSet<(u32, AlarmKind, AlarmSource)>,
}

impl Dispatcher {
    pub fn new(options: NotificationOptions) -> Self {
        Self {
            options,
            active: HashSet::new(),
        }
    }

    pub fn options(&self) -> NotificationOptions {
        self.options
    }

    /// Takes effect from the next dispatch.
    pub fn set_options(&mut self, options: NotificationOptions) {
        if options != self.options {
            info!(
                "Notification options: enabled={} mobile={} persistent={}",
                options.enabled, options.mobile, options.persistent
            );
        }
        self.options = options;
    }

    /// Alarms currently notified and not yet cleared.
    pub fn active(&self) -> impl Iterator<Item = &(u32, AlarmKind, AlarmSource)> {
        self.active.iter()
    }

    /// React to one transition.
    ///
    /// A rising edge shows the alarm on the enabled channels. A falling edge
    /// dismisses the persistent banner once no other source of the same kind
    /// is still active.
    pub fn dispatch(&mut self, transition: &AlarmTransition) -> Vec<Notification> {
        self.dispatch_at(transition, Utc::now())
    }

    fn dispatch_at(&mut self, t: &AlarmTransition, now: DateTime<Utc>) -> Vec<Notification> {
        let key = (t.device_id, t.kind, t.source);
        match t.edge {
            Edge::Rising => {
                if !self.active.insert(key) {
                    debug!("{} from {} already notified", t.kind, t.source);
                    return Vec::new();
                }
                if !self.options.enabled {
                    debug!("Notifications disabled, not sending {}", t.kind);
                    return Vec::new();
                }
                let rendered = Self::render(t.kind, t.source, t.device_id, false, now);
                self.route(t.kind, t.source, t.device_id, &rendered, false, now)
            }
            Edge::Falling => {
                if !self.active.remove(&key) {
                    return Vec::new();
                }
                let still_active = self
                    .active
                    .iter()
                    .any(|(dev, kind, _)| *dev == t.device_id && *kind == t.kind);
                if still_active || !self.options.enabled || !self.options.persistent {
                    return Vec::new();
                }
                vec![Notification {
                    kind: t.kind,
                    source: t.source,
                    device_id: t.device_id,
                    channel: Channel::Persistent,
                    action: Action::Dismiss,
                    notification_id: notification_id(t.kind, t.device_id),
                    title: String::new(),
                    message: String::new(),
                    priority: t.kind.priority(),
                    icon: t.kind.icon(),
                    is_test: false,
                    timestamp: now,
                }]
            }
        }
    }

    /// Send a synthetic alarm through the render/route step, skipping edge
    /// tracking. Only the channel flags apply.
    pub fn test_notification(&self, kind: AlarmKind, device_id: u32) -> Vec<Notification> {
        let now = Utc::now();
        let source = kind.default_source();
        let rendered = Self::render(kind, source, device_id, true, now);
        info!("Sending test {} notification for hub {}", kind, device_id);
        self.route(kind, source, device_id, &rendered, true, now)
    }

    /// Title, message, priority and icon for an alarm.
    pub fn render(
        kind: AlarmKind,
        source: AlarmSource,
        device_id: u32,
        is_test: bool,
        at: DateTime<Utc>,
    ) -> RenderedMessage {
        let prefix = if is_test { "[TEST] " } else { "" };
        let time = at.format("%Y-%m-%d %H:%M:%S UTC");
        let details = match kind {
            AlarmKind::ConnectionLost => format!("Hub: {device_id}\nLast seen: {time}"),
            _ => format!("Sensor: {source}\nHub: {device_id}\nTime: {time}"),
        };
        RenderedMessage {
            title: format!("{prefix}{}", kind.title()),
            message: format!("{}\n\n{details}", kind.body()),
            priority: kind.priority(),
            icon: kind.icon(),
        }
    }

    fn route(
        &self,
        kind: AlarmKind,
        source: AlarmSource,
        device_id: u32,
        rendered: &RenderedMessage,
        is_test: bool,
        now: DateTime<Utc>,
    ) -> Vec<Notification> {
        let channels = [
            (Channel::Mobile, self.options.mobile),
            (Channel::Persistent, self.options.persistent),
        ];
        channels
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(channel, _)| Notification {
                kind,
                source,
                device_id,
                channel,
                action: Action::Show,
                notification_id: notification_id(kind, device_id),
                title: rendered.title.clone(),
                message: rendered.message.clone(),
                priority: rendered.priority,
                icon: rendered.icon,
                is_test,
                timestamp: now,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DEV: u32 = 42;

    fn rise(kind: AlarmKind, source: AlarmSource) -> AlarmTransition {
        AlarmTransition::rising(kind, source, DEV)
    }

    fn fall(kind: AlarmKind, source: AlarmSource) -> AlarmTransition {
        AlarmTransition::falling(kind, source, DEV)
    }

    #[test]
    fn test_rising_edge_goes_to_both_channels() {
        let mut d = Dispatcher::default();
        let out = d.dispatch(&rise(AlarmKind::WaterAlarm, AlarmSource::System));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel, Channel::Mobile);
        assert_eq!(out[1].channel, Channel::Persistent);
        assert!(out.iter().all(|n| n.action == Action::Show));
        assert_eq!(out[0].title, "Water Alarm Detected");
        assert_eq!(out[0].priority, Priority::High);
    }

    #[test]
    fn test_channel_flags() {
        let mut d = Dispatcher::new(NotificationOptions {
            enabled: true,
            mobile: false,
            persistent: true,
        });
        let out = d.dispatch(&rise(AlarmKind::LowBattery, AlarmSource::WirelessBattery));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, Channel::Persistent);
        assert_eq!(out[0].priority, Priority::Low);
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut d = Dispatcher::new(NotificationOptions {
            enabled: false,
            ..NotificationOptions::default()
        });
        assert!(d.dispatch(&rise(AlarmKind::WaterLeak, AlarmSource::SensorTape)).is_empty());
        assert!(d.dispatch(&fall(AlarmKind::WaterLeak, AlarmSource::SensorTape)).is_empty());
    }

    #[test]
    fn test_repeat_needs_fall_then_rise() {
        let mut d = Dispatcher::default();
        let t = rise(AlarmKind::ConnectionLost, AlarmSource::Hub);
        assert_eq!(d.dispatch(&t).len(), 2);
        assert!(d.dispatch(&t).is_empty());

        let dismissed = d.dispatch(&fall(AlarmKind::ConnectionLost, AlarmSource::Hub));
        assert_eq!(dismissed.len(), 1);
        assert_eq!(dismissed[0].action, Action::Dismiss);
        assert_eq!(dismissed[0].channel, Channel::Persistent);

        assert_eq!(d.dispatch(&t).len(), 2);
    }

    #[test]
    fn test_banner_kept_while_other_source_active() {
        let mut d = Dispatcher::default();
        d.dispatch(&rise(AlarmKind::WaterLeak, AlarmSource::SensorTape));
        d.dispatch(&rise(AlarmKind::WaterLeak, AlarmSource::WirelessPoint(1)));

        assert!(d.dispatch(&fall(AlarmKind::WaterLeak, AlarmSource::SensorTape)).is_empty());
        let out = d.dispatch(&fall(AlarmKind::WaterLeak, AlarmSource::WirelessPoint(1)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].notification_id, "waterguard_linkbox_42_water_leak");
    }

    #[test]
    fn test_falling_without_rising_is_ignored() {
        let mut d = Dispatcher::default();
        assert!(d.dispatch(&fall(AlarmKind::ValveAlarm, AlarmSource::Valve(1))).is_empty());
    }

    #[test]
    fn test_options_apply_to_next_dispatch() {
        let mut d = Dispatcher::default();
        d.set_options(NotificationOptions {
            enabled: true,
            mobile: true,
            persistent: false,
        });
        let out = d.dispatch(&rise(AlarmKind::ValveAlarm, AlarmSource::Valve(1)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, Channel::Mobile);
        assert_eq!(out[0].icon, "mdi:valve-closed");
    }

    #[test]
    fn test_render_test_prefix_and_details() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let r = Dispatcher::render(AlarmKind::WaterLeak, AlarmSource::WirelessPoint(2), DEV, true, at);
        assert_eq!(r.title, "[TEST] Water Leak Detected");
        assert!(r.message.starts_with("Water leak detected by sensor."));
        assert!(r.message.contains("Sensor: wireless_leak_2"));
        assert!(r.message.contains("2026-03-01 12:00:00 UTC"));
    }

    #[test]
    fn test_test_notification_skips_edge_tracking() {
        let d = Dispatcher::default();
        let out = d.test_notification(AlarmKind::LowBattery, DEV);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|n| n.is_test));
        assert_eq!(out[0].title, "[TEST] Low Battery Warning");
        assert_eq!(d.active().count(), 0);
    }
}
