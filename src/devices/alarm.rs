// MIT License - Copyright (c) 2021 TJForc
// Alarm conditions and the transitions derived from them

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Serialize, Serializer};

bitflags! {
    /// Alarm conditions derived from a hub's state.
    ///
    /// Transitions are computed as `old ^ new`: a bit that became set is a
    /// rising edge, a bit that became clear is a falling edge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AlarmConditions: u16 {
        /// Hub system alarm (water alarm latched)
        const SYSTEM_ALARM              = 1 << 0;
        /// Wired sensor tape reports water
        const SENSOR_TAPE_LEAK          = 1 << 1;
        /// Wireless leak point 1 reports water
        const WIRELESS_LEAK_1           = 1 << 2;
        /// Wireless leak point 2 reports water
        const WIRELESS_LEAK_2           = 1 << 3;
        /// Valve bus reports no valves connected
        const VALVE_SYSTEM_DISCONNECTED = 1 << 4;
        /// Valve 1 disconnected
        const VALVE_1_DISCONNECTED      = 1 << 5;
        /// Valve 2 disconnected (only when two valves are fitted)
        const VALVE_2_DISCONNECTED      = 1 << 6;
        /// Wireless battery below threshold
        const LOW_BATTERY               = 1 << 7;
        /// Hub unreachable for too many consecutive polls
        const CONNECTION_LOST           = 1 << 8;
    }
}

/// Each condition, in emission order, with the notification kind and source it maps to.
pub const CONDITION_TABLE: [(AlarmConditions, AlarmKind, AlarmSource); 9] = [
    (AlarmConditions::SYSTEM_ALARM, AlarmKind::WaterAlarm, AlarmSource::System),
    (AlarmConditions::SENSOR_TAPE_LEAK, AlarmKind::WaterLeak, AlarmSource::SensorTape),
    (AlarmConditions::WIRELESS_LEAK_1, AlarmKind::WaterLeak, AlarmSource::WirelessPoint(1)),
    (AlarmConditions::WIRELESS_LEAK_2, AlarmKind::WaterLeak, AlarmSource::WirelessPoint(2)),
    (AlarmConditions::VALVE_SYSTEM_DISCONNECTED, AlarmKind::ValveAlarm, AlarmSource::ValveSystem),
    (AlarmConditions::VALVE_1_DISCONNECTED, AlarmKind::ValveAlarm, AlarmSource::Valve(1)),
    (AlarmConditions::VALVE_2_DISCONNECTED, AlarmKind::ValveAlarm, AlarmSource::Valve(2)),
    (AlarmConditions::LOW_BATTERY, AlarmKind::LowBattery, AlarmSource::WirelessBattery),
    (AlarmConditions::CONNECTION_LOST, AlarmKind::ConnectionLost, AlarmSource::Hub),
];

impl AlarmConditions {
    /// Conditions that switch polling to the fast interval.
    pub const ALARMS: Self = Self::all().difference(Self::CONNECTION_LOST);

    /// Get the flags that changed between old and new conditions.
    pub fn changed(old: Self, new: Self) -> Self {
        old ^ new
    }

    /// Kind and source for a single condition bit.
    pub fn describe(self) -> Option<(AlarmKind, AlarmSource)> {
        CONDITION_TABLE
            .iter()
            .find(|(flag, _, _)| *flag == self)
            .map(|(_, kind, source)| (*kind, *source))
    }

    /// Transitions between two condition sets, in table order.
    pub fn transitions(old: Self, new: Self, device_id: u32) -> Vec<AlarmTransition> {
        let changed = Self::changed(old, new);
        CONDITION_TABLE
            .iter()
            .filter(|(flag, _, _)| changed.contains(*flag))
            .map(|(flag, kind, source)| AlarmTransition {
                kind: *kind,
                edge: if new.contains(*flag) {
                    Edge::Rising
                } else {
                    Edge::Falling
                },
                device_id,
                source: *source,
            })
            .collect()
    }
}

/// Notification category of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    WaterAlarm,
    WaterLeak,
    ValveAlarm,
    LowBattery,
    ConnectionLost,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 5] = [
        AlarmKind::WaterAlarm,
        AlarmKind::WaterLeak,
        AlarmKind::ValveAlarm,
        AlarmKind::LowBattery,
        AlarmKind::ConnectionLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaterAlarm => "water_alarm",
            Self::WaterLeak => "water_leak",
            Self::ValveAlarm => "valve_alarm",
            Self::LowBattery => "low_battery",
            Self::ConnectionLost => "connection_lost",
        }
    }

    /// Source used when a kind is raised without a specific sensor (test notifications).
    pub fn default_source(&self) -> AlarmSource {
        match self {
            Self::WaterAlarm => AlarmSource::System,
            Self::WaterLeak => AlarmSource::SensorTape,
            Self::ValveAlarm => AlarmSource::ValveSystem,
            Self::LowBattery => AlarmSource::WirelessBattery,
            Self::ConnectionLost => AlarmSource::Hub,
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown alarm type: {s}"))
    }
}

/// Which sensor or subsystem an alarm came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlarmSource {
    System,
    SensorTape,
    WirelessPoint(u8),
    ValveSystem,
    Valve(u8),
    WirelessBattery,
    Hub,
}

impl AlarmSource {
    pub fn label(&self) -> String {
        match self {
            Self::System => "water_alarm".into(),
            Self::SensorTape => "sensor_tape".into(),
            Self::WirelessPoint(n) => format!("wireless_leak_{n}"),
            Self::ValveSystem => "valve_system".into(),
            Self::Valve(n) => format!("valve_{n}"),
            Self::WirelessBattery => "wireless_battery".into(),
            Self::Hub => "hub".into(),
        }
    }
}

impl fmt::Display for AlarmSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for AlarmSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// Direction of a condition change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

/// A single false→true or true→false change of an alarm condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AlarmTransition {
    pub kind: AlarmKind,
    pub edge: Edge,
    pub device_id: u32,
    pub source: AlarmSource,
}

impl AlarmTransition {
    pub fn rising(kind: AlarmKind, source: AlarmSource, device_id: u32) -> Self {
        Self {
            kind,
            edge: Edge::Rising,
            device_id,
            source,
        }
    }

    pub fn falling(kind: AlarmKind, source: AlarmSource, device_id: u32) -> Self {
        Self {
            kind,
            edge: Edge::Falling,
            device_id,
            source,
        }
    }

    pub fn is_rising(&self) -> bool {
        self.edge == Edge::Rising
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed() {
        let old = AlarmConditions::SYSTEM_ALARM | AlarmConditions::LOW_BATTERY;
        let new = AlarmConditions::SYSTEM_ALARM | AlarmConditions::SENSOR_TAPE_LEAK;
        let changed = AlarmConditions::changed(old, new);
        assert!(changed.contains(AlarmConditions::LOW_BATTERY));
        assert!(changed.contains(AlarmConditions::SENSOR_TAPE_LEAK));
        assert!(!changed.contains(AlarmConditions::SYSTEM_ALARM));
    }

    #[test]
    fn test_transitions_edges_and_order() {
        let old = AlarmConditions::LOW_BATTERY;
        let new = AlarmConditions::SYSTEM_ALARM | AlarmConditions::WIRELESS_LEAK_2;
        let t = AlarmConditions::transitions(old, new, 77);
        assert_eq!(t.len(), 3);
        assert_eq!(t[0], AlarmTransition::rising(AlarmKind::WaterAlarm, AlarmSource::System, 77));
        assert_eq!(
            t[1],
            AlarmTransition::rising(AlarmKind::WaterLeak, AlarmSource::WirelessPoint(2), 77)
        );
        assert_eq!(
            t[2],
            AlarmTransition::falling(AlarmKind::LowBattery, AlarmSource::WirelessBattery, 77)
        );
    }

    #[test]
    fn test_no_transitions_when_unchanged() {
        let c = AlarmConditions::VALVE_1_DISCONNECTED;
        assert!(AlarmConditions::transitions(c, c, 1).is_empty());
    }

    #[test]
    fn test_alarms_mask_excludes_connection_lost() {
        assert!(!AlarmConditions::ALARMS.contains(AlarmConditions::CONNECTION_LOST));
        assert!(AlarmConditions::ALARMS.contains(AlarmConditions::LOW_BATTERY));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("valve_alarm".parse::<AlarmKind>().unwrap(), AlarmKind::ValveAlarm);
        assert!("fire".parse::<AlarmKind>().is_err());
        for k in AlarmKind::ALL {
            assert_eq!(k.as_str().parse::<AlarmKind>().unwrap(), k);
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            AlarmConditions::VALVE_2_DISCONNECTED.describe(),
            Some((AlarmKind::ValveAlarm, AlarmSource::Valve(2)))
        );
    }

    #[test]
    fn test_transition_json() {
        let t = AlarmTransition::rising(AlarmKind::WaterLeak, AlarmSource::WirelessPoint(1), 5);
        let v = serde_json::to_value(t).unwrap();
        assert_eq!(v["kind"], "water_leak");
        assert_eq!(v["edge"], "rising");
        assert_eq!(v["source"], "wireless_leak_1");
        assert_eq!(v["device_id"], 5);
    }
}
