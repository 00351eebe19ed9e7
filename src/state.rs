// MIT License - Copyright (c) 2021 TJForc
// Hub state snapshot and the fold that turns readings into alarm edges

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::codec::PropertyValue;
use crate::constants::{BATTERY_VOLTAGE_RANGE, HUMIDITY_RANGE, MAX_VALVES, Point, TEMPERATURE_RANGE};
use crate::devices::alarm::{AlarmConditions, AlarmTransition};
use crate::devices::valve::{ValveControlState, ValveStatus, decode_valve_count};
use crate::devices::wireless::{battery_percentage, is_low_battery, leak_from_value, reading_in_range};

/// Last known state of one hub.
///
/// `None` means the point has never been read successfully (or was cleared
/// after the session was re-established).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemState {
    pub valve_count: Option<u32>,
    pub valve_system_disconnected: bool,
    pub valves: [ValveStatus; MAX_VALVES as usize],
    pub valve_control: Option<ValveControlState>,
    pub system_alarm: Option<bool>,
    pub sensor_tape_leak: Option<bool>,
    pub wireless_leak: [Option<bool>; 2],
    pub wireless_temperature: Option<f32>,
    pub wireless_humidity: Option<f32>,
    pub wireless_battery_voltage: Option<f32>,
    pub connection_lost: bool,
}

impl SystemState {
    /// Alarm conditions currently active.
    pub fn conditions(&self) -> AlarmConditions {
        let mut c = AlarmConditions::empty();
        c.set(AlarmConditions::SYSTEM_ALARM, self.system_alarm == Some(true));
        c.set(AlarmConditions::SENSOR_TAPE_LEAK, self.sensor_tape_leak == Some(true));
        c.set(AlarmConditions::WIRELESS_LEAK_1, self.wireless_leak[0] == Some(true));
        c.set(AlarmConditions::WIRELESS_LEAK_2, self.wireless_leak[1] == Some(true));
        c.set(AlarmConditions::VALVE_SYSTEM_DISCONNECTED, self.valve_system_disconnected);
        c.set(AlarmConditions::VALVE_1_DISCONNECTED, self.valves[0].is_disconnected());
        c.set(
            AlarmConditions::VALVE_2_DISCONNECTED,
            self.valves[1].is_disconnected() && self.valve_count.is_some_and(|n| n >= 2),
        );
        c.set(
            AlarmConditions::LOW_BATTERY,
            self.wireless_battery_voltage.is_some_and(is_low_battery),
        );
        c.set(AlarmConditions::CONNECTION_LOST, self.connection_lost);
        c
    }

    /// Whether any alarm (other than connection loss) is active.
    pub fn is_alarm_active(&self) -> bool {
        self.conditions().intersects(AlarmConditions::ALARMS)
    }

    pub fn hub_connected(&self) -> bool {
        !self.connection_lost
    }

    pub fn battery_percentage(&self) -> Option<u8> {
        self.wireless_battery_voltage.map(battery_percentage)
    }

    /// Status of valve `index` (1-based).
    pub fn valve(&self, index: u8) -> Option<ValveStatus> {
        self.valves.get((index as usize).wrapping_sub(1)).copied()
    }
}

/// Values obtained in one poll, keyed by point. Points not read are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReading {
    pub device_id: u32,
    pub values: BTreeMap<Point, PropertyValue>,
}

impl RawReading {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, point: Point, value: PropertyValue) {
        self.values.insert(point, value);
    }

    pub fn with(mut self, point: Point, value: PropertyValue) -> Self {
        self.insert(point, value);
        self
    }

    pub fn get(&self, point: Point) -> Option<&PropertyValue> {
        self.values.get(&point)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Merge a reading into `previous` and report the alarm edges it caused.
///
/// Points missing from `raw`, or whose value cannot be interpreted, keep their
/// previous value and cause no transition.
pub fn fold(previous: &SystemState, raw: &RawReading) -> (SystemState, Vec<AlarmTransition>) {
    let next = merge(previous.clone(), raw);
    let transitions =
        AlarmConditions::transitions(previous.conditions(), next.conditions(), raw.device_id);
    (next, transitions)
}

/// Fold onto a cleared snapshot, used for the first poll after the hub was
/// unreachable. Points missing from `raw` become unknown; conditions that
/// were active but are now unknown fall.
pub fn fold_fresh(previous: &SystemState, raw: &RawReading) -> (SystemState, Vec<AlarmTransition>) {
    let base = SystemState {
        connection_lost: previous.connection_lost,
        ..SystemState::default()
    };
    let next = merge(base, raw);
    let transitions =
        AlarmConditions::transitions(previous.conditions(), next.conditions(), raw.device_id);
    (next, transitions)
}

fn merge(mut state: SystemState, raw: &RawReading) -> SystemState {
    for (point, value) in &raw.values {
        if !apply(&mut state, *point, value) {
            debug!(
                "Device {}: ignoring {} value {:?}",
                raw.device_id,
                point.name(),
                value
            );
        }
    }
    state
}

/// Apply one value. Returns false when the value could not be interpreted.
fn apply(state: &mut SystemState, point: Point, value: &PropertyValue) -> bool {
    match point {
        Point::SystemAlarm => set(&mut state.system_alarm, leak_from_value(value)),
        Point::SensorTapeLeak => set(&mut state.sensor_tape_leak, leak_from_value(value)),
        Point::WirelessLeak1 => set(&mut state.wireless_leak[0], leak_from_value(value)),
        Point::WirelessLeak2 => set(&mut state.wireless_leak[1], leak_from_value(value)),
        Point::ValveCount => match value.as_u32() {
            Some(raw) => {
                let reading = decode_valve_count(raw);
                state.valve_count = Some(reading.count);
                state.valve_system_disconnected = reading.system_disconnected;
                true
            }
            None => false,
        },
        Point::ValveStatus1 | Point::ValveStatus2 => match value.as_u32() {
            Some(raw) => {
                let idx = if point == Point::ValveStatus1 { 0 } else { 1 };
                state.valves[idx] = ValveStatus::from_raw(raw);
                true
            }
            None => false,
        },
        Point::ValveControl => set(
            &mut state.valve_control,
            value.as_u32().map(ValveControlState::from_raw),
        ),
        Point::WirelessTemperature => set(
            &mut state.wireless_temperature,
            reading_in_range(value, TEMPERATURE_RANGE),
        ),
        Point::WirelessHumidity => set(
            &mut state.wireless_humidity,
            reading_in_range(value, HUMIDITY_RANGE),
        ),
        Point::WirelessBatteryVoltage => set(
            &mut state.wireless_battery_voltage,
            reading_in_range(value, BATTERY_VOLTAGE_RANGE),
        ),
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = Some(v);
            true
        }
        None => false,
    }
}
