// MIT License - Copyright (c) 2021 TJForc
// Wireless sensor node (two leak points, climate, battery)

use serde::Serialize;

use crate::codec::PropertyValue;
use crate::constants::{
    BATTERY_EMPTY_PERCENT, BATTERY_EMPTY_VOLTS, BATTERY_FULL_VOLTS, BATTERY_VOLTAGE_RANGE,
    HUMIDITY_RANGE, LOW_BATTERY_VOLTS, Point, TEMPERATURE_RANGE,
};

/// Wet/dry from a leak point's present value. Values of 1 or more mean wet.
pub fn leak_from_value(value: &PropertyValue) -> Option<bool> {
    match value {
        PropertyValue::Boolean(b) => Some(*b),
        other => other.as_f64().map(|v| v >= 1.0),
    }
}

/// Numeric reading if it falls inside `range` (inclusive).
pub fn reading_in_range(value: &PropertyValue, range: (f32, f32)) -> Option<f32> {
    let v = value.as_f64()? as f32;
    (v.is_finite() && v >= range.0 && v <= range.1).then_some(v)
}

pub fn is_low_battery(volts: f32) -> bool {
    volts < LOW_BATTERY_VOLTS
}

/// Battery level in percent: 100 at 3.3 V or above, 15 at 2.2 V or below,
/// linear in between.
pub fn battery_percentage(volts: f32) -> u8 {
    if volts >= BATTERY_FULL_VOLTS {
        return 100;
    }
    if volts <= BATTERY_EMPTY_VOLTS {
        return BATTERY_EMPTY_PERCENT;
    }
    let span = BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS;
    let pct = BATTERY_EMPTY_PERCENT as f32
        + (volts - BATTERY_EMPTY_VOLTS) / span * (100.0 - BATTERY_EMPTY_PERCENT as f32);
    pct.round() as u8
}

/// Valid range of a wireless point's reading. Leak points have none.
pub fn valid_range(point: Point) -> Option<(f32, f32)> {
    match point {
        Point::WirelessTemperature => Some(TEMPERATURE_RANGE),
        Point::WirelessHumidity => Some(HUMIDITY_RANGE),
        Point::WirelessBatteryVoltage => Some(BATTERY_VOLTAGE_RANGE),
        _ => None,
    }
}

/// How one wireless point answered a connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointCheck {
    Ok { value: f32 },
    /// Answered with a value outside the point's valid range
    OutOfRange { value: f32 },
    /// The hub holds no value (node asleep, out of range or never paired)
    Missing,
    Failed { error: String },
}

impl PointCheck {
    /// Classify a value read from `point`.
    pub fn from_value(point: Point, value: &PropertyValue) -> Self {
        if let Some(range) = valid_range(point) {
            return match reading_in_range(value, range) {
                Some(v) => Self::Ok { value: v },
                None => match value.as_f64() {
                    Some(v) => Self::OutOfRange { value: v as f32 },
                    None => Self::Failed {
                        error: format!("non-numeric value {value}"),
                    },
                },
            };
        }
        match leak_from_value(value) {
            Some(wet) => Self::Ok {
                value: if wet { 1.0 } else { 0.0 },
            },
            None => Self::Failed {
                error: format!("non-numeric value {value}"),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReport {
    pub point: &'static str,
    pub object: String,
    pub check: PointCheck,
    /// Round trip of the read; `None` when no request was sent
    pub response_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Full,
    Partial,
    Unreachable,
}

/// Per-point result of reading every wireless point on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WirelessReport {
    pub connectivity: Connectivity,
    pub successful: usize,
    pub total: usize,
    pub points: Vec<PointReport>,
}

impl WirelessReport {
    pub fn new(points: Vec<PointReport>) -> Self {
        let successful = points.iter().filter(|p| p.check.is_ok()).count();
        let connectivity = match successful {
            0 => Connectivity::Unreachable,
            n if n == points.len() => Connectivity::Full,
            _ => Connectivity::Partial,
        };
        Self {
            connectivity,
            successful,
            total: points.len(),
            points,
        }
    }

    pub fn point(&self, point: Point) -> Option<&PointReport> {
        self.points.iter().find(|p| p.point == point.name())
    }
}
