// MIT License - Copyright (c) 2021 TJForc
// Motorised shut-off valves

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::constants::{
    VALVE_CONTROL_CLOSE, VALVE_CONTROL_OPEN, VALVE_COUNT_DISCONNECTED,
    VALVE_COUNT_ONE, VALVE_COUNT_TWO, VALVE_STATUS_CLOSED, VALVE_STATUS_DISCONNECTED,
    VALVE_STATUS_DISCONNECTED_ALT, VALVE_STATUS_OPEN,
};

/// Position of one valve as reported by its status object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveStatus {
    #[default]
    Unknown,
    Closed,
    Open,
    Disconnected,
}

impl ValveStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            VALVE_STATUS_CLOSED => Self::Closed,
            VALVE_STATUS_OPEN => Self::Open,
            VALVE_STATUS_DISCONNECTED | VALVE_STATUS_DISCONNECTED_ALT => Self::Disconnected,
            _ => Self::Unknown,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        *self == Self::Disconnected
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired valve position for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveCommand {
    Open,
    Close,
}

impl ValveCommand {
    /// Value written to the valve control object.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Open => VALVE_CONTROL_OPEN,
            Self::Close => VALVE_CONTROL_CLOSE,
        }
    }
}

impl FromStr for ValveCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "on" => Ok(Self::Open),
            "close" | "closed" | "off" => Ok(Self::Close),
            other => Err(format!("unknown valve state: {other}")),
        }
    }
}

/// Last value seen on the valve control object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveControlState {
    #[default]
    NotApplicable,
    Close,
    Open,
}

impl ValveControlState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            VALVE_CONTROL_OPEN => Self::Open,
            VALVE_CONTROL_CLOSE => Self::Close,
            _ => Self::NotApplicable,
        }
    }
}

/// Interpretation of the valve-count object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveCountReading {
    pub count: u32,
    /// The hub reports the valve bus itself as disconnected
    pub system_disconnected: bool,
}

/// Map the raw valve-count value to a number of valves.
///
/// The hub encodes one valve as 2 and two valves as 3; 319 means the valve
/// bus is disconnected. Other values are passed through unchanged.
pub fn decode_valve_count(raw: u32) -> ValveCountReading {
    match raw {
        VALVE_COUNT_ONE => ValveCountReading { count: 1, system_disconnected: false },
        VALVE_COUNT_TWO => ValveCountReading { count: 2, system_disconnected: false },
        VALVE_COUNT_DISCONNECTED => ValveCountReading { count: 0, system_disconnected: true },
        other => ValveCountReading { count: other, system_disconnected: false },
    }
}
