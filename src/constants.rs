// MIT License - Copyright (c) 2021 TJForc
// Hub object map and BACnet/IP constants

use std::time::Duration;

/// Default BACnet/IP UDP port (0xBAC0).
pub const DEFAULT_PORT: u16 = 47808;

/// BVLC framing bytes.
pub const BVLC_TYPE: u8 = 0x81;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;

/// NPDU protocol version and control bits.
pub const NPDU_VERSION: u8 = 0x01;
pub const NPDU_NETWORK_MESSAGE: u8 = 0x80;
pub const NPDU_DEST_PRESENT: u8 = 0x20;
pub const NPDU_SOURCE_PRESENT: u8 = 0x08;
pub const NPDU_EXPECTING_REPLY: u8 = 0x04;

/// APDU types (upper nibble of the first APDU byte).
pub const PDU_CONFIRMED_REQUEST: u8 = 0x0;
pub const PDU_UNCONFIRMED_REQUEST: u8 = 0x1;
pub const PDU_SIMPLE_ACK: u8 = 0x2;
pub const PDU_COMPLEX_ACK: u8 = 0x3;
pub const PDU_SEGMENT_ACK: u8 = 0x4;
pub const PDU_ERROR: u8 = 0x5;
pub const PDU_REJECT: u8 = 0x6;
pub const PDU_ABORT: u8 = 0x7;

/// Max-segments / max-APDU octet advertised in confirmed requests
/// (no segmentation, 1476 octets).
pub const MAX_APDU_ACCEPTED: u8 = 0x05;

/// Confirmed service choices.
pub const SERVICE_READ_PROPERTY: u8 = 12;
pub const SERVICE_READ_PROPERTY_MULTIPLE: u8 = 14;
pub const SERVICE_WRITE_PROPERTY: u8 = 15;

/// Unconfirmed service choices.
pub const SERVICE_I_AM: u8 = 0;
pub const SERVICE_WHO_IS: u8 = 8;

/// Device instance that any device answers to in a ReadProperty request.
pub const WILDCARD_DEVICE_INSTANCE: u32 = 4_194_303;

/// Largest valid object instance (22 bits).
pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

/// Property identifiers used by the bridge.
pub mod property {
    pub const APPLICATION_SOFTWARE_VERSION: u32 = 12;
    pub const FIRMWARE_REVISION: u32 = 44;
    pub const OBJECT_IDENTIFIER: u32 = 75;
    pub const OBJECT_NAME: u32 = 77;
    pub const PRESENT_VALUE: u32 = 85;
}

/// BACnet object types the hub exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    Other(u16),
}

impl ObjectType {
    pub fn code(&self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Device => 8,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::MultiStateValue => 19,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            8 => Self::Device,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            19 => Self::MultiStateValue,
            other => Self::Other(other),
        }
    }
}

/// The named data points the bridge reads from a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Point {
    SystemAlarm,
    SensorTapeLeak,
    ValveCount,
    ValveStatus1,
    ValveStatus2,
    ValveControl,
    WirelessLeak1,
    WirelessLeak2,
    WirelessTemperature,
    WirelessHumidity,
    WirelessBatteryVoltage,
}

impl Point {
    /// Points that live on the hub itself.
    pub const WIRED: [Point; 6] = [
        Point::SystemAlarm,
        Point::SensorTapeLeak,
        Point::ValveCount,
        Point::ValveStatus1,
        Point::ValveStatus2,
        Point::ValveControl,
    ];

    /// Points reported by the wireless sensor node.
    pub const WIRELESS: [Point; 5] = [
        Point::WirelessLeak1,
        Point::WirelessLeak2,
        Point::WirelessTemperature,
        Point::WirelessHumidity,
        Point::WirelessBatteryVoltage,
    ];

    /// Object type and instance on the hub.
    pub fn object(&self) -> (ObjectType, u32) {
        match self {
            Self::SystemAlarm => (ObjectType::AnalogInput, 7),
            Self::SensorTapeLeak => (ObjectType::AnalogInput, 9),
            Self::ValveCount => (ObjectType::MultiStateInput, 3),
            Self::ValveStatus1 => (ObjectType::MultiStateInput, 5),
            Self::ValveStatus2 => (ObjectType::MultiStateInput, 6),
            Self::ValveControl => (ObjectType::MultiStateOutput, 1),
            Self::WirelessLeak1 => (ObjectType::AnalogInput, 11),
            Self::WirelessLeak2 => (ObjectType::AnalogInput, 12),
            Self::WirelessTemperature => (ObjectType::AnalogInput, 13),
            Self::WirelessHumidity => (ObjectType::AnalogInput, 14),
            Self::WirelessBatteryVoltage => (ObjectType::AnalogInput, 15),
        }
    }

    pub fn is_wireless(&self) -> bool {
        Self::WIRELESS.contains(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemAlarm => "water_alarm",
            Self::SensorTapeLeak => "sensor_tape_leak",
            Self::ValveCount => "num_valves",
            Self::ValveStatus1 => "valve_status_1",
            Self::ValveStatus2 => "valve_status_2",
            Self::ValveControl => "valve_control",
            Self::WirelessLeak1 => "wireless_leak_1",
            Self::WirelessLeak2 => "wireless_leak_2",
            Self::WirelessTemperature => "wireless_temperature",
            Self::WirelessHumidity => "wireless_humidity",
            Self::WirelessBatteryVoltage => "wireless_battery_voltage",
        }
    }
}

/// Multi-state output that clears a latched alarm, and the value that does it.
pub const RESET_ALARM_OBJECT: (ObjectType, u32) = (ObjectType::MultiStateOutput, 10);
pub const RESET_ALARM_VALUE: u32 = 2;

/// Valve-count object raw values.
pub const VALVE_COUNT_ONE: u32 = 2;
pub const VALVE_COUNT_TWO: u32 = 3;
pub const VALVE_COUNT_DISCONNECTED: u32 = 319;

/// Valve status raw values.
pub const VALVE_STATUS_UNKNOWN: u32 = 1;
pub const VALVE_STATUS_CLOSED: u32 = 2;
pub const VALVE_STATUS_OPEN: u32 = 3;
pub const VALVE_STATUS_DISCONNECTED: u32 = 4;
pub const VALVE_STATUS_DISCONNECTED_ALT: u32 = 1087;

/// Valve control values.
pub const VALVE_CONTROL_NA: u32 = 1;
pub const VALVE_CONTROL_CLOSE: u32 = 2;
pub const VALVE_CONTROL_OPEN: u32 = 3;

/// Number of valves the hub can report.
pub const MAX_VALVES: u8 = 2;
/// Number of valves that can be commanded (the hub's main valve control).
pub const MAX_CONTROLLABLE_VALVES: u8 = 1;

/// Wireless plausibility ranges.
pub const TEMPERATURE_RANGE: (f32, f32) = (-50.0, 100.0);
pub const HUMIDITY_RANGE: (f32, f32) = (0.0, 150.0);
pub const BATTERY_VOLTAGE_RANGE: (f32, f32) = (1.5, 4.0);

/// Battery voltage below which the low_battery alarm is raised.
pub const LOW_BATTERY_VOLTS: f32 = 2.5;
/// Battery percentage curve end points.
pub const BATTERY_FULL_VOLTS: f32 = 3.3;
pub const BATTERY_EMPTY_VOLTS: f32 = 2.2;
pub const BATTERY_EMPTY_PERCENT: u8 = 15;

/// Polling defaults and bounds (seconds).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 2;
pub const MIN_SCAN_INTERVAL_SECS: u64 = 1;
pub const MAX_SCAN_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_FAST_POLL_INTERVAL_SECS: u64 = 1;
pub const MIN_FAST_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_FAST_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WIRELESS_POLL_INTERVAL_SECS: u64 = 30;
/// Wireless points are read on every cycle until this many cycles have run.
pub const WIRELESS_WARMUP_CYCLES: u64 = 5;

/// Consecutive failed polls before connection_lost is raised.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Request defaults.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_REQUEST_RETRIES: u32 = 2;

/// Session start-up retries when the hub address cannot be resolved or bound.
pub const CONNECT_RETRIES: u32 = 3;
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// How long discovery listens for I-Am replies by default.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Points per ReadPropertyMultiple request.
pub const MAX_POINTS_PER_REQUEST: usize = 16;

/// Largest UDP datagram we expect from a hub.
pub const MAX_FRAME_LEN: usize = 1500;
