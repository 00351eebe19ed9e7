// MIT License - Copyright (c) 2021 TJForc
// Hub device model

pub mod alarm;
pub mod valve;
pub mod wireless;

pub use alarm::{AlarmConditions, AlarmKind, AlarmSource, AlarmTransition, Edge};
pub use valve::{ValveCommand, ValveControlState, ValveStatus};
pub use wireless::{Connectivity, PointCheck, PointReport, WirelessReport};
