// MIT License - Copyright (c) 2021 TJForc
// Events published by a hub session

use crate::devices::alarm::AlarmTransition;
use crate::notify::Notification;
use crate::state::SystemState;

/// All events that can be emitted by a hub session.
///
/// Users subscribe via `hub.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<HubEvent>`.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Session started; the first poll is under way
    Connected { device_id: u32 },
    /// Consecutive failed polls reached the threshold
    ConnectionLost { device_id: u32, failures: u32 },
    /// First successful poll after a connection loss
    ConnectionRestored { device_id: u32 },
    /// A poll completed and the state was updated
    StateUpdated { device_id: u32, state: SystemState },
    /// An alarm condition rose or fell
    Alarm(AlarmTransition),
    /// A notification for the host's sinks
    Notification(Notification),
    /// Session torn down
    Disconnected { device_id: u32 },
}

impl HubEvent {
    pub fn device_id(&self) -> u32 {
        match self {
            Self::Connected { device_id }
            | Self::ConnectionLost { device_id, .. }
            | Self::ConnectionRestored { device_id }
            | Self::StateUpdated { device_id, .. }
            | Self::Disconnected { device_id } => *device_id,
            Self::Alarm(t) => t.device_id,
            Self::Notification(n) => n.device_id,
        }
    }
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<HubEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<HubEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
