// MIT License - Copyright (c) 2021 TJForc
// Service surface over every configured hub

use tracing::info;

use crate::devices::alarm::AlarmKind;
use crate::devices::valve::ValveCommand;
use crate::error::{LinkboxError, Result};
use crate::hub::{Diagnostics, LinkboxHub};
use crate::notify::Notification;
use crate::transport::{Transport, UdpTransport};

/// The running hub sessions, addressed by device id.
///
/// Every service takes an optional device id; `None` means the first hub
/// that was configured.
pub struct HubRegistry<T: Transport = UdpTransport> {
    hubs: Vec<LinkboxHub<T>>,
}

impl<T: Transport> HubRegistry<T> {
    pub fn new(hubs: Vec<LinkboxHub<T>>) -> Self {
        Self { hubs }
    }

    /// Resolve a device id to its session.
    pub fn hub(&self, device_id: Option<u32>) -> Result<&LinkboxHub<T>> {
        match device_id {
            None => self
                .hubs
                .first()
                .ok_or_else(|| LinkboxError::InvalidConfig("no hubs configured".into())),
            Some(id) => self
                .hubs
                .iter()
                .find(|h| h.device_id() == id)
                .ok_or(LinkboxError::UnknownDevice(id)),
        }
    }

    pub fn hubs(&self) -> &[LinkboxHub<T>] {
        &self.hubs
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    pub async fn reset_alarm(&self, device_id: Option<u32>) -> Result<()> {
        self.hub(device_id)?.reset_alarm().await
    }

    pub async fn test_notification(
        &self,
        kind: AlarmKind,
        device_id: Option<u32>,
    ) -> Result<Vec<Notification>> {
        Ok(self.hub(device_id)?.test_notification(kind).await)
    }

    pub async fn set_valve(
        &self,
        device_id: Option<u32>,
        index: u8,
        command: ValveCommand,
    ) -> Result<()> {
        self.hub(device_id)?.set_valve(index, command).await
    }

    pub async fn diagnostics(&self, device_id: Option<u32>) -> Result<Diagnostics> {
        Ok(self.hub(device_id)?.diagnostics().await)
    }

    /// Disconnect every hub, in configuration order.
    pub async fn shutdown(&mut self) {
        info!("Shutting down {} hub session(s)", self.hubs.len());
        for hub in &mut self.hubs {
            hub.disconnect().await;
        }
        self.hubs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ObjectId, PropertyValue};
    use crate::config::HubConfig;
    use crate::constants::{Point, RESET_ALARM_OBJECT};
    use crate::testing::{ScriptedTransport, quiet_hub};

    fn registry() -> HubRegistry<ScriptedTransport> {
        let hubs = [11, 22]
            .into_iter()
            .map(|id| {
                let config = HubConfig::builder().host("127.0.0.1").device_id(id).build();
                LinkboxHub::with_transport(config, quiet_hub())
            })
            .collect();
        HubRegistry::new(hubs)
    }

    fn writes_on(registry: &HubRegistry<ScriptedTransport>, id: u32) -> Vec<(ObjectId, PropertyValue)> {
        registry.hub(Some(id)).unwrap().transport().writes()
    }

    #[tokio::test]
    async fn test_default_is_first_hub() {
        let r = registry();
        assert_eq!(r.hub(None).unwrap().device_id(), 11);
        assert_eq!(r.hub(Some(22)).unwrap().device_id(), 22);
        assert_eq!(r.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let r = registry();
        let err = r.reset_alarm(Some(99)).await.unwrap_err();
        assert!(matches!(err, LinkboxError::UnknownDevice(99)));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let r: HubRegistry<ScriptedTransport> = HubRegistry::new(Vec::new());
        assert!(r.is_empty());
        assert!(matches!(r.hub(None), Err(LinkboxError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_reset_alarm_targets_one_hub() {
        let r = registry();
        r.reset_alarm(Some(22)).await.unwrap();
        assert!(writes_on(&r, 11).is_empty());
        let writes = writes_on(&r, 22);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, ObjectId::from(RESET_ALARM_OBJECT));
    }

    #[tokio::test]
    async fn test_set_valve_defaults_to_first() {
        let r = registry();
        r.set_valve(None, 1, ValveCommand::Open).await.unwrap();
        let writes = writes_on(&r, 11);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, ObjectId::from(Point::ValveControl.object()));
        assert_eq!(writes[0].1, PropertyValue::Unsigned(3));
    }

    #[tokio::test]
    async fn test_notification_carries_device_id() {
        let r = registry();
        let sent = r.test_notification(AlarmKind::ValveAlarm, Some(22)).await.unwrap();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|n| n.device_id == 22 && n.is_test));
    }

    #[tokio::test]
    async fn test_diagnostics_by_id() {
        let r = registry();
        assert_eq!(r.diagnostics(Some(22)).await.unwrap().device_id, 22);
    }

    #[tokio::test]
    async fn test_shutdown_clears_sessions() {
        let mut r = registry();
        r.shutdown().await;
        assert!(r.is_empty());
    }
}
