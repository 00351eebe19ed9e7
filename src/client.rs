// MIT License - Copyright (c) 2021 TJForc
// Typed reads and writes against one hub

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{ObjectId, PropertyValue};
use crate::constants::{
    BATTERY_VOLTAGE_RANGE, HUMIDITY_RANGE, MAX_CONTROLLABLE_VALVES, MAX_POINTS_PER_REQUEST,
    MAX_VALVES, Point, RESET_ALARM_OBJECT, RESET_ALARM_VALUE, TEMPERATURE_RANGE, property,
};
use crate::devices::valve::{ValveCommand, ValveStatus};
use crate::devices::wireless::{
    PointCheck, PointReport, WirelessReport, leak_from_value, reading_in_range,
};
use crate::error::{LinkboxError, Rejection, Result};
use crate::protocol::{
    Ack, ConfirmedRequest, ReadAccessSpec, ReadOutcome, decode_read_property_ack,
    decode_read_property_multiple_ack,
};
use crate::state::RawReading;
use crate::transport::Transport;

/// Identity strings read from the hub's device object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub name: Option<String>,
    pub firmware_revision: Option<String>,
    pub application_version: Option<String>,
}

/// Builds requests for one hub and decodes what comes back.
///
/// Cheap to share: the transport is behind an `Arc` and the single-slot gate
/// lives in the transport, so a command and a poll from different tasks never
/// interleave on the wire.
pub struct DeviceClient<T: Transport> {
    transport: Arc<T>,
    device_id: u32,
    /// Cleared for good once the hub refuses ReadPropertyMultiple
    read_multiple: AtomicBool,
    last_rejection: RwLock<Option<Rejection>>,
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(transport: Arc<T>, device_id: u32) -> Self {
        Self {
            transport,
            device_id,
            read_multiple: AtomicBool::new(true),
            last_rejection: RwLock::new(None),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn supports_read_multiple(&self) -> bool {
        self.read_multiple.load(Ordering::Relaxed)
    }

    /// Most recent refusal from the hub, kept for diagnostics.
    pub async fn last_rejection(&self) -> Option<Rejection> {
        *self.last_rejection.read().await
    }

    async fn send(&self, request: &ConfirmedRequest) -> Result<Ack> {
        let result = self.transport.send_and_wait(request).await;
        if let Err(LinkboxError::Rejected(rejection)) = &result {
            *self.last_rejection.write().await = Some(*rejection);
        }
        result
    }

    /// Read every wired point, plus the wireless points when asked.
    ///
    /// Points the hub does not know about (a sleeping wireless node) are left
    /// out of the reading. The first request that times out after its
    /// retries aborts the whole snapshot.
    pub async fn read_system_snapshot(&self, include_wireless: bool) -> Result<RawReading> {
        let mut points: Vec<Point> = Point::WIRED.to_vec();
        if include_wireless {
            points.extend_from_slice(&Point::WIRELESS);
        }

        let mut reading = RawReading::new(self.device_id);
        if self.supports_read_multiple() {
            match self.read_points_multiple(&points, &mut reading).await {
                Ok(()) => return Ok(reading),
                Err(LinkboxError::Rejected(rejection)) if rejection.is_service_unsupported() => {
                    warn!(
                        "Hub {} refused ReadPropertyMultiple ({}), using single reads from now on",
                        self.device_id, rejection
                    );
                    self.read_multiple.store(false, Ordering::Relaxed);
                    reading = RawReading::new(self.device_id);
                }
                Err(e) => return Err(e),
            }
        }

        for point in points {
            if let Some(value) = self.read_point(point).await? {
                reading.insert(point, value);
            }
        }
        Ok(reading)
    }

    async fn read_points_multiple(&self, points: &[Point], reading: &mut RawReading) -> Result<()> {
        for chunk in points.chunks(MAX_POINTS_PER_REQUEST) {
            let specs = chunk
                .iter()
                .map(|p| ReadAccessSpec {
                    object: p.object().into(),
                    properties: vec![property::PRESENT_VALUE],
                })
                .collect();
            let body = match self.send(&ConfirmedRequest::ReadPropertyMultiple(specs)).await? {
                Ack::Complex(body) => body,
                Ack::Simple => {
                    return Err(LinkboxError::decode("read-multiple answered with simple ack"));
                }
            };

            for row in decode_read_property_multiple_ack(&body)? {
                let Some(point) = chunk.iter().copied().find(|p| ObjectId::from(p.object()) == row.object)
                else {
                    debug!("Hub {} returned unrequested object {}", self.device_id, row.object);
                    continue;
                };
                match row.outcome {
                    ReadOutcome::Value(value) => reading.insert(point, value),
                    ReadOutcome::Error(rejection) => self.note_point_error(point, rejection).await,
                    ReadOutcome::Malformed(details) => {
                        debug!("Hub {}: malformed {} value: {}", self.device_id, point.name(), details)
                    }
                }
            }
        }
        Ok(())
    }

    async fn note_point_error(&self, point: Point, rejection: Rejection) {
        if rejection.is_unknown_point() {
            debug!("Hub {}: {} not available", self.device_id, point.name());
        } else {
            warn!("Hub {}: reading {} refused: {}", self.device_id, point.name(), rejection);
            *self.last_rejection.write().await = Some(rejection);
        }
    }

    /// Present value of one point. `Ok(None)` when the hub has no such
    /// object or the reply cannot be decoded.
    pub async fn read_point(&self, point: Point) -> Result<Option<PropertyValue>> {
        let request = ConfirmedRequest::ReadProperty {
            object: point.object().into(),
            property: property::PRESENT_VALUE,
        };
        match self.transport.send_and_wait(&request).await {
            Ok(Ack::Complex(body)) => match decode_read_property_ack(&body) {
                Ok((_, _, value)) => Ok(Some(value)),
                Err(e) => {
                    debug!("Hub {}: malformed {} reply: {}", self.device_id, point.name(), e);
                    Ok(None)
                }
            },
            Ok(Ack::Simple) => Ok(None),
            Err(LinkboxError::Rejected(rejection)) => {
                self.note_point_error(point, rejection).await;
                Ok(None)
            }
            // the hub answered; only this reading is lost
            Err(e @ LinkboxError::Decode { .. }) => {
                debug!("Hub {}: {} reply unusable: {}", self.device_id, point.name(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_valve_status(&self, index: u8) -> Result<Option<ValveStatus>> {
        let point = match index {
            1 => Point::ValveStatus1,
            2 => Point::ValveStatus2,
            _ => {
                return Err(LinkboxError::InvalidValve { index, max: MAX_VALVES });
            }
        };
        Ok(self
            .read_point(point)
            .await?
            .and_then(|v| v.as_u32())
            .map(ValveStatus::from_raw))
    }

    /// Wet/dry state of a leak point.
    pub async fn read_leak(&self, point: Point) -> Result<Option<bool>> {
        Ok(self.read_point(point).await?.as_ref().and_then(leak_from_value))
    }

    pub async fn read_battery_voltage(&self) -> Result<Option<f32>> {
        self.read_ranged(Point::WirelessBatteryVoltage, BATTERY_VOLTAGE_RANGE).await
    }

    pub async fn read_temperature(&self) -> Result<Option<f32>> {
        self.read_ranged(Point::WirelessTemperature, TEMPERATURE_RANGE).await
    }

    pub async fn read_humidity(&self) -> Result<Option<f32>> {
        self.read_ranged(Point::WirelessHumidity, HUMIDITY_RANGE).await
    }

    async fn read_ranged(&self, point: Point, range: (f32, f32)) -> Result<Option<f32>> {
        Ok(self
            .read_point(point)
            .await?
            .as_ref()
            .and_then(|v| reading_in_range(v, range)))
    }

    /// Drive a valve open or closed. Waits for the hub's acknowledgement.
    pub async fn write_valve_command(&self, index: u8, command: ValveCommand) -> Result<()> {
        if index == 0 || index > MAX_CONTROLLABLE_VALVES {
            return Err(LinkboxError::InvalidValve {
                index,
                max: MAX_CONTROLLABLE_VALVES,
            });
        }
        info!("Hub {}: valve {} -> {:?}", self.device_id, index, command);
        self.write_present_value(
            Point::ValveControl.object().into(),
            PropertyValue::Unsigned(command.raw()),
        )
        .await
    }

    /// Clear a latched water alarm.
    pub async fn reset_alarm(&self) -> Result<()> {
        info!("Hub {}: resetting water alarm", self.device_id);
        self.write_present_value(
            RESET_ALARM_OBJECT.into(),
            PropertyValue::Unsigned(RESET_ALARM_VALUE),
        )
        .await
    }

    async fn write_present_value(&self, object: ObjectId, value: PropertyValue) -> Result<()> {
        let request = ConfirmedRequest::WriteProperty {
            object,
            property: property::PRESENT_VALUE,
            value,
            priority: None,
        };
        match self.send(&request).await? {
            Ack::Simple => Ok(()),
            Ack::Complex(_) => {
                debug!("Hub {} answered a write with a complex ack", self.device_id);
                Ok(())
            }
        }
    }

    /// Name, firmware and application version of the hub. Each is optional;
    /// only a timeout or socket fault is an error.
    pub async fn read_device_info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            device_id: self.device_id,
            name: self.read_device_string(property::OBJECT_NAME).await?,
            firmware_revision: self.read_device_string(property::FIRMWARE_REVISION).await?,
            application_version: self
                .read_device_string(property::APPLICATION_SOFTWARE_VERSION)
                .await?,
        })
    }

    async fn read_device_string(&self, prop: u32) -> Result<Option<String>> {
        let request = ConfirmedRequest::ReadProperty {
            object: ObjectId::device(self.device_id),
            property: prop,
        };
        match self.send(&request).await {
            Ok(Ack::Complex(body)) => Ok(decode_read_property_ack(&body)
                .ok()
                .map(|(_, _, value)| value.to_string())),
            Ok(Ack::Simple) | Err(LinkboxError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read each wireless point on its own and report how it answered.
    ///
    /// A timeout or socket error marks that point and every point after it
    /// as failed without sending further requests.
    pub async fn check_wireless(&self) -> WirelessReport {
        let mut rows = Vec::with_capacity(Point::WIRELESS.len());
        let mut link_error: Option<String> = None;

        for point in Point::WIRELESS {
            let object = ObjectId::from(point.object());
            if let Some(error) = link_error.clone() {
                rows.push(PointReport {
                    point: point.name(),
                    object: object.to_string(),
                    check: PointCheck::Failed { error },
                    response_ms: None,
                });
                continue;
            }

            let request = ConfirmedRequest::ReadProperty {
                object,
                property: property::PRESENT_VALUE,
            };
            let started = Instant::now();
            let check = match self.transport.send_and_wait(&request).await {
                Ok(Ack::Complex(body)) => match decode_read_property_ack(&body) {
                    Ok((_, _, value)) => PointCheck::from_value(point, &value),
                    Err(e) => PointCheck::Failed { error: e.to_string() },
                },
                Ok(Ack::Simple) => PointCheck::Missing,
                Err(LinkboxError::Rejected(rejection)) => {
                    self.note_point_error(point, rejection).await;
                    if rejection.is_unknown_point() {
                        PointCheck::Missing
                    } else {
                        PointCheck::Failed {
                            error: rejection.description(),
                        }
                    }
                }
                Err(e) => {
                    if !matches!(e, LinkboxError::Decode { .. }) {
                        link_error = Some(e.to_string());
                    }
                    PointCheck::Failed { error: e.to_string() }
                }
            };
            rows.push(PointReport {
                point: point.name(),
                object: object.to_string(),
                check,
                response_ms: Some(started.elapsed().as_millis() as u64),
            });
        }

        let report = WirelessReport::new(rows);
        info!(
            "Hub {}: wireless check {}/{} points answered",
            self.device_id, report.successful, report.total
        );
        report
    }

    /// Check that the hub answers for this device id.
    ///
    /// A hub that does not know the device object means the id is wrong.
    pub async fn test_connection(&self) -> Result<()> {
        let request = ConfirmedRequest::ReadProperty {
            object: ObjectId::device(self.device_id),
            property: property::OBJECT_NAME,
        };
        match self.send(&request).await {
            Ok(_) => Ok(()),
            Err(LinkboxError::Rejected(r)) if r.is_unknown_point() => {
                Err(LinkboxError::UnknownDevice(self.device_id))
            }
            // any other refusal still proves the hub is there
            Err(LinkboxError::Rejected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
