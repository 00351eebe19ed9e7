// MIT License - Copyright (c) 2021 TJForc
// In-memory hub used by unit tests

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::codec::{
    ObjectId, PropertyValue, encode_application_value, encode_closing, encode_context_object_id,
    encode_context_unsigned, encode_opening,
};
use crate::constants::{Point, property};
use crate::error::{LinkboxError, Rejection, Result, error_class, error_code};
use crate::protocol::{Ack, ConfirmedRequest};
use crate::transport::Transport;

#[derive(Default)]
struct FakeHub {
    values: HashMap<(ObjectId, u32), PropertyValue>,
    rejections: HashMap<ObjectId, Rejection>,
    read_multiple_refused: bool,
    offline: bool,
    garbled: bool,
    closed: bool,
    writes: Vec<(ObjectId, PropertyValue)>,
    requests: Vec<ConfirmedRequest>,
}

/// Answers confirmed requests from a table of object values, the way a hub
/// would, without touching the network.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    hub: Mutex<FakeHub>,
    latency: Duration,
}

fn unknown_object() -> Rejection {
    Rejection::Error {
        class: error_class::OBJECT,
        code: error_code::UNKNOWN_OBJECT,
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn hub(&self) -> std::sync::MutexGuard<'_, FakeHub> {
        self.hub.lock().unwrap()
    }

    pub fn set(&self, point: Point, value: PropertyValue) {
        self.set_property(point.object().into(), property::PRESENT_VALUE, value);
    }

    pub fn set_property(&self, object: ObjectId, property: u32, value: PropertyValue) {
        self.hub().values.insert((object, property), value);
    }

    pub fn remove(&self, point: Point) {
        let key = (point.object().into(), property::PRESENT_VALUE);
        self.hub().values.remove(&key);
    }

    pub fn reject(&self, point: Point, rejection: Rejection) {
        self.hub().rejections.insert(point.object().into(), rejection);
    }

    pub fn refuse_read_multiple(&self) {
        self.hub().read_multiple_refused = true;
    }

    pub fn set_offline(&self, offline: bool) {
        self.hub().offline = offline;
    }

    /// Answer every request with a reply that cannot be decoded.
    pub fn garble_replies(&self, garbled: bool) {
        self.hub().garbled = garbled;
    }

    pub fn writes(&self) -> Vec<(ObjectId, PropertyValue)> {
        self.hub().writes.clone()
    }

    pub fn requests(&self) -> Vec<ConfirmedRequest> {
        self.hub().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.hub().requests.clear();
    }

    fn respond(&self, request: &ConfirmedRequest) -> Result<Ack> {
        let mut hub = self.hub();
        if hub.closed {
            return Err(LinkboxError::SessionClosed);
        }
        hub.requests.push(request.clone());
        if hub.offline {
            return Err(LinkboxError::Timeout {
                request: request.describe(),
            });
        }
        if hub.garbled {
            return Err(LinkboxError::Decode {
                details: format!("truncated reply to {}", request.describe()),
            });
        }

        match request {
            ConfirmedRequest::ReadProperty { object, property } => {
                let value = lookup(&hub, *object, *property).map_err(LinkboxError::Rejected)?;
                let mut body = Vec::new();
                encode_context_object_id(&mut body, 0, *object);
                encode_context_unsigned(&mut body, 1, *property);
                encode_opening(&mut body, 3);
                encode_application_value(&mut body, &value);
                encode_closing(&mut body, 3);
                Ok(Ack::Complex(body))
            }
            ConfirmedRequest::ReadPropertyMultiple(specs) => {
                if hub.read_multiple_refused {
                    return Err(LinkboxError::Rejected(Rejection::Reject { reason: 9 }));
                }
                let mut body = Vec::new();
                for spec in specs {
                    encode_context_object_id(&mut body, 0, spec.object);
                    encode_opening(&mut body, 1);
                    for property in &spec.properties {
                        encode_context_unsigned(&mut body, 2, *property);
                        match lookup(&hub, spec.object, *property) {
                            Ok(value) => {
                                encode_opening(&mut body, 4);
                                encode_application_value(&mut body, &value);
                                encode_closing(&mut body, 4);
                            }
                            Err(Rejection::Error { class, code }) => {
                                encode_opening(&mut body, 5);
                                encode_application_value(&mut body, &PropertyValue::Enumerated(class));
                                encode_application_value(&mut body, &PropertyValue::Enumerated(code));
                                encode_closing(&mut body, 5);
                            }
                            Err(other) => return Err(LinkboxError::Rejected(other)),
                        }
                    }
                    encode_closing(&mut body, 1);
                }
                Ok(Ack::Complex(body))
            }
            ConfirmedRequest::WriteProperty {
                object,
                property,
                value,
                ..
            } => {
                if let Some(rejection) = hub.rejections.get(object) {
                    return Err(LinkboxError::Rejected(*rejection));
                }
                hub.writes.push((*object, value.clone()));
                hub.values.insert((*object, *property), value.clone());
                Ok(Ack::Simple)
            }
        }
    }
}

fn lookup(hub: &FakeHub, object: ObjectId, property: u32) -> std::result::Result<PropertyValue, Rejection> {
    if let Some(rejection) = hub.rejections.get(&object) {
        return Err(*rejection);
    }
    hub.values
        .get(&(object, property))
        .cloned()
        .ok_or_else(unknown_object)
}

impl Transport for ScriptedTransport {
    async fn send_and_wait(&self, request: &ConfirmedRequest) -> Result<Ack> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.respond(request)
    }

    async fn close(&self) {
        self.hub().closed = true;
    }
}

/// A hub with every point populated and nothing wrong.
pub(crate) fn quiet_hub() -> ScriptedTransport {
    let t = ScriptedTransport::new();
    t.set(Point::SystemAlarm, PropertyValue::Real(0.0));
    t.set(Point::SensorTapeLeak, PropertyValue::Real(0.0));
    t.set(Point::ValveCount, PropertyValue::Unsigned(2));
    t.set(Point::ValveStatus1, PropertyValue::Unsigned(3));
    t.set(Point::ValveStatus2, PropertyValue::Unsigned(1));
    t.set(Point::ValveControl, PropertyValue::Unsigned(3));
    t.set(Point::WirelessLeak1, PropertyValue::Real(0.0));
    t.set(Point::WirelessLeak2, PropertyValue::Real(0.0));
    t.set(Point::WirelessTemperature, PropertyValue::Real(21.5));
    t.set(Point::WirelessHumidity, PropertyValue::Real(45.0));
    t.set(Point::WirelessBatteryVoltage, PropertyValue::Real(3.0));
    t
}
