// MIT License - Copyright (c) 2021 TJForc
// BACnet services used to talk to a Linkbox hub

use crate::codec::{
    self, ObjectId, PropertyValue, Reader, encode_application_value, encode_closing,
    encode_context_object_id, encode_context_unsigned, encode_opening,
};
use crate::constants::{
    SERVICE_I_AM, SERVICE_READ_PROPERTY, SERVICE_READ_PROPERTY_MULTIPLE, SERVICE_WHO_IS,
    SERVICE_WRITE_PROPERTY,
};
use crate::error::{LinkboxError, Rejection, Result};

/// One object and the properties to read from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessSpec {
    pub object: ObjectId,
    pub properties: Vec<u32>,
}

/// Confirmed requests the bridge sends to a hub.
///
/// # Exchange
///
/// Every request is framed as a BACnet/IP original-unicast with an invoke id
/// chosen by the session. The hub replies with a ComplexACK (reads), a
/// SimpleACK (writes), or one of Error / Reject / Abort.
///
/// ```text
/// 81 0a LL LL | 01 04 | 00 05 <invoke> <service> | <service body>
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmedRequest {
    /// ReadProperty (12): one property of one object.
    ReadProperty { object: ObjectId, property: u32 },
    /// ReadPropertyMultiple (14): several properties in one exchange.
    ReadPropertyMultiple(Vec<ReadAccessSpec>),
    /// WriteProperty (15). Priority is omitted when `None`.
    WriteProperty {
        object: ObjectId,
        property: u32,
        value: PropertyValue,
        priority: Option<u8>,
    },
}

impl ConfirmedRequest {
    pub fn service(&self) -> u8 {
        match self {
            Self::ReadProperty { .. } => SERVICE_READ_PROPERTY,
            Self::ReadPropertyMultiple(_) => SERVICE_READ_PROPERTY_MULTIPLE,
            Self::WriteProperty { .. } => SERVICE_WRITE_PROPERTY,
        }
    }

    /// Service body (everything after the service choice octet).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::ReadProperty { object, property } => {
                encode_context_object_id(&mut buf, 0, *object);
                encode_context_unsigned(&mut buf, 1, *property);
            }
            Self::ReadPropertyMultiple(specs) => {
                for spec in specs {
                    encode_context_object_id(&mut buf, 0, spec.object);
                    encode_opening(&mut buf, 1);
                    for property in &spec.properties {
                        encode_context_unsigned(&mut buf, 0, *property);
                    }
                    encode_closing(&mut buf, 1);
                }
            }
            Self::WriteProperty {
                object,
                property,
                value,
                priority,
            } => {
                encode_context_object_id(&mut buf, 0, *object);
                encode_context_unsigned(&mut buf, 1, *property);
                encode_opening(&mut buf, 3);
                encode_application_value(&mut buf, value);
                encode_closing(&mut buf, 3);
                if let Some(p) = priority {
                    encode_context_unsigned(&mut buf, 4, *p as u32);
                }
            }
        }
        buf
    }

    /// Full BACnet/IP frame for this request.
    pub fn encode(&self, invoke_id: u8) -> Vec<u8> {
        codec::encode_confirmed(invoke_id, self.service(), &self.encode_body())
    }

    /// Short label for logs and timeout errors.
    pub fn describe(&self) -> String {
        match self {
            Self::ReadProperty { object, property } => {
                format!("ReadProperty {object} prop {property}")
            }
            Self::ReadPropertyMultiple(specs) => {
                format!("ReadPropertyMultiple ({} objects)", specs.len())
            }
            Self::WriteProperty {
                object,
                property,
                value,
                ..
            } => format!("WriteProperty {object} prop {property} = {value}"),
        }
    }
}

/// Positive reply to a confirmed request.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Simple,
    Complex(Vec<u8>),
}

/// Outcome for one property inside a read-multiple result.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Value(PropertyValue),
    Error(Rejection),
    Malformed(String),
}

/// One row of a read-multiple result.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyReading {
    pub object: ObjectId,
    pub property: u32,
    pub outcome: ReadOutcome,
}

/// Decode a ReadProperty-ACK into the first value it carries.
pub fn decode_read_property_ack(body: &[u8]) -> Result<(ObjectId, u32, PropertyValue)> {
    let mut r = Reader::new(body);
    let object = r.expect_context_object_id(0)?;
    let property = r.expect_context_unsigned(1)?;
    if r.next_is_context(2) {
        r.expect_context_unsigned(2)?;
    }
    r.expect_opening(3)?;
    let value = r.read_application_value()?;
    r.skip_to_closing(3)?;
    Ok((object, property, value))
}

/// Decode a ReadPropertyMultiple-ACK into per-property outcomes.
pub fn decode_read_property_multiple_ack(body: &[u8]) -> Result<Vec<PropertyReading>> {
    let mut r = Reader::new(body);
    let mut readings = Vec::new();

    while !r.is_empty() {
        let object = r.expect_context_object_id(0)?;
        r.expect_opening(1)?;
        while !r.next_is_closing(1) {
            let property = r.expect_context_unsigned(2)?;
            if r.next_is_context(3) {
                r.expect_context_unsigned(3)?;
            }
            let outcome = if r.next_is_opening(4) {
                r.expect_opening(4)?;
                let checkpoint = r.clone();
                match r.read_application_value() {
                    Ok(value) => {
                        r.skip_to_closing(4)?;
                        ReadOutcome::Value(value)
                    }
                    Err(e) => {
                        r = checkpoint;
                        r.skip_to_closing(4)?;
                        ReadOutcome::Malformed(e.to_string())
                    }
                }
            } else {
                r.expect_opening(5)?;
                let class = codec::expect_enumerated(&mut r)?;
                let code = codec::expect_enumerated(&mut r)?;
                r.expect_closing(5)?;
                ReadOutcome::Error(Rejection::Error { class, code })
            };
            readings.push(PropertyReading {
                object,
                property,
                outcome,
            });
        }
        r.expect_closing(1)?;
    }

    Ok(readings)
}

/// Who-Is frame, optionally limited to a device instance range.
pub fn encode_who_is(range: Option<(u32, u32)>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some((low, high)) = range {
        encode_context_unsigned(&mut body, 0, low);
        encode_context_unsigned(&mut body, 1, high);
    }
    codec::encode_unconfirmed_broadcast(SERVICE_WHO_IS, &body)
}

/// Decoded I-Am announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAm {
    pub device_id: u32,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

/// Decode an unconfirmed I-Am body.
pub fn decode_i_am(service: u8, body: &[u8]) -> Result<IAm> {
    if service != SERVICE_I_AM {
        return Err(LinkboxError::decode(format!(
            "unconfirmed service {service} is not I-Am"
        )));
    }
    let mut r = Reader::new(body);
    let device_id = match r.read_application_value()? {
        PropertyValue::ObjectId(id) if id.object_type == crate::constants::ObjectType::Device => {
            id.instance
        }
        other => {
            return Err(LinkboxError::decode(format!(
                "I-Am without device identifier: {other:?}"
            )));
        }
    };
    let max_apdu = r.read_application_value()?.as_u32().unwrap_or(0);
    let segmentation = r.read_application_value()?.as_u32().unwrap_or(0);
    let vendor_id = r.read_application_value()?.as_u32().unwrap_or(0);
    Ok(IAm {
        device_id,
        max_apdu,
        segmentation,
        vendor_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Apdu, decode_frame, encode_tag, TagClass};
    use crate::constants::{ObjectType, WILDCARD_DEVICE_INSTANCE, property};

    #[test]
    fn test_read_property_wildcard_frame() {
        let req = ConfirmedRequest::ReadProperty {
            object: ObjectId::device(WILDCARD_DEVICE_INSTANCE),
            property: property::OBJECT_NAME,
        };
        assert_eq!(
            req.encode(1),
            vec![
                0x81, 0x0A, 0x00, 0x11, 0x01, 0x04, 0x00, 0x05, 0x01, 0x0C, 0x0C, 0x02, 0x3F,
                0xFF, 0xFF, 0x19, 0x4D
            ]
        );
    }

    #[test]
    fn test_write_reset_alarm_frame() {
        let req = ConfirmedRequest::WriteProperty {
            object: ObjectId::new(ObjectType::MultiStateOutput, 10),
            property: property::PRESENT_VALUE,
            value: PropertyValue::Unsigned(2),
            priority: None,
        };
        assert_eq!(
            req.encode(0x22),
            vec![
                0x81, 0x0A, 0x00, 0x15, 0x01, 0x04, 0x00, 0x05, 0x22, 0x0F, 0x0C, 0x03, 0x80,
                0x00, 0x0A, 0x19, 0x55, 0x3E, 0x21, 0x02, 0x3F
            ]
        );
    }

    #[test]
    fn test_write_with_priority() {
        let req = ConfirmedRequest::WriteProperty {
            object: ObjectId::new(ObjectType::MultiStateOutput, 1),
            property: property::PRESENT_VALUE,
            value: PropertyValue::Unsigned(3),
            priority: Some(8),
        };
        let body = req.encode_body();
        assert_eq!(&body[body.len() - 2..], &[0x49, 0x08]);
    }

    #[test]
    fn test_rpm_request_body() {
        let req = ConfirmedRequest::ReadPropertyMultiple(vec![ReadAccessSpec {
            object: ObjectId::new(ObjectType::AnalogInput, 7),
            properties: vec![property::PRESENT_VALUE],
        }]);
        assert_eq!(
            req.encode_body(),
            vec![0x0C, 0x00, 0x00, 0x00, 0x07, 0x1E, 0x09, 0x55, 0x1F]
        );
    }

    #[test]
    fn test_decode_read_property_ack() {
        // AI 13 present-value = 21.5
        let mut body = vec![0x0C, 0x00, 0x00, 0x00, 0x0D, 0x19, 0x55, 0x3E];
        encode_application_value(&mut body, &PropertyValue::Real(21.5));
        body.push(0x3F);
        let (object, property, value) = decode_read_property_ack(&body).unwrap();
        assert_eq!(object, ObjectId::new(ObjectType::AnalogInput, 13));
        assert_eq!(property, 85);
        assert_eq!(value, PropertyValue::Real(21.5));
    }

    #[test]
    fn test_decode_rpm_ack_with_error_row() {
        let mut body = Vec::new();
        // MSI 5: present-value = 3
        encode_context_object_id(&mut body, 0, ObjectId::new(ObjectType::MultiStateInput, 5));
        encode_opening(&mut body, 1);
        encode_context_unsigned(&mut body, 2, 85);
        encode_opening(&mut body, 4);
        encode_application_value(&mut body, &PropertyValue::Unsigned(3));
        encode_closing(&mut body, 4);
        encode_closing(&mut body, 1);
        // AI 11: unknown-object
        encode_context_object_id(&mut body, 0, ObjectId::new(ObjectType::AnalogInput, 11));
        encode_opening(&mut body, 1);
        encode_context_unsigned(&mut body, 2, 85);
        encode_opening(&mut body, 5);
        encode_application_value(&mut body, &PropertyValue::Enumerated(1));
        encode_application_value(&mut body, &PropertyValue::Enumerated(31));
        encode_closing(&mut body, 5);
        encode_closing(&mut body, 1);

        let rows = decode_read_property_multiple_ack(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].outcome, ReadOutcome::Value(PropertyValue::Unsigned(3)));
        assert_eq!(
            rows[1].outcome,
            ReadOutcome::Error(Rejection::Error { class: 1, code: 31 })
        );
    }

    #[test]
    fn test_decode_rpm_ack_malformed_value_is_isolated() {
        let mut body = Vec::new();
        encode_context_object_id(&mut body, 0, ObjectId::new(ObjectType::AnalogInput, 13));
        encode_opening(&mut body, 1);
        encode_context_unsigned(&mut body, 2, 85);
        encode_opening(&mut body, 4);
        // real with a bogus 2-byte length
        encode_tag(&mut body, 4, TagClass::Application, 2);
        body.extend_from_slice(&[0x41, 0xAC]);
        encode_closing(&mut body, 4);
        encode_context_unsigned(&mut body, 2, 77);
        encode_opening(&mut body, 4);
        encode_application_value(&mut body, &PropertyValue::CharacterString("T".into()));
        encode_closing(&mut body, 4);
        encode_closing(&mut body, 1);

        let rows = decode_read_property_multiple_ack(&body).unwrap();
        assert!(matches!(rows[0].outcome, ReadOutcome::Malformed(_)));
        assert_eq!(
            rows[1].outcome,
            ReadOutcome::Value(PropertyValue::CharacterString("T".into()))
        );
    }

    #[test]
    fn test_who_is_and_i_am() {
        assert_eq!(
            encode_who_is(None),
            vec![0x81, 0x0B, 0x00, 0x0C, 0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08]
        );

        // I-Am from device 2229704, max APDU 1476, no segmentation, vendor 260
        let frame = [
            0x81, 0x0B, 0x00, 0x15, 0x01, 0x00, 0x10, 0x00, 0xC4, 0x02, 0x22, 0x05, 0xC8, 0x22,
            0x05, 0xC4, 0x91, 0x03, 0x22, 0x01, 0x04,
        ];
        match decode_frame(&frame).unwrap() {
            Apdu::UnconfirmedRequest { service, body } => {
                let i_am = decode_i_am(service, &body).unwrap();
                assert_eq!(i_am.device_id, 2_229_704);
                assert_eq!(i_am.max_apdu, 1476);
                assert_eq!(i_am.segmentation, 3);
                assert_eq!(i_am.vendor_id, 260);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
