// MIT License - Copyright (c) 2021 TJForc
// BACnet/IP frame and tag codec

use std::fmt;

use crate::constants::{
    BVLC_FORWARDED_NPDU, BVLC_ORIGINAL_BROADCAST, BVLC_ORIGINAL_UNICAST, BVLC_TYPE,
    MAX_APDU_ACCEPTED, MAX_INSTANCE, NPDU_DEST_PRESENT, NPDU_EXPECTING_REPLY,
    NPDU_NETWORK_MESSAGE, NPDU_SOURCE_PRESENT, NPDU_VERSION, ObjectType, PDU_ABORT,
    PDU_COMPLEX_ACK, PDU_CONFIRMED_REQUEST, PDU_ERROR, PDU_REJECT, PDU_SEGMENT_ACK,
    PDU_SIMPLE_ACK, PDU_UNCONFIRMED_REQUEST,
};
use crate::error::{LinkboxError, Result};

/// A BACnet object identifier (type + 22-bit instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance: instance & MAX_INSTANCE,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    /// Packed wire form: `type << 22 | instance`.
    pub fn to_raw(&self) -> u32 {
        ((self.object_type.code() as u32) << 22) | (self.instance & MAX_INSTANCE)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_code((raw >> 22) as u16),
            instance: raw & MAX_INSTANCE,
        }
    }
}

impl From<(ObjectType, u32)> for ObjectId {
    fn from((object_type, instance): (ObjectType, u32)) -> Self {
        Self::new(object_type, instance)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.object_type, self.instance)
    }
}

/// A decoded application-tagged value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString { unused_bits: u8, bits: Vec<u8> },
    Enumerated(u32),
    Date([u8; 4]),
    Time([u8; 4]),
    ObjectId(ObjectId),
}

impl PropertyValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Unsigned(v) | Self::Enumerated(v) => Some(*v as f64),
            Self::Signed(v) => Some(*v as f64),
            Self::Real(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view, accepting whole-valued reals.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Unsigned(v) | Self::Enumerated(v) => Some(*v),
            Self::Signed(v) if *v >= 0 => Some(*v as u32),
            Self::Real(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u32),
            Self::Double(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::CharacterString(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Unsigned(v) | Self::Enumerated(v) => write!(f, "{v}"),
            Self::Signed(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::CharacterString(s) => f.write_str(s),
            Self::ObjectId(id) => write!(f, "{id}"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Primitive tag with content length (for application booleans: the value)
    Length(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub class: TagClass,
    pub kind: TagKind,
}

impl Tag {
    pub fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context
            && self.number == number
            && matches!(self.kind, TagKind::Length(_))
    }

    pub fn is_opening(&self, number: u8) -> bool {
        self.number == number && self.kind == TagKind::Opening
    }

    pub fn is_closing(&self, number: u8) -> bool {
        self.number == number && self.kind == TagKind::Closing
    }
}

/// Application tag numbers.
pub mod app_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

/// Write a tag header.
pub fn encode_tag(buf: &mut Vec<u8>, number: u8, class: TagClass, len: u32) {
    let class_bit = if class == TagClass::Context { 0x08 } else { 0x00 };
    let len_bits = if len <= 4 { len as u8 } else { 5 };
    if number <= 14 {
        buf.push((number << 4) | class_bit | len_bits);
    } else {
        buf.push(0xF0 | class_bit | len_bits);
        buf.push(number);
    }
    if len > 4 {
        if len <= 253 {
            buf.push(len as u8);
        } else if len <= 0xFFFF {
            buf.push(254);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(255);
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }
}

pub fn encode_opening(buf: &mut Vec<u8>, number: u8) {
    buf.push((number << 4) | 0x0E);
}

pub fn encode_closing(buf: &mut Vec<u8>, number: u8) {
    buf.push((number << 4) | 0x0F);
}

fn unsigned_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = match value {
        0..=0xFF => 3,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 1,
        _ => 0,
    };
    bytes[skip..].to_vec()
}

fn signed_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = match value {
        -0x80..=0x7F => 3,
        -0x8000..=0x7FFF => 2,
        -0x80_0000..=0x7F_FFFF => 1,
        _ => 0,
    };
    bytes[skip..].to_vec()
}

pub fn encode_context_unsigned(buf: &mut Vec<u8>, number: u8, value: u32) {
    let bytes = unsigned_bytes(value);
    encode_tag(buf, number, TagClass::Context, bytes.len() as u32);
    buf.extend_from_slice(&bytes);
}

pub fn encode_context_object_id(buf: &mut Vec<u8>, number: u8, id: ObjectId) {
    encode_tag(buf, number, TagClass::Context, 4);
    buf.extend_from_slice(&id.to_raw().to_be_bytes());
}

/// Write an application-tagged value.
pub fn encode_application_value(buf: &mut Vec<u8>, value: &PropertyValue) {
    let app = TagClass::Application;
    match value {
        PropertyValue::Null => encode_tag(buf, app_tag::NULL, app, 0),
        PropertyValue::Boolean(v) => encode_tag(buf, app_tag::BOOLEAN, app, *v as u32),
        PropertyValue::Unsigned(v) => {
            let bytes = unsigned_bytes(*v);
            encode_tag(buf, app_tag::UNSIGNED, app, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        PropertyValue::Signed(v) => {
            let bytes = signed_bytes(*v);
            encode_tag(buf, app_tag::SIGNED, app, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        PropertyValue::Real(v) => {
            encode_tag(buf, app_tag::REAL, app, 4);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::Double(v) => {
            encode_tag(buf, app_tag::DOUBLE, app, 8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::OctetString(bytes) => {
            encode_tag(buf, app_tag::OCTET_STRING, app, bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
        PropertyValue::CharacterString(s) => {
            encode_tag(buf, app_tag::CHARACTER_STRING, app, s.len() as u32 + 1);
            buf.push(0); // UTF-8
            buf.extend_from_slice(s.as_bytes());
        }
        PropertyValue::BitString { unused_bits, bits } => {
            encode_tag(buf, app_tag::BIT_STRING, app, bits.len() as u32 + 1);
            buf.push(*unused_bits);
            buf.extend_from_slice(bits);
        }
        PropertyValue::Enumerated(v) => {
            let bytes = unsigned_bytes(*v);
            encode_tag(buf, app_tag::ENUMERATED, app, bytes.len() as u32);
            buf.extend_from_slice(&bytes);
        }
        PropertyValue::Date(d) => {
            encode_tag(buf, app_tag::DATE, app, 4);
            buf.extend_from_slice(d);
        }
        PropertyValue::Time(t) => {
            encode_tag(buf, app_tag::TIME, app, 4);
            buf.extend_from_slice(t);
        }
        PropertyValue::ObjectId(id) => {
            encode_tag(buf, app_tag::OBJECT_ID, app, 4);
            buf.extend_from_slice(&id.to_raw().to_be_bytes());
        }
    }
}

/// Cursor over tagged APDU content.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                LinkboxError::decode(format!(
                    "truncated: wanted {n} bytes at offset {} of {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_tag(&mut self) -> Result<Tag> {
        let first = self.read_u8()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.read_u8()?;
        }
        let class = if first & 0x08 != 0 {
            TagClass::Context
        } else {
            TagClass::Application
        };
        let lvt = first & 0x07;
        let kind = match (class, lvt) {
            (TagClass::Context, 6) => TagKind::Opening,
            (TagClass::Context, 7) => TagKind::Closing,
            (_, 5) => {
                let ext = self.read_u8()?;
                let len = match ext {
                    254 => self.read_u16()? as u32,
                    255 => {
                        let b = self.take(4)?;
                        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                    }
                    n => n as u32,
                };
                TagKind::Length(len)
            }
            (_, n) => TagKind::Length(n as u32),
        };
        Ok(Tag { number, class, kind })
    }

    pub fn peek_tag(&self) -> Result<Tag> {
        self.clone().read_tag()
    }

    fn read_uint(&mut self, len: u32) -> Result<u32> {
        if !(1..=4).contains(&len) {
            return Err(LinkboxError::decode(format!("unsigned of length {len}")));
        }
        Ok(self
            .take(len as usize)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }

    fn read_sint(&mut self, len: u32) -> Result<i32> {
        if !(1..=4).contains(&len) {
            return Err(LinkboxError::decode(format!("signed of length {len}")));
        }
        let bytes = self.take(len as usize)?;
        let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
        let mut full = [fill; 4];
        full[4 - bytes.len()..].copy_from_slice(bytes);
        Ok(i32::from_be_bytes(full))
    }

    fn expect_context(&mut self, number: u8) -> Result<u32> {
        let tag = self.read_tag()?;
        match tag.kind {
            TagKind::Length(len) if tag.is_context(number) => Ok(len),
            _ => Err(LinkboxError::decode(format!(
                "expected context tag {number}, got {tag:?}"
            ))),
        }
    }

    pub fn expect_context_unsigned(&mut self, number: u8) -> Result<u32> {
        let len = self.expect_context(number)?;
        self.read_uint(len)
    }

    pub fn expect_context_object_id(&mut self, number: u8) -> Result<ObjectId> {
        let len = self.expect_context(number)?;
        if len != 4 {
            return Err(LinkboxError::decode(format!("object id of length {len}")));
        }
        Ok(ObjectId::from_raw(self.read_uint(4)?))
    }

    pub fn expect_opening(&mut self, number: u8) -> Result<()> {
        let tag = self.read_tag()?;
        if tag.is_opening(number) {
            Ok(())
        } else {
            Err(LinkboxError::decode(format!(
                "expected opening tag {number}, got {tag:?}"
            )))
        }
    }

    pub fn expect_closing(&mut self, number: u8) -> Result<()> {
        let tag = self.read_tag()?;
        if tag.is_closing(number) {
            Ok(())
        } else {
            Err(LinkboxError::decode(format!(
                "expected closing tag {number}, got {tag:?}"
            )))
        }
    }

    /// Whether the next tag is the given context tag (primitive).
    pub fn next_is_context(&self, number: u8) -> bool {
        self.peek_tag().is_ok_and(|t| t.is_context(number))
    }

    pub fn next_is_opening(&self, number: u8) -> bool {
        self.peek_tag().is_ok_and(|t| t.is_opening(number))
    }

    pub fn next_is_closing(&self, number: u8) -> bool {
        self.peek_tag().is_ok_and(|t| t.is_closing(number))
    }

    /// Read one application-tagged value.
    pub fn read_application_value(&mut self) -> Result<PropertyValue> {
        let tag = self.read_tag()?;
        let len = match (tag.class, tag.kind) {
            (TagClass::Application, TagKind::Length(len)) => len,
            _ => {
                return Err(LinkboxError::decode(format!(
                    "expected application tag, got {tag:?}"
                )));
            }
        };
        let value = match tag.number {
            app_tag::NULL => PropertyValue::Null,
            app_tag::BOOLEAN => PropertyValue::Boolean(len != 0),
            app_tag::UNSIGNED => PropertyValue::Unsigned(self.read_uint(len)?),
            app_tag::SIGNED => PropertyValue::Signed(self.read_sint(len)?),
            app_tag::REAL => {
                if len != 4 {
                    return Err(LinkboxError::decode(format!("real of length {len}")));
                }
                let b = self.take(4)?;
                PropertyValue::Real(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            app_tag::DOUBLE => {
                if len != 8 {
                    return Err(LinkboxError::decode(format!("double of length {len}")));
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(self.take(8)?);
                PropertyValue::Double(f64::from_be_bytes(b))
            }
            app_tag::OCTET_STRING => PropertyValue::OctetString(self.take(len as usize)?.to_vec()),
            app_tag::CHARACTER_STRING => {
                if len == 0 {
                    return Err(LinkboxError::decode("character string without charset"));
                }
                let bytes = self.take(len as usize)?;
                let text = match bytes[0] {
                    // ISO 8859-1
                    5 => bytes[1..].iter().map(|b| *b as char).collect(),
                    _ => String::from_utf8_lossy(&bytes[1..]).into_owned(),
                };
                PropertyValue::CharacterString(text)
            }
            app_tag::BIT_STRING => {
                if len == 0 {
                    return Err(LinkboxError::decode("empty bit string"));
                }
                let bytes = self.take(len as usize)?;
                PropertyValue::BitString {
                    unused_bits: bytes[0],
                    bits: bytes[1..].to_vec(),
                }
            }
            app_tag::ENUMERATED => PropertyValue::Enumerated(self.read_uint(len)?),
            app_tag::DATE | app_tag::TIME => {
                if len != 4 {
                    return Err(LinkboxError::decode(format!("date/time of length {len}")));
                }
                let mut b = [0u8; 4];
                b.copy_from_slice(self.take(4)?);
                if tag.number == app_tag::DATE {
                    PropertyValue::Date(b)
                } else {
                    PropertyValue::Time(b)
                }
            }
            app_tag::OBJECT_ID => {
                if len != 4 {
                    return Err(LinkboxError::decode(format!("object id of length {len}")));
                }
                PropertyValue::ObjectId(ObjectId::from_raw(self.read_uint(4)?))
            }
            other => {
                return Err(LinkboxError::decode(format!(
                    "reserved application tag {other}"
                )));
            }
        };
        Ok(value)
    }

    /// Skip everything up to and including the closing tag matching an
    /// already-consumed opening tag.
    pub fn skip_to_closing(&mut self, number: u8) -> Result<()> {
        let mut depth = 0usize;
        loop {
            let tag = self.read_tag()?;
            match tag.kind {
                TagKind::Opening => depth += 1,
                TagKind::Closing if depth == 0 && tag.number == number => return Ok(()),
                TagKind::Closing => depth = depth.saturating_sub(1),
                TagKind::Length(len) => {
                    // application booleans carry their value in the length field
                    let is_app_bool =
                        tag.class == TagClass::Application && tag.number == app_tag::BOOLEAN;
                    if !is_app_bool {
                        self.skip(len as usize)?;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A decoded application-layer PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest { invoke_id: u8, service: u8, body: Vec<u8> },
    UnconfirmedRequest { service: u8, body: Vec<u8> },
    SimpleAck { invoke_id: u8, service: u8 },
    ComplexAck { invoke_id: u8, service: u8, body: Vec<u8> },
    SegmentAck { invoke_id: u8 },
    Error { invoke_id: u8, service: u8, class: u32, code: u32 },
    Reject { invoke_id: u8, reason: u8 },
    Abort { invoke_id: u8, reason: u8 },
}

impl Apdu {
    /// Invoke id of a reply; `None` for unconfirmed traffic.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Self::ConfirmedRequest { .. } | Self::UnconfirmedRequest { .. } => None,
            Self::SimpleAck { invoke_id, .. }
            | Self::ComplexAck { invoke_id, .. }
            | Self::SegmentAck { invoke_id }
            | Self::Error { invoke_id, .. }
            | Self::Reject { invoke_id, .. }
            | Self::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }
}

fn wrap_bvlc(function: u8, npdu_apdu: &[u8]) -> Vec<u8> {
    let total = (4 + npdu_apdu.len()) as u16;
    let mut frame = Vec::with_capacity(total as usize);
    frame.push(BVLC_TYPE);
    frame.push(function);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(npdu_apdu);
    frame
}

/// Frame a confirmed request for unicast to the hub.
pub fn encode_confirmed(invoke_id: u8, service: u8, body: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + body.len());
    pdu.push(NPDU_VERSION);
    pdu.push(NPDU_EXPECTING_REPLY);
    pdu.push(PDU_CONFIRMED_REQUEST << 4);
    pdu.push(MAX_APDU_ACCEPTED);
    pdu.push(invoke_id);
    pdu.push(service);
    pdu.extend_from_slice(body);
    wrap_bvlc(BVLC_ORIGINAL_UNICAST, &pdu)
}

/// Frame an unconfirmed request as a global broadcast.
pub fn encode_unconfirmed_broadcast(service: u8, body: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(8 + body.len());
    pdu.push(NPDU_VERSION);
    pdu.push(NPDU_DEST_PRESENT);
    pdu.extend_from_slice(&[0xFF, 0xFF]); // DNET: global
    pdu.push(0x00); // DLEN: broadcast MAC
    pdu.push(0xFF); // hop count
    pdu.push(PDU_UNCONFIRMED_REQUEST << 4);
    pdu.push(service);
    pdu.extend_from_slice(body);
    wrap_bvlc(BVLC_ORIGINAL_BROADCAST, &pdu)
}

/// Decode one UDP datagram down to its APDU.
pub fn decode_frame(frame: &[u8]) -> Result<Apdu> {
    let mut r = Reader::new(frame);
    skip_link_headers(&mut r, frame)?;
    decode_apdu(&mut r)
}

/// Invoke id of a reply whose APDU is too damaged to decode, so the
/// waiting request can be failed instead of left to time out.
pub fn reply_invoke_id(frame: &[u8]) -> Option<u8> {
    let mut r = Reader::new(frame);
    skip_link_headers(&mut r, frame).ok()?;
    let apdu = r.remaining();
    match apdu.first()? >> 4 {
        PDU_SIMPLE_ACK | PDU_COMPLEX_ACK | PDU_SEGMENT_ACK | PDU_ERROR | PDU_REJECT | PDU_ABORT => {
            apdu.get(1).copied()
        }
        _ => None,
    }
}

/// Step over the BVLC and NPDU headers, leaving `r` at the APDU.
fn skip_link_headers(r: &mut Reader<'_>, frame: &[u8]) -> Result<()> {
    if r.read_u8()? != BVLC_TYPE {
        return Err(LinkboxError::decode("not a BACnet/IP frame"));
    }
    let function = r.read_u8()?;
    let length = r.read_u16()? as usize;
    if length != frame.len() {
        return Err(LinkboxError::decode(format!(
            "BVLC length {length} does not match datagram length {}",
            frame.len()
        )));
    }
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => {}
        BVLC_FORWARDED_NPDU => r.skip(6)?,
        other => {
            return Err(LinkboxError::decode(format!(
                "unsupported BVLC function 0x{other:02x}"
            )));
        }
    }

    if r.read_u8()? != NPDU_VERSION {
        return Err(LinkboxError::decode("unsupported NPDU version"));
    }
    let control = r.read_u8()?;
    if control & NPDU_DEST_PRESENT != 0 {
        r.skip(2)?;
        let dlen = r.read_u8()? as usize;
        r.skip(dlen)?;
    }
    if control & NPDU_SOURCE_PRESENT != 0 {
        r.skip(2)?;
        let slen = r.read_u8()? as usize;
        r.skip(slen)?;
    }
    if control & NPDU_DEST_PRESENT != 0 {
        r.skip(1)?; // hop count
    }
    if control & NPDU_NETWORK_MESSAGE != 0 {
        return Err(LinkboxError::decode("network layer message"));
    }
    Ok(())
}

fn decode_apdu(r: &mut Reader<'_>) -> Result<Apdu> {
    let first = r.read_u8()?;
    let apdu = match first >> 4 {
        PDU_CONFIRMED_REQUEST => {
            if first & 0x08 != 0 {
                return Err(LinkboxError::decode("segmented confirmed request"));
            }
            r.skip(1)?; // max segments / max APDU
            let invoke_id = r.read_u8()?;
            let service = r.read_u8()?;
            Apdu::ConfirmedRequest {
                invoke_id,
                service,
                body: r.remaining().to_vec(),
            }
        }
        PDU_UNCONFIRMED_REQUEST => {
            let service = r.read_u8()?;
            Apdu::UnconfirmedRequest {
                service,
                body: r.remaining().to_vec(),
            }
        }
        PDU_SIMPLE_ACK => {
            let invoke_id = r.read_u8()?;
            let service = r.read_u8()?;
            Apdu::SimpleAck { invoke_id, service }
        }
        PDU_COMPLEX_ACK => {
            let invoke_id = r.read_u8()?;
            if first & 0x08 != 0 {
                return Err(LinkboxError::decode(format!(
                    "segmented response to invoke id {invoke_id} not supported"
                )));
            }
            let service = r.read_u8()?;
            Apdu::ComplexAck {
                invoke_id,
                service,
                body: r.remaining().to_vec(),
            }
        }
        PDU_SEGMENT_ACK => {
            let invoke_id = r.read_u8()?;
            Apdu::SegmentAck { invoke_id }
        }
        PDU_ERROR => {
            let invoke_id = r.read_u8()?;
            let service = r.read_u8()?;
            // some services wrap the error in a constructed tag 0
            if r.next_is_opening(0) {
                r.expect_opening(0)?;
            }
            let class = expect_enumerated(r)?;
            let code = expect_enumerated(r)?;
            Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            }
        }
        PDU_REJECT => {
            let invoke_id = r.read_u8()?;
            let reason = r.read_u8()?;
            Apdu::Reject { invoke_id, reason }
        }
        PDU_ABORT => {
            let invoke_id = r.read_u8()?;
            let reason = r.read_u8()?;
            Apdu::Abort { invoke_id, reason }
        }
        other => {
            return Err(LinkboxError::decode(format!("unknown PDU type {other}")));
        }
    };
    Ok(apdu)
}

pub(crate) fn expect_enumerated(r: &mut Reader<'_>) -> Result<u32> {
    match r.read_application_value()? {
        PropertyValue::Enumerated(v) => Ok(v),
        other => Err(LinkboxError::decode(format!(
            "expected enumerated, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_packing() {
        let id = ObjectId::new(ObjectType::MultiStateOutput, 10);
        assert_eq!(id.to_raw(), 0x0380_000A);
        assert_eq!(ObjectId::from_raw(0x0380_000A), id);
        assert_eq!(ObjectId::device(4_194_303).to_raw(), 0x023F_FFFF);
    }

    #[test]
    fn test_tag_encoding_small_and_extended() {
        let mut buf = Vec::new();
        encode_context_unsigned(&mut buf, 1, 85);
        assert_eq!(buf, vec![0x19, 0x55]);

        let mut buf = Vec::new();
        encode_context_unsigned(&mut buf, 1, 1087);
        assert_eq!(buf, vec![0x1A, 0x04, 0x3F]);

        let mut buf = Vec::new();
        encode_tag(&mut buf, 7, TagClass::Application, 20);
        assert_eq!(buf, vec![0x75, 20]);

        let mut buf = Vec::new();
        encode_tag(&mut buf, 6, TagClass::Application, 300);
        assert_eq!(buf, vec![0x65, 254, 0x01, 0x2C]);

        let mut r = Reader::new(&buf);
        let tag = r.read_tag().unwrap();
        assert_eq!(tag.kind, TagKind::Length(300));
    }

    #[test]
    fn test_application_values_decode() {
        let mut buf = Vec::new();
        for v in [
            PropertyValue::Unsigned(1087),
            PropertyValue::Signed(-5),
            PropertyValue::Real(21.5),
            PropertyValue::Enumerated(1),
            PropertyValue::Boolean(true),
            PropertyValue::CharacterString("Linkbox".into()),
            PropertyValue::Null,
        ] {
            encode_application_value(&mut buf, &v);
        }
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Unsigned(1087));
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Signed(-5));
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Real(21.5));
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Enumerated(1));
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Boolean(true));
        assert_eq!(
            r.read_application_value().unwrap(),
            PropertyValue::CharacterString("Linkbox".into())
        );
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Null);
        assert!(r.is_empty());
    }

    #[test]
    fn test_wireless_leak_real_bytes() {
        // hub reports a wet wireless point as real 1.0 (3f 80 00 00)
        let bytes = [0x44, 0x3F, 0x80, 0x00, 0x00];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_application_value().unwrap(), PropertyValue::Real(1.0));
    }

    #[test]
    fn test_truncated_value() {
        let bytes = [0x44, 0x3F, 0x80];
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.read_application_value(),
            Err(LinkboxError::Decode { .. })
        ));
    }

    #[test]
    fn test_who_is_broadcast_frame() {
        let frame = encode_unconfirmed_broadcast(8, &[]);
        assert_eq!(
            frame,
            vec![0x81, 0x0B, 0x00, 0x0C, 0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08]
        );
    }

    #[test]
    fn test_confirmed_frame_header() {
        let frame = encode_confirmed(7, 12, &[0xAA]);
        assert_eq!(
            frame,
            vec![0x81, 0x0A, 0x00, 0x0B, 0x01, 0x04, 0x00, 0x05, 0x07, 0x0C, 0xAA]
        );
    }

    #[test]
    fn test_decode_simple_ack() {
        let frame = [0x81, 0x0A, 0x00, 0x09, 0x01, 0x00, 0x20, 0x03, 0x0F];
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Apdu::SimpleAck { invoke_id: 3, service: 15 }
        );
    }

    #[test]
    fn test_decode_error_pdu() {
        // error class object (1), code unknown-object (31)
        let frame = [
            0x81, 0x0A, 0x00, 0x0D, 0x01, 0x00, 0x50, 0x04, 0x0C, 0x91, 0x01, 0x91, 0x1F,
        ];
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Apdu::Error { invoke_id: 4, service: 12, class: 1, code: 31 }
        );
    }

    #[test]
    fn test_decode_npdu_with_source_specifier() {
        // control 0x08: SNET 0x0001, SLEN 1, SADR 0x05
        let frame = [
            0x81, 0x0A, 0x00, 0x0D, 0x01, 0x08, 0x00, 0x01, 0x01, 0x05, 0x60, 0x09, 0x09,
        ];
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Apdu::Reject { invoke_id: 9, reason: 9 }
        );
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let frame = [0x81, 0x0A, 0x00, 0x20, 0x01, 0x00, 0x20, 0x03, 0x0F];
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_invoke_id_of_damaged_reply() {
        // complex ack cut off before its service choice
        let truncated = [0x81, 0x0A, 0x00, 0x08, 0x01, 0x00, 0x30, 0x05];
        assert!(decode_frame(&truncated).is_err());
        assert_eq!(reply_invoke_id(&truncated), Some(5));

        // segmented complex ack
        let segmented = [0x81, 0x0A, 0x00, 0x0A, 0x01, 0x00, 0x38, 0x06, 0x00, 0x0C];
        assert!(decode_frame(&segmented).is_err());
        assert_eq!(reply_invoke_id(&segmented), Some(6));

        // requests and broken link headers carry no usable reply id
        assert_eq!(reply_invoke_id(&[0x81, 0x0B, 0x00, 0x08, 0x01, 0x00, 0x10, 0x08]), None);
        assert_eq!(reply_invoke_id(&[0x81, 0x0A, 0x00, 0x20, 0x01, 0x00, 0x30, 0x05]), None);
    }

    #[test]
    fn test_decode_rejects_network_message() {
        let frame = [0x81, 0x0A, 0x00, 0x07, 0x01, 0x80, 0x00];
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_skip_to_closing_nested() {
        let mut buf = Vec::new();
        encode_opening(&mut buf, 3);
        encode_opening(&mut buf, 0);
        encode_application_value(&mut buf, &PropertyValue::Boolean(true));
        encode_application_value(&mut buf, &PropertyValue::Real(2.0));
        encode_closing(&mut buf, 0);
        encode_closing(&mut buf, 3);
        buf.push(0x99);
        let mut r = Reader::new(&buf);
        r.expect_opening(3).unwrap();
        r.skip_to_closing(3).unwrap();
        assert_eq!(r.remaining(), &[0x99]);
    }
}
