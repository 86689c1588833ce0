// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// BGP message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,
}

/// An autonomous system number, either two or four octets wide. Four octet
/// ASNs are carried in the OPEN message via the capability mechanism of
/// RFC 6793.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum Asn {
    TwoOctet(u16),
    FourOctet(u32),
}

impl Asn {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::TwoOctet(a) => u32::from(*a),
            Self::FourOctet(a) => *a,
        }
    }
}

impl Display for Asn {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// This object contains the length and type fields. The marker is generated
/// by [`Header::to_wire`] and consumed by [`Header::from_wire`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Total length of the message, including the header. May be no larger
    /// than 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// Number of octets in the fixed message header.
pub const HEADER_LEN: u16 = 19;

/// Largest message permitted on the wire.
pub const MAX_MESSAGE_LEN: u16 = 4096;

/// According to RFC 4271 §4.1 the header marker is all ones.
const MARKER: [u8; 16] = [0xffu8; 16];

impl Header {
    /// Create a new BGP message header. Length must be between 19 and 4096
    /// per RFC 4271 §4.1.
    pub fn new(length: u16, typ: MessageType) -> Result<Header, Error> {
        if length < HEADER_LEN {
            return Err(Error::TooSmall("message header length".into()));
        }
        if length > MAX_MESSAGE_LEN {
            return Err(Error::TooLarge("message header length".into()));
        }
        Ok(Header { length, typ })
    }

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Deserialize a header from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < HEADER_LEN as usize {
            return Err(Error::TooSmall("message header".into()));
        }
        if buf[..16] != MARKER {
            return Err(Error::NoMarker);
        }

        let typ = match MessageType::try_from(buf[18]) {
            Ok(typ) => typ,
            Err(_) => return Err(Error::InvalidMessageType(buf[18])),
        };

        let length = u16::from_be_bytes([buf[16], buf[17]]);
        if length < HEADER_LEN {
            return Err(Error::TooSmall("message length field".into()));
        }
        if length > MAX_MESSAGE_LEN {
            return Err(Error::TooLarge("message length field".into()));
        }

        Ok(Header { length, typ })
    }
}

/// The ASN used in the OPEN message when 4-byte ASNs are in use.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4.
pub const BGP4: u8 = 4;

/// The first message sent by each side once a TCP connection is established.
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in use
    /// this value is set to AS_TRANS and the actual ASN is carried in a
    /// capability.
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// Create a new open message for a sender with a 2-byte ASN.
    pub fn new2(asn: u16, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters: Vec::new(),
        }
    }

    /// Create a new open message for a sender with a 4-byte ASN.
    pub fn new4(asn: u32, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn: AS_TRANS,
            hold_time,
            id,
            parameters: vec![Capability::FourOctetAs { asn }.into()],
        }
    }

    /// The effective ASN of the sender, taking the four-octet capability
    /// into account when present.
    pub fn effective_asn(&self) -> u32 {
        for p in &self.parameters {
            if let OptionalParameter::Capability(Capability::FourOctetAs {
                asn,
            }) = p
            {
                return *asn;
            }
        }
        u32::from(self.asn)
    }

    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![self.version];
        buf.extend_from_slice(&self.asn.to_be_bytes());
        buf.extend_from_slice(&self.hold_time.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());

        let mut opt_buf = Vec::new();
        for p in &self.parameters {
            opt_buf.extend_from_slice(&p.to_wire()?);
        }
        if opt_buf.len() > u8::MAX as usize {
            return Err(Error::TooLarge("optional parameters".into()));
        }
        buf.push(opt_buf.len() as u8);
        buf.extend_from_slice(&opt_buf);

        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<OpenMessage, Error> {
        if buf.len() < 10 {
            return Err(Error::TooSmall("open message".into()));
        }

        let version = buf[0];
        if version != BGP4 {
            return Err(Error::BadVersion);
        }

        let asn = u16::from_be_bytes([buf[1], buf[2]]);
        let hold_time = u16::from_be_bytes([buf[3], buf[4]]);
        let id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        let param_len = buf[9] as usize;
        if buf.len() < 10 + param_len {
            return Err(Error::TooSmall("open optional parameters".into()));
        }
        let parameters = Self::parameters_from_wire(&buf[10..10 + param_len])?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }

    fn parameters_from_wire(
        mut buf: &[u8],
    ) -> Result<Vec<OptionalParameter>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (param, n) = OptionalParameter::from_wire(buf)?;
            result.push(param);
            buf = &buf[n..];
        }
        Ok(result)
    }
}

/// Optional parameter types defined for the OPEN message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capability(Capability),
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum OptionalParameterCode {
    Reserved = 0,
    Authentication = 1,
    Capability = 2,
    ExtendedLength = 255,
}

impl From<Capability> for OptionalParameter {
    fn from(c: Capability) -> OptionalParameter {
        OptionalParameter::Capability(c)
    }
}

impl OptionalParameter {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Capability(c) => {
                let mut buf = vec![OptionalParameterCode::Capability as u8];
                let cbuf = c.to_wire();
                buf.push(cbuf.len() as u8);
                buf.extend_from_slice(&cbuf);
                Ok(buf)
            }
        }
    }

    /// Returns the parsed parameter and the total number of octets it
    /// occupies on the wire.
    pub fn from_wire(buf: &[u8]) -> Result<(OptionalParameter, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("optional parameter".into()));
        }
        let code = OptionalParameterCode::try_from(buf[0])?;
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(Error::TooSmall("optional parameter value".into()));
        }
        match code {
            OptionalParameterCode::Capability => {
                let cap = Capability::from_wire(&buf[2..2 + len])?;
                Ok((OptionalParameter::Capability(cap), 2 + len))
            }
            _ => Err(Error::Unsupported(format!(
                "optional parameter code {code:?}"
            ))),
        }
    }
}

/// Code for the four-octet AS capability.
///
/// Ref: RFC 6793
pub const CAPABILITY_FOUR_OCTET_AS: u8 = 65;

/// Capabilities advertised in OPEN optional parameters. Codes this
/// implementation does not act on are preserved as opaque values rather than
/// rejected, per RFC 5492 §4.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// Any capability we carry but do not interpret.
    Unknown { code: u8, data: Vec<u8> },
}

impl Capability {
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Self::FourOctetAs { asn } => {
                let mut buf = vec![CAPABILITY_FOUR_OCTET_AS, 4];
                buf.extend_from_slice(&asn.to_be_bytes());
                buf
            }
            Self::Unknown { code, data } => {
                let mut buf = vec![*code, data.len() as u8];
                buf.extend_from_slice(data);
                buf
            }
        }
    }

    pub fn from_wire(buf: &[u8]) -> Result<Capability, Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("capability".into()));
        }
        let code = buf[0];
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(Error::TooSmall("capability value".into()));
        }
        let value = &buf[2..2 + len];
        match code {
            CAPABILITY_FOUR_OCTET_AS => {
                if len != 4 {
                    return Err(Error::TooSmall("four octet as".into()));
                }
                Ok(Capability::FourOctetAs {
                    asn: u32::from_be_bytes([
                        value[0], value[1], value[2], value[3],
                    ]),
                })
            }
            _ => Ok(Capability::Unknown {
                code,
                data: value.to_vec(),
            }),
        }
    }
}

/// An address prefix as carried in UPDATE withdrawn-routes and NLRI fields:
/// a bit length followed by the minimum number of octets needed to hold
/// that many bits.
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Prefix {
    pub length: u8,
    pub value: Vec<u8>,
}

impl Prefix {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Returns the parsed prefix and the number of octets consumed.
    pub fn from_wire(buf: &[u8]) -> Result<(Prefix, usize), Error> {
        if buf.is_empty() {
            return Err(Error::TooSmall("prefix".into()));
        }
        let length = buf[0];
        let n = (usize::from(length) + 7) / 8;
        if buf.len() < 1 + n {
            return Err(Error::TooSmall("prefix value".into()));
        }
        Ok((
            Prefix {
                length,
                value: buf[1..1 + n].to_vec(),
            },
            1 + n,
        ))
    }
}

/// An update message advertises feasible routes and withdraws unfeasible
/// ones. The path attribute block is carried opaquely; attribute semantics
/// belong to the route processing layer above this crate.
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<u8>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut withdrawn = Vec::new();
        for w in &self.withdrawn {
            withdrawn.extend_from_slice(&w.to_wire());
        }
        let mut nlri = Vec::new();
        for n in &self.nlri {
            nlri.extend_from_slice(&n.to_wire());
        }

        if withdrawn.len() > u16::MAX as usize {
            return Err(Error::TooLarge("withdrawn routes".into()));
        }
        if self.path_attributes.len() > u16::MAX as usize {
            return Err(Error::TooLarge("path attributes".into()));
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
        buf.extend_from_slice(&withdrawn);
        buf.extend_from_slice(
            &(self.path_attributes.len() as u16).to_be_bytes(),
        );
        buf.extend_from_slice(&self.path_attributes);
        buf.extend_from_slice(&nlri);
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<UpdateMessage, Error> {
        if buf.len() < 4 {
            return Err(Error::TooSmall("update message".into()));
        }

        let withdrawn_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + withdrawn_len {
            return Err(Error::TooSmall("withdrawn routes".into()));
        }
        let withdrawn = Self::prefixes_from_wire(&buf[2..2 + withdrawn_len])?;
        let buf = &buf[2 + withdrawn_len..];

        if buf.len() < 2 {
            return Err(Error::TooSmall("path attribute length".into()));
        }
        let attrs_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + attrs_len {
            return Err(Error::TooSmall("path attributes".into()));
        }
        let path_attributes = buf[2..2 + attrs_len].to_vec();

        let nlri = Self::prefixes_from_wire(&buf[2 + attrs_len..])?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn prefixes_from_wire(mut buf: &[u8]) -> Result<Vec<Prefix>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (p, n) = Prefix::from_wire(buf)?;
            result.push(p);
            buf = &buf[n..];
        }
        Ok(result)
    }
}

/// Sent when an error condition is detected. The BGP connection is closed
/// immediately after this message is sent.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(error_code: ErrorCode, error_subcode: u8) -> Self {
        Self {
            error_code,
            error_subcode,
            data: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![self.error_code as u8, self.error_subcode];
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<NotificationMessage, Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("notification message".into()));
        }
        Ok(NotificationMessage {
            error_code: ErrorCode::try_from(buf[0])?,
            error_subcode: buf[1],
            data: buf[2..].to_vec(),
        })
    }

    /// Human readable rendering of the notification data field.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

impl Display for NotificationMessage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}({})/{}",
            self.error_code, self.error_code as u8, self.error_subcode
        )
    }
}

/// Top level notification error codes.
///
/// Ref: RFC 4271 §4.5
#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

/// Subcodes for [`ErrorCode::Header`].
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

/// Subcodes for [`ErrorCode::Open`].
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
}

/// Subcodes for [`ErrorCode::Update`].
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlags = 4,
    AttributeLength = 5,
    InvalidOriginAttribute = 6,
    InvalidNexthopAttribute = 8,
    OptionalAttribute = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// Context handed up with a message that failed to parse: the notification
/// code and subcode that describe the failure, and a description for the
/// logs.
#[derive(Debug, Clone)]
pub struct ParseErrorContext {
    pub error_code: ErrorCode,
    pub error_subcode: u8,
    pub detail: String,
}

impl ParseErrorContext {
    pub fn new(
        error_code: ErrorCode,
        error_subcode: u8,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            error_code,
            error_subcode,
            detail: detail.into(),
        }
    }
}

/// A fully parsed BGP message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Open(_) => MessageType::Open,
            Self::Update(_) => MessageType::Update,
            Self::Notification(_) => MessageType::Notification,
            Self::KeepAlive => MessageType::KeepAlive,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Update(_) => "update",
            Self::Notification(_) => "notification",
            Self::KeepAlive => "keepalive",
        }
    }

    /// Serialize the message including its header.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let body = match self {
            Self::Open(m) => m.to_wire()?,
            Self::Update(m) => m.to_wire()?,
            Self::Notification(m) => m.to_wire()?,
            Self::KeepAlive => Vec::new(),
        };
        let header =
            Header::new(HEADER_LEN + body.len() as u16, self.kind())?;
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize a message body according to a previously parsed header.
    pub fn from_wire(header: &Header, body: &[u8]) -> Result<Message, Error> {
        match header.typ {
            MessageType::Open => Ok(Message::Open(OpenMessage::from_wire(body)?)),
            MessageType::Update => {
                Ok(Message::Update(UpdateMessage::from_wire(body)?))
            }
            MessageType::Notification => Ok(Message::Notification(
                NotificationMessage::from_wire(body)?,
            )),
            MessageType::KeepAlive => Ok(Message::KeepAlive),
        }
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        Message::Update(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}
