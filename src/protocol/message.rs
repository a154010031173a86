use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Size of the common header that prefixes every message.
pub const COMMON_HEADER_LENGTH: usize = 4;
/// The only protocol version this engine speaks.
pub const PCEP_VERSION: u8 = 1;
/// Largest message the 16 bit length field can describe.
pub const MAX_MESSAGE_LENGTH: usize = u16::MAX as usize;

/// Message types carried in the common header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Keepalive = 2,
    Request = 3,
    Response = 4,
    Notification = 5,
    Error = 6,
    Close = 7,
}

impl MessageType {
    pub fn from_u8(value: u8) -> AppResult<Self> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Keepalive),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Response),
            5 => Ok(MessageType::Notification),
            6 => Ok(MessageType::Error),
            7 => Ok(MessageType::Close),
            invalid => Err(AppError::MalformedMessage(format!(
                "message type:{} is invalid",
                invalid
            ))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Open => "OPEN",
            MessageType::Keepalive => "KEEPALIVE",
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Error => "ERROR",
            MessageType::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// The fixed four byte prefix of every message.
///
/// ```text
///  0                   1                   2                   3
/// | Ver |  Flags  |  Message-Type |        Message-Length         |
/// ```
/// The length counts the whole message, header included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u8,
    pub flags: u8,
    pub message_type: u8,
    pub length: u16,
}

impl CommonHeader {
    /// Inspects the prefix of `buf` without consuming anything.
    ///
    /// Returns `None` while fewer than [`COMMON_HEADER_LENGTH`] bytes are available.
    pub fn decode(buf: &[u8]) -> Option<CommonHeader> {
        if buf.len() < COMMON_HEADER_LENGTH {
            return None;
        }
        Some(CommonHeader {
            version: buf[0] >> 5,
            flags: buf[0] & 0x1f,
            message_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8((self.version << 5) | (self.flags & 0x1f));
        buf.put_u8(self.message_type);
        buf.put_u16(self.length);
    }
}

/// One framed message: header fields plus the opaque object body.
#[derive(Clone, PartialEq, Eq)]
pub struct PcepMessage {
    version: u8,
    flags: u8,
    message_type: u8,
    body: Bytes,
}

impl PcepMessage {
    /// Builds an outgoing message. The body must fit the 16 bit length field,
    /// use [`PcepMessage::try_new`] for bodies coming from collaborators.
    pub fn new(message_type: MessageType, body: Bytes) -> Self {
        PcepMessage {
            version: PCEP_VERSION,
            flags: 0,
            message_type: message_type.as_u8(),
            body,
        }
    }

    pub fn try_new(message_type: MessageType, body: Bytes) -> AppResult<Self> {
        if body.len() + COMMON_HEADER_LENGTH > MAX_MESSAGE_LENGTH {
            return Err(AppError::MessageTooLarge(format!(
                "{} body of {} bytes",
                message_type,
                body.len()
            )));
        }
        Ok(PcepMessage::new(message_type, body))
    }

    /// Rebuilds a received message from its header and body.
    pub(crate) fn from_parts(header: CommonHeader, body: Bytes) -> Self {
        PcepMessage {
            version: header.version,
            flags: header.flags,
            message_type: header.message_type,
            body,
        }
    }

    /// The decoded message type, or an error for codes outside 1..=7.
    pub fn message_type(&self) -> AppResult<MessageType> {
        MessageType::from_u8(self.message_type)
    }

    pub fn type_code(&self) -> u8 {
        self.message_type
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn encoded_len(&self) -> usize {
        COMMON_HEADER_LENGTH + self.body.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        CommonHeader {
            version: self.version,
            flags: self.flags,
            message_type: self.message_type,
            length: self.encoded_len() as u16,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

impl fmt::Debug for PcepMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("PcepMessage");
        match self.message_type() {
            Ok(message_type) => out.field("type", &message_type),
            Err(_) => out.field("type", &self.message_type),
        };
        out.field("version", &self.version)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let message = PcepMessage::new(MessageType::Keepalive, Bytes::new());
        let encoded = message.encode();
        assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x04]);

        let header = CommonHeader::decode(&encoded).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.flags, 0);
        assert_eq!(header.message_type, 2);
        assert_eq!(header.length, 4);
    }

    #[test]
    fn decode_needs_full_header() {
        assert_eq!(CommonHeader::decode(&[0x20, 0x01, 0x00]), None);
    }

    #[test]
    fn decode_does_not_consume() {
        let bytes = PcepMessage::new(MessageType::Request, Bytes::from_static(b"abcd")).encode();
        let first = CommonHeader::decode(&bytes);
        let second = CommonHeader::decode(&bytes);
        assert_eq!(first, second);
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn unknown_type_is_reported() {
        let message = PcepMessage::from_parts(
            CommonHeader {
                version: 1,
                flags: 0,
                message_type: 42,
                length: 4,
            },
            Bytes::new(),
        );
        assert!(matches!(
            message.message_type(),
            Err(AppError::MalformedMessage(_))
        ));
        assert_eq!(message.type_code(), 42);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = Bytes::from(vec![0u8; MAX_MESSAGE_LENGTH]);
        assert!(matches!(
            PcepMessage::try_new(MessageType::Request, body),
            Err(AppError::MessageTooLarge(_))
        ));
    }
}
