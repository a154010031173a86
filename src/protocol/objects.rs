//! The handful of objects the session engine itself has to read or write.
//!
//! Every object starts with a four byte header:
//! ```text
//! | Object-Class | OT |Res|P|I|   Object Length (bytes)   |
//! ```
//! Objects other than OPEN, PCEP-ERROR and CLOSE are kept as raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::{MessageType, PcepMessage, PCEP_VERSION};
use crate::{AppError, AppResult};

pub const OBJECT_HEADER_LENGTH: usize = 4;

pub const OPEN_OBJECT_CLASS: u8 = 1;
pub const ERROR_OBJECT_CLASS: u8 = 13;
pub const CLOSE_OBJECT_CLASS: u8 = 15;

/// Error-Type 1, failures during session establishment.
pub const SESSION_ESTABLISHMENT_FAILURE: u8 = 1;

/// Error-Values of Error-Type 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EstablishmentError {
    /// reception of an invalid OPEN or a non-OPEN message
    InvalidOpen = 1,
    /// no OPEN received before the open-wait timer expired
    OpenWaitExpired = 2,
    /// unacceptable and non negotiable session characteristics
    NotNegotiable = 3,
    /// unacceptable but negotiable session characteristics
    Negotiable = 4,
    /// a second OPEN was still unacceptable
    SecondOpenUnacceptable = 5,
    /// an ERROR carrying an unacceptable proposal was received
    UnacceptableProposal = 6,
    /// no KEEPALIVE or ERROR received before the keep-wait timer expired
    KeepWaitExpired = 7,
}

impl EstablishmentError {
    pub fn error_value(&self) -> u8 {
        *self as u8
    }
}

/// CLOSE reasons put on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseCause {
    NoExplanation = 1,
    DeadTimerExpired = 2,
    MalformedMessage = 3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub class: u8,
    pub object_type: u8,
    pub processing_rule: bool,
    pub ignored: bool,
    pub length: u16,
}

impl ObjectHeader {
    fn new(class: u8, object_type: u8, body_len: usize) -> Self {
        ObjectHeader {
            class,
            object_type,
            processing_rule: false,
            ignored: false,
            length: (OBJECT_HEADER_LENGTH + body_len) as u16,
        }
    }

    fn read_from(buf: &mut Bytes) -> AppResult<ObjectHeader> {
        if buf.remaining() < OBJECT_HEADER_LENGTH {
            return Err(AppError::MalformedMessage(format!(
                "object header needs {} bytes, {} left",
                OBJECT_HEADER_LENGTH,
                buf.remaining()
            )));
        }
        let class = buf.get_u8();
        let flags = buf.get_u8();
        let length = buf.get_u16();
        Ok(ObjectHeader {
            class,
            object_type: flags >> 4,
            processing_rule: flags & 0x02 != 0,
            ignored: flags & 0x01 != 0,
            length,
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.class);
        let mut flags = self.object_type << 4;
        if self.processing_rule {
            flags |= 0x02;
        }
        if self.ignored {
            flags |= 0x01;
        }
        buf.put_u8(flags);
        buf.put_u16(self.length);
    }
}

/// Session characteristics proposed by one side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpenObject {
    pub version: u8,
    pub flags: u8,
    /// seconds, 0 disables keepalives
    pub keepalive: u8,
    /// seconds, 0 disables the dead timer
    pub dead_timer: u8,
    pub session_id: u8,
}

impl OpenObject {
    pub const CLASS: u8 = OPEN_OBJECT_CLASS;
    pub const TYPE: u8 = 1;
    const BODY_LENGTH: usize = 4;

    pub fn new(keepalive: u8, dead_timer: u8, session_id: u8) -> Self {
        OpenObject {
            version: PCEP_VERSION,
            flags: 0,
            keepalive,
            dead_timer,
            session_id,
        }
    }

    fn read_body(mut body: Bytes) -> AppResult<Self> {
        if body.remaining() != Self::BODY_LENGTH {
            return Err(AppError::MalformedMessage(format!(
                "OPEN object body is {} bytes",
                body.remaining()
            )));
        }
        let first = body.get_u8();
        Ok(OpenObject {
            version: first >> 5,
            flags: first & 0x1f,
            keepalive: body.get_u8(),
            dead_timer: body.get_u8(),
            session_id: body.get_u8(),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        ObjectHeader::new(Self::CLASS, Self::TYPE, Self::BODY_LENGTH).write_to(buf);
        buf.put_u8((self.version << 5) | (self.flags & 0x1f));
        buf.put_u8(self.keepalive);
        buf.put_u8(self.dead_timer);
        buf.put_u8(self.session_id);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ErrorObject {
    pub flags: u8,
    pub error_type: u8,
    pub error_value: u8,
}

impl ErrorObject {
    pub const CLASS: u8 = ERROR_OBJECT_CLASS;
    pub const TYPE: u8 = 1;
    const BODY_LENGTH: usize = 4;

    pub fn establishment(error: EstablishmentError) -> Self {
        ErrorObject {
            flags: 0,
            error_type: SESSION_ESTABLISHMENT_FAILURE,
            error_value: error.error_value(),
        }
    }

    pub fn is(&self, error: EstablishmentError) -> bool {
        self.error_type == SESSION_ESTABLISHMENT_FAILURE && self.error_value == error.error_value()
    }

    fn read_body(mut body: Bytes) -> AppResult<Self> {
        if body.remaining() != Self::BODY_LENGTH {
            return Err(AppError::MalformedMessage(format!(
                "PCEP-ERROR object body is {} bytes",
                body.remaining()
            )));
        }
        let _reserved = body.get_u8();
        Ok(ErrorObject {
            flags: body.get_u8(),
            error_type: body.get_u8(),
            error_value: body.get_u8(),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        ObjectHeader::new(Self::CLASS, Self::TYPE, Self::BODY_LENGTH).write_to(buf);
        buf.put_u8(0);
        buf.put_u8(self.flags);
        buf.put_u8(self.error_type);
        buf.put_u8(self.error_value);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CloseObject {
    pub flags: u8,
    pub reason: u8,
}

impl CloseObject {
    pub const CLASS: u8 = CLOSE_OBJECT_CLASS;
    pub const TYPE: u8 = 1;
    const BODY_LENGTH: usize = 4;

    fn read_body(mut body: Bytes) -> AppResult<Self> {
        if body.remaining() != Self::BODY_LENGTH {
            return Err(AppError::MalformedMessage(format!(
                "CLOSE object body is {} bytes",
                body.remaining()
            )));
        }
        let _reserved = body.get_u16();
        Ok(CloseObject {
            flags: body.get_u8(),
            reason: body.get_u8(),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        ObjectHeader::new(Self::CLASS, Self::TYPE, Self::BODY_LENGTH).write_to(buf);
        buf.put_u16(0);
        buf.put_u8(self.flags);
        buf.put_u8(self.reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcepObject {
    Open(OpenObject),
    Error(ErrorObject),
    Close(CloseObject),
    Other { header: ObjectHeader, body: Bytes },
}

/// Splits a message body into its objects.
///
/// Fails when an object header declares a length shorter than the header itself
/// or longer than what is left of the body.
pub fn parse_objects(body: &Bytes) -> AppResult<Vec<PcepObject>> {
    let mut buf = body.clone();
    let mut objects = Vec::new();
    while buf.has_remaining() {
        let header = ObjectHeader::read_from(&mut buf)?;
        let body_len = (header.length as usize)
            .checked_sub(OBJECT_HEADER_LENGTH)
            .ok_or_else(|| {
                AppError::MalformedMessage(format!("object length {} too small", header.length))
            })?;
        if body_len > buf.remaining() {
            return Err(AppError::MalformedMessage(format!(
                "object class {} declares {} bytes, {} left",
                header.class,
                header.length,
                buf.remaining() + OBJECT_HEADER_LENGTH
            )));
        }
        let object_body = buf.split_to(body_len);
        let object = match (header.class, header.object_type) {
            (OpenObject::CLASS, OpenObject::TYPE) => {
                PcepObject::Open(OpenObject::read_body(object_body)?)
            }
            (ErrorObject::CLASS, ErrorObject::TYPE) => {
                PcepObject::Error(ErrorObject::read_body(object_body)?)
            }
            (CloseObject::CLASS, CloseObject::TYPE) => {
                PcepObject::Close(CloseObject::read_body(object_body)?)
            }
            _ => PcepObject::Other {
                header,
                body: object_body,
            },
        };
        objects.push(object);
    }
    Ok(objects)
}

pub fn open_message(open: OpenObject) -> PcepMessage {
    let mut body = BytesMut::with_capacity(OBJECT_HEADER_LENGTH + OpenObject::BODY_LENGTH);
    open.write_to(&mut body);
    PcepMessage::new(MessageType::Open, body.freeze())
}

pub fn keepalive_message() -> PcepMessage {
    PcepMessage::new(MessageType::Keepalive, Bytes::new())
}

/// An ERROR message, optionally followed by an OPEN object carrying a counter proposal.
pub fn error_message(error: ErrorObject, proposal: Option<OpenObject>) -> PcepMessage {
    let mut body = BytesMut::with_capacity(2 * OBJECT_HEADER_LENGTH + 8);
    error.write_to(&mut body);
    if let Some(open) = proposal {
        open.write_to(&mut body);
    }
    PcepMessage::new(MessageType::Error, body.freeze())
}

pub fn close_message(cause: CloseCause) -> PcepMessage {
    let mut body = BytesMut::with_capacity(OBJECT_HEADER_LENGTH + CloseObject::BODY_LENGTH);
    CloseObject {
        flags: 0,
        reason: cause as u8,
    }
    .write_to(&mut body);
    PcepMessage::new(MessageType::Close, body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_object_wire_layout() {
        let message = open_message(OpenObject::new(30, 120, 7));
        assert_eq!(
            &message.body()[..],
            &[1, 0x10, 0, 8, 0x20, 30, 120, 7],
        );
        let objects = parse_objects(message.body()).unwrap();
        assert_eq!(objects, vec![PcepObject::Open(OpenObject::new(30, 120, 7))]);
    }

    #[test]
    fn error_with_counter_proposal() {
        let message = error_message(
            ErrorObject::establishment(EstablishmentError::Negotiable),
            Some(OpenObject::new(10, 40, 3)),
        );
        let objects = parse_objects(message.body()).unwrap();
        assert_eq!(objects.len(), 2);
        match &objects[0] {
            PcepObject::Error(error) => assert!(error.is(EstablishmentError::Negotiable)),
            other => panic!("unexpected object {:?}", other),
        }
        assert_eq!(objects[1], PcepObject::Open(OpenObject::new(10, 40, 3)));
    }

    #[test]
    fn close_reason_round_trip() {
        let message = close_message(CloseCause::DeadTimerExpired);
        assert_eq!(
            parse_objects(message.body()).unwrap(),
            vec![PcepObject::Close(CloseObject {
                flags: 0,
                reason: CloseCause::DeadTimerExpired as u8
            })]
        );
    }

    #[test]
    fn unknown_objects_are_carried_opaquely() {
        // class 4 (RP), type 1, P flag set, 4 byte body
        let body = Bytes::from_static(&[4, 0x12, 0, 8, 0xde, 0xad, 0xbe, 0xef]);
        let objects = parse_objects(&body).unwrap();
        match &objects[..] {
            [PcepObject::Other { header, body }] => {
                assert_eq!(header.class, 4);
                assert_eq!(header.object_type, 1);
                assert!(header.processing_rule);
                assert!(!header.ignored);
                assert_eq!(&body[..], &[0xde, 0xad, 0xbe, 0xef]);
            }
            other => panic!("unexpected objects {:?}", other),
        }
    }

    #[test]
    fn truncated_object_is_malformed() {
        let body = Bytes::from_static(&[1, 0x10, 0, 8, 0x20, 30]);
        assert!(matches!(
            parse_objects(&body),
            Err(AppError::MalformedMessage(_))
        ));
    }

    #[test]
    fn object_length_below_header_is_malformed() {
        let body = Bytes::from_static(&[1, 0x10, 0, 2]);
        assert!(parse_objects(&body).is_err());
    }
}
