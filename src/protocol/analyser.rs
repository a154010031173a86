use super::message::{MessageType, PcepMessage, PCEP_VERSION};
use super::objects::{parse_objects, CloseObject, ErrorObject, OpenObject, PcepObject};
use crate::{AppError, AppResult};

/// What the session engine needs to know about a well-formed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Open(OpenObject),
    Keepalive,
    Error {
        error: ErrorObject,
        /// counter proposal attached to an ERROR(1,4)
        proposal: Option<OpenObject>,
    },
    Close(CloseObject),
    /// REQUEST, RESPONSE or NOTIFICATION, the body is left to collaborators
    Data(MessageType),
}

/// Validates a received message and extracts the objects the state machine acts on.
///
/// Unknown message types and header versions other than 1 are format errors.
pub fn check_message_format(message: &PcepMessage) -> AppResult<MessageContent> {
    if message.version() != PCEP_VERSION {
        return Err(AppError::MalformedMessage(format!(
            "unsupported version {}",
            message.version()
        )));
    }
    let message_type = message.message_type()?;
    match message_type {
        MessageType::Open => {
            let objects = parse_objects(message.body())?;
            match objects.as_slice() {
                [PcepObject::Open(open)] if open.version == PCEP_VERSION => {
                    Ok(MessageContent::Open(*open))
                }
                [PcepObject::Open(open)] => Err(AppError::MalformedMessage(format!(
                    "OPEN object version {}",
                    open.version
                ))),
                _ => Err(AppError::MalformedMessage(format!(
                    "OPEN must carry exactly one OPEN object, got {} objects",
                    objects.len()
                ))),
            }
        }
        MessageType::Error => {
            let objects = parse_objects(message.body())?;
            let mut iter = objects.iter();
            let error = match iter.next() {
                Some(PcepObject::Error(error)) => *error,
                _ => {
                    return Err(AppError::MalformedMessage(
                        "ERROR must start with a PCEP-ERROR object".into(),
                    ))
                }
            };
            let proposal = iter.find_map(|object| match object {
                PcepObject::Open(open) => Some(*open),
                _ => None,
            });
            Ok(MessageContent::Error { error, proposal })
        }
        MessageType::Close => {
            let objects = parse_objects(message.body())?;
            objects
                .iter()
                .find_map(|object| match object {
                    PcepObject::Close(close) => Some(MessageContent::Close(*close)),
                    _ => None,
                })
                .ok_or_else(|| AppError::MalformedMessage("CLOSE without CLOSE object".into()))
        }
        MessageType::Keepalive => Ok(MessageContent::Keepalive),
        MessageType::Request | MessageType::Response | MessageType::Notification => {
            Ok(MessageContent::Data(message_type))
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::protocol::message::CommonHeader;
    use crate::protocol::objects::{
        close_message, error_message, keepalive_message, open_message, CloseCause,
        EstablishmentError,
    };

    fn raw(version: u8, message_type: u8, body: &'static [u8]) -> PcepMessage {
        PcepMessage::from_parts(
            CommonHeader {
                version,
                flags: 0,
                message_type,
                length: 4 + body.len() as u16,
            },
            Bytes::from_static(body),
        )
    }

    #[test]
    fn valid_open() {
        let content = check_message_format(&open_message(OpenObject::new(30, 120, 1))).unwrap();
        assert_eq!(content, MessageContent::Open(OpenObject::new(30, 120, 1)));
    }

    #[test]
    fn error_carries_proposal() {
        let message = error_message(
            ErrorObject::establishment(EstablishmentError::Negotiable),
            Some(OpenObject::new(10, 40, 2)),
        );
        match check_message_format(&message).unwrap() {
            MessageContent::Error { error, proposal } => {
                assert!(error.is(EstablishmentError::Negotiable));
                assert_eq!(proposal, Some(OpenObject::new(10, 40, 2)));
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn keepalive_and_close() {
        assert_eq!(
            check_message_format(&keepalive_message()).unwrap(),
            MessageContent::Keepalive
        );
        assert!(matches!(
            check_message_format(&close_message(CloseCause::NoExplanation)).unwrap(),
            MessageContent::Close(_)
        ));
    }

    #[rstest]
    #[case::unknown_type(raw(1, 9, b""))]
    #[case::zero_type(raw(1, 0, b""))]
    #[case::bad_version(raw(2, 2, b""))]
    #[case::open_without_object(raw(1, 1, b""))]
    #[case::open_with_wrong_object(raw(1, 1, &[13, 0x10, 0, 8, 0, 0, 1, 1]))]
    #[case::open_with_two_objects(raw(1, 1, &[1, 0x10, 0, 8, 0x20, 30, 120, 1, 1, 0x10, 0, 8, 0x20, 30, 120, 1]))]
    #[case::open_object_version(raw(1, 1, &[1, 0x10, 0, 8, 0x40, 30, 120, 1]))]
    #[case::truncated_open(raw(1, 1, &[1, 0x10, 0, 8, 0x20]))]
    #[case::error_without_object(raw(1, 6, b""))]
    #[case::close_without_object(raw(1, 7, b""))]
    fn format_errors(#[case] message: PcepMessage) {
        assert!(check_message_format(&message).is_err());
    }

    #[rstest]
    #[case(3, MessageType::Request)]
    #[case(4, MessageType::Response)]
    #[case(5, MessageType::Notification)]
    fn data_bodies_are_opaque(#[case] code: u8, #[case] expected: MessageType) {
        let message = raw(1, code, b"\x01\x02\x03");
        assert_eq!(
            check_message_format(&message).unwrap(),
            MessageContent::Data(expected)
        );
    }
}
