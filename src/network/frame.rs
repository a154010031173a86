use bytes::BytesMut;

use crate::protocol::{CommonHeader, PcepMessage, COMMON_HEADER_LENGTH};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Cuts complete messages off the front of a read buffer.
#[derive(Debug)]
pub struct PcepFrame;

impl PcepFrame {
    /// Checks whether `buffer` starts with a complete message, without consuming anything.
    ///
    /// Returns `Incomplete` while the header or the declared body is still missing, and a
    /// framing error when the declared length can never be satisfied.
    pub fn check(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<CommonHeader> {
        let header = CommonHeader::decode(buffer).ok_or(Incomplete)?;
        let length = header.length as usize;
        if length < COMMON_HEADER_LENGTH {
            return Err(AppError::FramingError(format!(
                "frame length {} less than header length {}",
                length, COMMON_HEADER_LENGTH
            )));
        }
        if length > max_package_size {
            return Err(AppError::FramingError(format!(
                "Frame of length {} is too large.",
                length
            )));
        }
        if buffer.len() < length {
            buffer.reserve(length - buffer.len());
            return Err(Incomplete);
        }
        Ok(header)
    }

    pub fn parse(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<Option<PcepMessage>> {
        // perform a check to ensure we have enough data
        match PcepFrame::check(buffer, max_package_size) {
            Ok(header) => {
                let mut frame = buffer.split_to(header.length as usize);
                let body = frame.split_off(COMMON_HEADER_LENGTH);
                Ok(Some(PcepMessage::from_parts(header, body.freeze())))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::{keepalive_message, MessageType};

    const MAX: usize = 65535;

    #[test]
    fn parse_one_message_and_keep_the_rest() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&keepalive_message().encode());
        buffer.extend_from_slice(
            &PcepMessage::new(MessageType::Request, Bytes::from_static(b"xyz")).encode()[..5],
        );

        let first = PcepFrame::parse(&mut buffer, MAX).unwrap().unwrap();
        assert_eq!(first.message_type().unwrap(), MessageType::Keepalive);
        assert_eq!(buffer.len(), 5);
        assert!(PcepFrame::parse(&mut buffer, MAX).unwrap().is_none());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn short_header_is_incomplete() {
        let mut buffer = BytesMut::from(&[0x20u8, 0x02][..]);
        assert!(matches!(
            PcepFrame::check(&mut buffer, MAX),
            Err(AppError::Incomplete)
        ));
    }

    #[test]
    fn length_below_header_is_framing_error() {
        let mut buffer = BytesMut::from(&[0x20u8, 0x02, 0x00, 0x03][..]);
        assert!(matches!(
            PcepFrame::parse(&mut buffer, MAX),
            Err(AppError::FramingError(_))
        ));
    }

    #[test]
    fn oversized_frame_is_framing_error() {
        let mut buffer = BytesMut::from(&[0x20u8, 0x03, 0x01, 0x00][..]);
        assert!(matches!(
            PcepFrame::parse(&mut buffer, 128),
            Err(AppError::FramingError(_))
        ));
    }
}
