//! Wire format of the path computation element protocol.
//!
//! - `message`: the common header and the framed message type
//! - `objects`: OPEN, PCEP-ERROR and CLOSE objects plus message builders
//! - `analyser`: format validation of received messages
//!
//! The session engine only looks inside OPEN, ERROR and CLOSE. REQUEST, RESPONSE and
//! NOTIFICATION bodies belong to the collaborators and travel untouched.

pub use analyser::{check_message_format, MessageContent};
pub use message::{
    CommonHeader, MessageType, PcepMessage, COMMON_HEADER_LENGTH, MAX_MESSAGE_LENGTH,
    PCEP_VERSION,
};
pub use objects::{
    close_message, error_message, keepalive_message, open_message, parse_objects, CloseCause,
    CloseObject, EstablishmentError, ErrorObject, ObjectHeader, OpenObject, PcepObject,
};

mod analyser;
mod message;
mod objects;
