use std::collections::HashMap;

use bytes::BytesMut;
use tracing::trace;

use super::PcepFrame;
use crate::protocol::PcepMessage;
use crate::{AppResult, PeerAddress};

/// Turns the byte stream of each peer into discrete messages.
///
/// Holds at most one partial message per peer. A buffer never keeps a complete
/// message: every feed drains all complete messages before returning. Owned by the
/// dispatcher task, so no locking is involved.
#[derive(Debug)]
pub struct Demultiplexer {
    pending: HashMap<PeerAddress, BytesMut>,
    max_package_size: usize,
}

impl Demultiplexer {
    pub fn new(max_package_size: usize) -> Self {
        Demultiplexer {
            pending: HashMap::new(),
            max_package_size,
        }
    }

    /// Appends `data` to what is pending for `peer` and returns every complete message.
    ///
    /// An empty read means "no data yet" and leaves the state untouched. On a framing
    /// error the pending bytes of the peer are discarded, the stream can not be resynced.
    pub fn feed(&mut self, peer: PeerAddress, data: &[u8]) -> AppResult<Vec<PcepMessage>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let buffer = self.pending.entry(peer).or_default();
        buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            match PcepFrame::parse(buffer, self.max_package_size) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(e) => {
                    self.pending.remove(&peer);
                    return Err(e);
                }
            }
        }

        if buffer.is_empty() {
            self.pending.remove(&peer);
        } else {
            trace!(%peer, pending = buffer.len(), "partial message carried over");
        }
        Ok(messages)
    }

    /// Drops whatever is pending for `peer`, called when its connection goes away.
    pub fn remove(&mut self, peer: &PeerAddress) {
        self.pending.remove(peer);
    }

    pub fn pending_len(&self, peer: &PeerAddress) -> usize {
        self.pending.get(peer).map_or(0, |buffer| buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::{
        close_message, keepalive_message, open_message, CloseCause, MessageType, OpenObject,
    };
    use crate::AppError;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::from(([127, 0, 0, 1], port))
    }

    fn stream() -> (Vec<PcepMessage>, Vec<u8>) {
        let messages = vec![
            open_message(OpenObject::new(30, 120, 1)),
            keepalive_message(),
            PcepMessage::new(MessageType::Request, Bytes::from_static(b"path from a to b")),
            PcepMessage::new(MessageType::Notification, Bytes::new()),
            close_message(CloseCause::NoExplanation),
        ];
        let bytes = messages.iter().flat_map(|m| m.encode().to_vec()).collect();
        (messages, bytes)
    }

    #[test]
    fn many_messages_in_one_read() {
        let (expected, bytes) = stream();
        let mut demux = Demultiplexer::new(65535);
        let messages = demux.feed(peer(1), &bytes).unwrap();
        assert_eq!(messages, expected);
        assert_eq!(demux.pending_len(&peer(1)), 0);
    }

    #[test]
    fn split_invariance_over_every_boundary() {
        let (expected, bytes) = stream();
        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let mut demux = Demultiplexer::new(65535);
                let mut messages = demux.feed(peer(1), &bytes[..first]).unwrap();
                messages.extend(demux.feed(peer(1), &bytes[first..second]).unwrap());
                messages.extend(demux.feed(peer(1), &bytes[second..]).unwrap());
                assert_eq!(messages, expected, "split at {} and {}", first, second);
                assert_eq!(demux.pending_len(&peer(1)), 0);
            }
        }
    }

    #[test]
    fn byte_at_a_time() {
        let (expected, bytes) = stream();
        let mut demux = Demultiplexer::new(65535);
        let mut messages = Vec::new();
        for byte in &bytes {
            messages.extend(demux.feed(peer(1), std::slice::from_ref(byte)).unwrap());
            // the buffer never holds a complete message
            assert!(demux.pending_len(&peer(1)) < 64);
        }
        assert_eq!(messages, expected);
    }

    #[test]
    fn empty_read_is_not_a_boundary() {
        let bytes = keepalive_message().encode();
        let mut demux = Demultiplexer::new(65535);
        assert!(demux.feed(peer(1), &bytes[..2]).unwrap().is_empty());
        assert!(demux.feed(peer(1), &[]).unwrap().is_empty());
        assert_eq!(demux.pending_len(&peer(1)), 2);
        assert_eq!(demux.feed(peer(1), &bytes[2..]).unwrap().len(), 1);
    }

    #[test]
    fn peers_are_buffered_independently() {
        let bytes = keepalive_message().encode();
        let mut demux = Demultiplexer::new(65535);
        assert!(demux.feed(peer(1), &bytes[..3]).unwrap().is_empty());
        assert!(demux.feed(peer(2), &bytes[..1]).unwrap().is_empty());
        assert_eq!(demux.feed(peer(2), &bytes[1..]).unwrap().len(), 1);
        assert_eq!(demux.pending_len(&peer(1)), 3);
        assert_eq!(demux.feed(peer(1), &bytes[3..]).unwrap().len(), 1);
    }

    #[test]
    fn framing_error_discards_pending_bytes() {
        let mut demux = Demultiplexer::new(65535);
        assert!(demux.feed(peer(1), &[0x20, 0x02]).unwrap().is_empty());
        assert!(matches!(
            demux.feed(peer(1), &[0x00, 0x01]),
            Err(AppError::FramingError(_))
        ));
        assert_eq!(demux.pending_len(&peer(1)), 0);
    }

    #[test]
    fn remove_drops_partial_message() {
        let mut demux = Demultiplexer::new(65535);
        demux.feed(peer(1), &[0x20, 0x02, 0x00]).unwrap();
        demux.remove(&peer(1));
        assert_eq!(demux.pending_len(&peer(1)), 0);
    }
}
