use tokio::sync::mpsc;
use tracing::{debug, info};

use super::state::CloseReason;
use crate::protocol::PcepMessage;
use crate::PeerAddress;

/// Receives what the engine hands upward.
///
/// Called from session workers, implementations must not block.
pub trait SessionListener: Send + Sync + 'static {
    /// A data message that passed role routing in the up state.
    fn on_inbound_message(&self, peer: PeerAddress, message: PcepMessage);

    /// The session is gone, its connection closed or about to be.
    fn on_connection_closed(&self, peer: PeerAddress, reason: CloseReason);

    fn on_session_established(&self, _peer: PeerAddress) {}
}

/// Only traces what it is given. Used by the standalone node.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl SessionListener for LoggingListener {
    fn on_inbound_message(&self, peer: PeerAddress, message: PcepMessage) {
        debug!(%peer, "inbound {:?}", message);
    }

    fn on_connection_closed(&self, peer: PeerAddress, reason: CloseReason) {
        info!(%peer, %reason, "session closed");
    }

    fn on_session_established(&self, peer: PeerAddress) {
        info!(%peer, "session established");
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Established(PeerAddress),
    Message(PeerAddress, PcepMessage),
    Closed(PeerAddress, CloseReason),
}

/// Forwards every callback into a channel, for consumers that want to `.await` them.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (ChannelListener, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (ChannelListener { events }, rx)
    }

    fn forward(&self, event: ListenerEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("listener receiver dropped, discarding {:?}", e.0);
        }
    }
}

impl SessionListener for ChannelListener {
    fn on_inbound_message(&self, peer: PeerAddress, message: PcepMessage) {
        self.forward(ListenerEvent::Message(peer, message));
    }

    fn on_connection_closed(&self, peer: PeerAddress, reason: CloseReason) {
        self.forward(ListenerEvent::Closed(peer, reason));
    }

    fn on_session_established(&self, peer: PeerAddress) {
        self.forward(ListenerEvent::Established(peer));
    }
}
