//! Observer notifications and the outbound ban hook.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::mpsc;

use super::cleanup::DisconnectReason;
use crate::protocol::{Direction, InfoHash, PeerMessage};
use crate::swarm::Peer;

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    /// A message was fully sent or received. Bundles arrive one message at a time.
    MessageTransferred {
        info_hash: InfoHash,
        address: SocketAddr,
        direction: Direction,
        message: PeerMessage,
    },
    /// Handshake completed and the message loop is running.
    PeerConnected {
        info_hash: InfoHash,
        address: SocketAddr,
        direction: Direction,
    },
    PeerDisconnected {
        info_hash: InfoHash,
        address: SocketAddr,
        reason: DisconnectReason,
    },
    ConnectionAttemptFailed {
        info_hash: InfoHash,
        address: SocketAddr,
        reason: String,
    },
}

/// Mutable verdict shared by every ban policy consulted for a peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BanVerdict {
    pub ban: bool,
}

/// Decides whether an outbound connection attempt should be dropped.
pub trait BanPolicy: Send {
    fn should_ban(&self, info_hash: &InfoHash, peer: &Peer, verdict: &mut BanVerdict);
}

impl<F> BanPolicy for F
where
    F: Fn(&InfoHash, &Peer, &mut BanVerdict) + Send,
{
    fn should_ban(&self, info_hash: &InfoHash, peer: &Peer, verdict: &mut BanVerdict) {
        self(info_hash, peer, verdict)
    }
}

/// Fans engine events out to subscribers in registration order.
#[derive(Default)]
pub(crate) struct EventNotifier {
    subscribers: Vec<mpsc::UnboundedSender<SwarmEvent>>,
    ban_policies: Vec<Box<dyn BanPolicy>>,
}

impl EventNotifier {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    pub fn add_ban_policy(&mut self, policy: Box<dyn BanPolicy>) {
        self.ban_policies.push(policy);
    }

    fn dispatch(&mut self, event: SwarmEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn notify_message_transferred(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        direction: Direction,
        message: &PeerMessage,
    ) {
        if self.subscribers.is_empty() {
            return;
        }
        for message in message.clone().into_individual() {
            self.dispatch(SwarmEvent::MessageTransferred {
                info_hash,
                address,
                direction,
                message,
            });
        }
    }

    pub fn notify_peer_connected(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        direction: Direction,
    ) {
        if self.subscribers.is_empty() {
            return;
        }
        self.dispatch(SwarmEvent::PeerConnected {
            info_hash,
            address,
            direction,
        });
    }

    pub fn notify_peer_disconnected(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        reason: DisconnectReason,
    ) {
        if self.subscribers.is_empty() {
            return;
        }
        self.dispatch(SwarmEvent::PeerDisconnected {
            info_hash,
            address,
            reason,
        });
    }

    pub fn notify_connection_attempt_failed(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        reason: String,
    ) {
        if self.subscribers.is_empty() {
            return;
        }
        self.dispatch(SwarmEvent::ConnectionAttemptFailed {
            info_hash,
            address,
            reason,
        });
    }

    /// Runs every ban policy against `peer`.
    ///
    /// A panicking policy is logged and leaves the verdict as it was.
    pub fn should_ban_peer(&self, info_hash: &InfoHash, peer: &Peer) -> bool {
        if self.ban_policies.is_empty() {
            return false;
        }

        let mut verdict = BanVerdict::default();
        for policy in &self.ban_policies {
            let result = catch_unwind(AssertUnwindSafe(|| {
                policy.should_ban(info_hash, peer, &mut verdict)
            }));
            if result.is_err() {
                tracing::warn!("Ban policy panicked while checking peer {}", peer.address);
            }
        }
        verdict.ban
    }
}
