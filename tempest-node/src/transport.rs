//! The peer network, as consumed by the gossip engine.
//!
//! Fan-out and point-to-point delivery are provided by the node's peer
//! manager; the engine only depends on the operations below. All of them
//! must be safe to call concurrently and must not block for long.
use std::collections::HashSet;

use crossbeam_channel as chan;
use thiserror::Error;

use crate::crypto::PublicKey;
use crate::gossip::message::Gossip;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer has no active connection.
    #[error("peer {0} is not connected")]
    NotConnected(PublicKey),
    /// Delivery failed after the connection was established.
    #[error("send failed: {0}")]
    Send(String),
}

/// Message delivery to peers.
pub trait Transport {
    /// Send a message to every connected peer except those in `skip`.
    fn broadcast(&self, skip: &HashSet<PublicKey>, msg: Gossip);

    /// Send messages to a specific peer. Failure is not fatal: the caller
    /// registers an online notification and retries on reconnection.
    fn send_to_peer(&self, peer: PublicKey, msgs: Vec<Gossip>) -> Result<(), Error>;

    /// Register a one-shot notification: `online` receives the peer id the
    /// next time the peer connects. Registrations do not outlive the
    /// process; they are re-created after a restart by whoever needs them.
    fn notify_when_online(&self, peer: PublicKey, online: chan::Sender<PublicKey>);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn broadcast(&self, skip: &HashSet<PublicKey>, msg: Gossip) {
        (**self).broadcast(skip, msg)
    }

    fn send_to_peer(&self, peer: PublicKey, msgs: Vec<Gossip>) -> Result<(), Error> {
        (**self).send_to_peer(peer, msgs)
    }

    fn notify_when_online(&self, peer: PublicKey, online: chan::Sender<PublicKey>) {
        (**self).notify_when_online(peer, online)
    }
}
