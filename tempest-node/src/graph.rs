//! The channel graph, as consumed by the gossip engine.
//!
//! The graph itself lives elsewhere in the node; the engine only relies on
//! the operations below. Implementations are internally synchronized and
//! enforce announcement monotonicity, surfacing [`Error::Stale`] so the
//! engine can drop superseded messages silently.
use thiserror::Error;

use crate::crypto::PublicKey;
use crate::gossip::message::{ChannelAnnouncement, ChannelAuthProof, ChannelUpdate, NodeAnnouncement};
use crate::ShortChannelId;

#[derive(Debug, Error)]
pub enum Error {
    /// The referenced channel edge is not in the graph.
    #[error("channel edge not found")]
    NotFound,
    /// The announcement does not supersede the stored one.
    #[error("announcement is stale")]
    Stale,
    /// Backend failure.
    #[error("graph error: {0}")]
    Internal(String),
}

/// A channel edge with its two directional policies.
#[derive(Debug, Clone)]
pub struct Channel {
    /// The announcement that created the edge.
    pub info: ChannelAnnouncement,
    /// Policies by direction: `policies[0]` originates at `node_1`.
    pub policies: [Option<ChannelUpdate>; 2],
}

/// Graph operations the gossip engine performs.
pub trait Graph {
    /// Insert or replace a node. Fails with [`Error::Stale`] unless the
    /// timestamp is strictly greater than the stored announcement's.
    fn add_node(&self, ann: NodeAnnouncement) -> Result<(), Error>;

    /// Insert a channel edge. Fails with [`Error::Stale`] if the edge is
    /// already known.
    fn add_channel(&self, ann: ChannelAnnouncement) -> Result<(), Error>;

    /// Apply a directional policy. Fails with [`Error::NotFound`] if the
    /// edge is unknown, and with [`Error::Stale`] unless the timestamp is
    /// strictly greater than the stored policy's.
    fn update_channel(&self, upd: ChannelUpdate) -> Result<(), Error>;

    /// Attach an assembled authentication proof to an edge.
    fn add_proof(&self, scid: ShortChannelId, proof: ChannelAuthProof) -> Result<(), Error>;

    /// Look up a channel edge and its policies.
    fn channel(&self, scid: ShortChannelId) -> Result<Channel, Error>;

    /// Look up a node announcement.
    fn node(&self, id: &PublicKey) -> Result<Option<NodeAnnouncement>, Error>;

    /// The best block height known to the node.
    fn best_height(&self) -> Result<u32, Error>;
}

impl<G: Graph + ?Sized> Graph for std::sync::Arc<G> {
    fn add_node(&self, ann: NodeAnnouncement) -> Result<(), Error> {
        (**self).add_node(ann)
    }

    fn add_channel(&self, ann: ChannelAnnouncement) -> Result<(), Error> {
        (**self).add_channel(ann)
    }

    fn update_channel(&self, upd: ChannelUpdate) -> Result<(), Error> {
        (**self).update_channel(upd)
    }

    fn add_proof(&self, scid: ShortChannelId, proof: ChannelAuthProof) -> Result<(), Error> {
        (**self).add_proof(scid, proof)
    }

    fn channel(&self, scid: ShortChannelId) -> Result<Channel, Error> {
        (**self).channel(scid)
    }

    fn node(&self, id: &PublicKey) -> Result<Option<NodeAnnouncement>, Error> {
        (**self).node(id)
    }

    fn best_height(&self) -> Result<u32, Error> {
        (**self).best_height()
    }
}
