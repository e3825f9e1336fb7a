//! Deduplicating broadcast batcher.
//!
//! Announcements staged between two trickle ticks are held in three keyed
//! maps, one per kind. Within a key only the newest announcement survives;
//! the set of peers that sent us any version of it is unioned so the flush
//! can skip them on fan-out.
use std::collections::{HashMap, HashSet};

use crate::crypto::PublicKey;
use crate::gossip::message::{ChannelAnnouncement, ChannelUpdate, Gossip, NodeAnnouncement};
use crate::ShortChannelId;

/// An announcement with the peers it was received from.
#[derive(Debug, Clone)]
struct Entry<T> {
    msg: T,
    senders: HashSet<PublicKey>,
}

/// Batch of deduplicated announcements pending broadcast.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Channel announcements, keyed by channel.
    channels: HashMap<ShortChannelId, Entry<ChannelAnnouncement>>,
    /// Channel updates, keyed by channel and direction.
    updates: HashMap<(ShortChannelId, u8), Entry<ChannelUpdate>>,
    /// Node announcements, keyed by node.
    nodes: HashMap<PublicKey, Entry<NodeAnnouncement>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.updates.is_empty() && self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len() + self.updates.len() + self.nodes.len()
    }

    /// Stage an announcement. `sender` is the peer it came from, or `None`
    /// for locally-originated messages.
    ///
    /// Channel announcements are last-writer-wins per channel; updates and
    /// node announcements are replaced only by a strictly greater
    /// timestamp. Senders accumulate across replacements either way.
    pub fn insert(&mut self, msg: Gossip, sender: Option<PublicKey>) {
        match msg {
            Gossip::Channel(ann) => {
                let entry = self
                    .channels
                    .entry(ann.short_channel_id)
                    .or_insert_with(|| Entry {
                        msg: ann.clone(),
                        senders: HashSet::new(),
                    });
                entry.msg = ann;
                entry.senders.extend(sender);
            }
            Gossip::Update(upd) => {
                let key = (upd.short_channel_id, upd.flags & 1);
                match self.updates.get_mut(&key) {
                    Some(entry) => {
                        if upd.timestamp > entry.msg.timestamp {
                            entry.msg = upd;
                        }
                        entry.senders.extend(sender);
                    }
                    None => {
                        self.updates.insert(
                            key,
                            Entry {
                                msg: upd,
                                senders: sender.into_iter().collect(),
                            },
                        );
                    }
                }
            }
            Gossip::Node(ann) => match self.nodes.get_mut(&ann.node_id) {
                Some(entry) => {
                    if ann.timestamp > entry.msg.timestamp {
                        entry.msg = ann;
                    }
                    entry.senders.extend(sender);
                }
                None => {
                    self.nodes.insert(
                        ann.node_id,
                        Entry {
                            msg: ann,
                            senders: sender.into_iter().collect(),
                        },
                    );
                }
            },
            // Partial proofs are point-to-point; they are never batched.
            Gossip::Proof(_) => {
                debug_assert!(false, "Batch::insert: partial proofs cannot be broadcast")
            }
        }
    }

    /// Drain the batch in broadcast order: channel announcements first, then
    /// channel updates, then node announcements, so a receiver can insert an
    /// edge before any update referencing it. The batch is left empty.
    pub fn emit(&mut self) -> Vec<(Gossip, HashSet<PublicKey>)> {
        let mut out = Vec::with_capacity(self.len());

        out.extend(
            self.channels
                .drain()
                .map(|(_, e)| (Gossip::Channel(e.msg), e.senders)),
        );
        out.extend(
            self.updates
                .drain()
                .map(|(_, e)| (Gossip::Update(e.msg), e.senders)),
        );
        out.extend(
            self.nodes
                .drain()
                .map(|(_, e)| (Gossip::Node(e.msg), e.senders)),
        );
        out
    }

    /// The staged announcements in broadcast order, without draining.
    pub fn messages(&self) -> impl Iterator<Item = Gossip> + '_ {
        self.channels
            .values()
            .map(|e| Gossip::Channel(e.msg.clone()))
            .chain(self.updates.values().map(|e| Gossip::Update(e.msg.clone())))
            .chain(self.nodes.values().map(|e| Gossip::Node(e.msg.clone())))
    }
}
