//! The authenticated gossip engine.
//!
//! All engine state is owned by a single coordinator (see [`runtime`]),
//! which drives the deterministic core below: validation dispatch,
//! height-gated admission of premature announcements, channel-proof
//! assembly, and the trickle-timer broadcast batch. The core performs no
//! I/O of its own; network effects are queued on an [`Outbox`] and drained
//! by the runtime.
pub mod batch;
pub mod message;
pub mod proofs;
pub mod runtime;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use localtime::LocalDuration;
use log::*;

use bitcoin::BlockHash;

use crate::crypto::PublicKey;
use crate::gossip::batch::Batch;
use crate::gossip::message::{
    AnnounceSignatures, ChannelAnnouncement, ChannelAuthProof, ChannelUpdate, Gossip,
    NodeAnnouncement,
};
use crate::gossip::proofs::{Origin, WaitingProof};
use crate::graph::{self, Graph};
use crate::ShortChannelId;

pub use runtime::Gossiper;

/// How often the broadcast batch is flushed to peers.
pub const TRICKLE_INTERVAL: LocalDuration = LocalDuration::from_millis(100);
/// How often our own announcements are re-staged, to defend against peer
/// churn having dropped them from the network.
pub const RETRANSMIT_INTERVAL: LocalDuration = LocalDuration::from_mins(60);
/// Confirmations beyond the embedded height required before a channel
/// announcement is admitted.
pub const PROOF_MATURE_DELTA: u32 = 0;

/// Gossip engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our node identity.
    pub node_id: PublicKey,
    /// Chain we accept announcements for.
    pub chain_hash: BlockHash,
    /// Broadcast batch flush interval.
    pub trickle_interval: LocalDuration,
    /// Own-announcement republish interval.
    pub retransmit_interval: LocalDuration,
    /// Maturity delta for channel announcements.
    pub proof_mature_delta: u32,
}

impl Config {
    pub fn new(node_id: PublicKey, chain_hash: BlockHash) -> Self {
        Self {
            node_id,
            chain_hash,
            trickle_interval: TRICKLE_INTERVAL,
            retransmit_interval: RETRANSMIT_INTERVAL,
            proof_mature_delta: PROOF_MATURE_DELTA,
        }
    }
}

/// Where a submitted message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Produced by this node (the funding manager, or ourselves).
    Local,
    /// Received from a connected peer.
    Peer(PublicKey),
}

impl Source {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// The sending peer, if any.
    pub fn peer(&self) -> Option<PublicKey> {
        match self {
            Self::Local => None,
            Self::Peer(id) => Some(*id),
        }
    }
}

/// Validation and processing errors surfaced to the submitter.
///
/// Stale, premature and orphan messages are not errors: they complete
/// successfully and their side effects are deferred.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid announcement signature")]
    InvalidSignature,
    #[error("announcement is for unknown chain {0}")]
    UnknownNetwork(BlockHash),
    #[error("remote channel announcement carries no authentication proof")]
    MissingProof(ShortChannelId),
    #[error("node {0} is not an endpoint of channel {1}")]
    NotOurChannel(PublicKey, ShortChannelId),
    #[error(transparent)]
    Graph(#[from] graph::Error),
    #[error(transparent)]
    Store(#[from] proofs::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::crypto::Error> for Error {
    fn from(_: crate::crypto::Error) -> Self {
        Self::InvalidSignature
    }
}

/// I/O operation to execute at the network level.
#[derive(Debug)]
pub enum Io {
    /// Fan an announcement out to all connected peers except `skip`.
    Broadcast {
        skip: HashSet<PublicKey>,
        msg: Gossip,
    },
    /// Deliver messages to a specific peer.
    Send { to: PublicKey, msgs: Vec<Gossip> },
}

/// Interface to the network.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Outgoing I/O queue.
    io: VecDeque<Io>,
}

impl Outbox {
    pub fn broadcast(&mut self, skip: HashSet<PublicKey>, msg: Gossip) {
        trace!(target: "gossip", "Broadcast {:?} skipping {} peer(s)", msg, skip.len());
        self.io.push_back(Io::Broadcast { skip, msg });
    }

    pub fn send(&mut self, to: PublicKey, msgs: Vec<Gossip>) {
        trace!(target: "gossip", "Send {:?} to {}", msgs, to);
        self.io.push_back(Io::Send { to, msgs });
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.io.pop_front()
    }
}

/// The deterministic core of the gossip engine.
///
/// Owned by exactly one coordinator task; everything here is
/// single-threaded by construction.
#[derive(Debug)]
pub struct Engine<D, G> {
    /// Engine configuration.
    config: Config,
    /// Waiting-proof store.
    db: D,
    /// The channel graph.
    graph: G,
    /// Announcements staged for the next trickle flush.
    batch: Batch,
    /// Our own live announcements, re-staged on every retransmit tick.
    /// Never drained.
    own: Batch,
    /// Channel announcements for blocks we haven't seen yet, keyed by
    /// embedded height.
    premature: BTreeMap<u32, Vec<(ChannelAnnouncement, Source)>>,
    /// Updates for channels we don't know yet, keyed by channel.
    premature_updates: HashMap<ShortChannelId, Vec<(ChannelUpdate, Source)>>,
    /// Best block height seen.
    best_height: u32,
    /// I/O outbox.
    outbox: Outbox,
}

impl<D, G> Engine<D, G>
where
    D: proofs::Store,
    G: Graph,
{
    pub fn new(config: Config, db: D, graph: G) -> Self {
        Self {
            config,
            db,
            graph,
            batch: Batch::default(),
            own: Batch::default(),
            premature: BTreeMap::new(),
            premature_updates: HashMap::new(),
            best_height: 0,
            outbox: Outbox::default(),
        }
    }

    /// Initialize the engine at the given chain height. Call this once,
    /// before anything else.
    ///
    /// Walks the waiting-proof store and re-sends every local partial to
    /// its channel counterparty, so that an exchange interrupted by a
    /// restart or a disconnection eventually completes.
    pub fn initialize(&mut self, best_height: u32) -> Result<(), Error> {
        debug!(target: "gossip", "Init @{best_height}");

        self.best_height = best_height;

        let mut pending = Vec::new();
        self.db.for_all(&mut |proof| pending.push(proof))?;

        for proof in pending.into_iter().filter(|p| p.is_local) {
            self.send_partial(&proof);
        }
        Ok(())
    }

    /// Get I/O outbox.
    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Get configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the channel graph.
    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Get the waiting-proof store.
    pub fn store(&self) -> &D {
        &self.db
    }

    /// Validate and process a single gossip message.
    ///
    /// Invalid messages fail synchronously; everything else succeeds, with
    /// broadcast and persistence effects applied to the engine state and
    /// the outbox.
    pub fn submit(&mut self, msg: Gossip, source: Source) -> Result<(), Error> {
        match msg {
            Gossip::Node(ann) => self.process_node_announcement(ann, source),
            Gossip::Channel(ann) => self.process_channel_announcement(ann, source),
            Gossip::Update(upd) => self.process_channel_update(upd, source),
            Gossip::Proof(sigs) => self.process_announce_signatures(sigs, source),
        }
    }

    /// A new block was connected: admit all channel announcements that just
    /// matured, in ascending height order, and any updates that were
    /// waiting on them.
    pub fn block_connected(&mut self, height: u32) {
        trace!(target: "gossip", "Block connected at height {height}");

        if height <= self.best_height {
            return;
        }
        self.best_height = height;

        let mature = height.saturating_sub(self.config.proof_mature_delta);
        let ready: Vec<u32> = self.premature.range(..=mature).map(|(h, _)| *h).collect();

        for h in ready {
            for (ann, source) in self.premature.remove(&h).unwrap_or_default() {
                debug!(target: "gossip", "Admitting channel {} at height {height}", ann.short_channel_id);

                if let Err(e) = self.process_channel_announcement(ann, source) {
                    warn!(target: "gossip", "Error admitting matured channel announcement: {e}");
                }
            }
        }
    }

    /// Flush the broadcast batch, in channel, update, node order.
    pub fn trickle_tick(&mut self) {
        for (msg, senders) in self.batch.emit() {
            self.outbox.broadcast(senders, msg);
        }
    }

    /// Re-stage our own announcements for the next flush.
    pub fn retransmit_tick(&mut self) {
        let msgs: Vec<_> = self.own.messages().collect();
        if msgs.is_empty() {
            return;
        }
        debug!(target: "gossip", "Retransmitting {} own announcement(s)", msgs.len());

        for msg in msgs {
            self.batch.insert(msg, None);
        }
    }

    /// A peer we were waiting on came online: re-send it every local
    /// partial proof destined for it.
    pub fn peer_online(&mut self, peer: PublicKey) {
        debug!(target: "gossip", "Peer {peer} came online");

        let mut pending = Vec::new();
        if let Err(e) = self.db.for_all(&mut |proof| pending.push(proof)) {
            error!(target: "gossip", "Error reading waiting proofs: {e}");
            return;
        }
        for proof in pending.into_iter().filter(|p| p.is_local) {
            if self.partial_counterparty(&proof) == Some(peer) {
                self.send_partial(&proof);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////

    fn process_node_announcement(
        &mut self,
        ann: NodeAnnouncement,
        source: Source,
    ) -> Result<(), Error> {
        ann.verify()?;

        match self.graph.add_node(ann.clone()) {
            Ok(()) => {
                self.stage(Gossip::Node(ann), &source, source.is_local());
                Ok(())
            }
            Err(graph::Error::Stale) => {
                trace!(target: "gossip", "Ignoring stale node announcement for {}", ann.node_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_channel_announcement(
        &mut self,
        ann: ChannelAnnouncement,
        source: Source,
    ) -> Result<(), Error> {
        if ann.chain_hash != self.config.chain_hash {
            return Err(Error::UnknownNetwork(ann.chain_hash));
        }
        // Only our own funding manager may announce a channel before its
        // proof is assembled.
        if ann.proof.is_none() && !source.is_local() {
            return Err(Error::MissingProof(ann.short_channel_id));
        }
        ann.verify()?;

        let scid = ann.short_channel_id;
        if !scid.is_mature(self.best_height, self.config.proof_mature_delta) {
            debug!(
                target: "gossip",
                "Deferring channel announcement {} until height {} (best {})",
                scid,
                scid.block_height(),
                self.best_height
            );
            self.premature
                .entry(scid.block_height())
                .or_default()
                .push((ann, source));
            return Ok(());
        }

        let proven = ann.proof.is_some();
        match self.graph.add_channel(ann.clone()) {
            Ok(()) => {
                if proven {
                    self.stage(Gossip::Channel(ann), &source, source.is_local());
                }
                self.drain_premature_updates(scid);
                Ok(())
            }
            Err(graph::Error::Stale) => {
                trace!(target: "gossip", "Ignoring duplicate channel announcement for {scid}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_channel_update(&mut self, upd: ChannelUpdate, source: Source) -> Result<(), Error> {
        if upd.chain_hash != self.config.chain_hash {
            return Err(Error::UnknownNetwork(upd.chain_hash));
        }
        let scid = upd.short_channel_id;
        let chan = match self.graph.channel(scid) {
            Ok(chan) => chan,
            Err(graph::Error::NotFound) => {
                debug!(target: "gossip", "Deferring update for unknown channel {scid}");
                self.premature_updates
                    .entry(scid)
                    .or_default()
                    .push((upd, source));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let signer = if upd.direction() == 0 {
            &chan.info.node_1
        } else {
            &chan.info.node_2
        };
        upd.verify(signer)?;

        match self.graph.update_channel(upd.clone()) {
            Ok(()) => {
                // Updates for a channel that has no proof yet are withheld;
                // they are staged together with the announcement once the
                // proof is assembled.
                if chan.info.proof.is_some() {
                    self.stage(Gossip::Update(upd), &source, source.is_local());
                }
                Ok(())
            }
            Err(graph::Error::Stale) => {
                trace!(target: "gossip", "Ignoring stale update for {scid}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_announce_signatures(
        &mut self,
        sigs: AnnounceSignatures,
        source: Source,
    ) -> Result<(), Error> {
        let scid = sigs.short_channel_id;
        let ours = WaitingProof::new(source.is_local(), sigs);

        let chan = match self.graph.channel(scid) {
            Ok(chan) => chan,
            Err(graph::Error::NotFound) => {
                // The channel hasn't been announced to us yet; park the
                // partial until its counterpart shows up.
                debug!(target: "gossip", "Storing orphan partial proof for {scid}");
                self.db.add(&ours)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // The proof is already assembled. If a peer is asking, it lost its
        // half; answer with the full announcement so it can recover.
        if chan.info.proof.is_some() {
            debug!(target: "gossip", "Channel {scid} already has a proof");

            if let Source::Peer(remote) = source {
                self.outbox
                    .send(remote, vec![Gossip::Channel(chan.info.clone())]);
            }
            return Ok(());
        }

        // Our own half is also sent to the counterparty, which needs it to
        // assemble its copy of the proof.
        if ours.is_local {
            self.send_partial(&ours);
        }

        match self.db.get(scid, ours.origin().opposite())? {
            None => {
                self.db.add(&ours)?;
                debug!(
                    target: "gossip",
                    "Waiting for the {} half of the proof for {scid}",
                    if ours.is_local { "remote" } else { "local" },
                );
                Ok(())
            }
            Some(theirs) => {
                let (local, remote) = if ours.is_local {
                    (&ours, &theirs)
                } else {
                    (&theirs, &ours)
                };
                let proof = self.merge_proof(&chan.info, local, remote)?;
                let mut info = chan.info.clone();
                info.proof = Some(proof.clone());
                info.verify()?;

                self.graph.add_proof(scid, proof)?;

                for origin in [Origin::Local, Origin::Remote] {
                    match self.db.remove(scid, origin) {
                        Ok(()) | Err(proofs::Error::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                debug!(target: "gossip", "Assembled full channel proof for {scid}");

                // The channel is ours; announce it and both policies.
                self.stage(Gossip::Channel(info), &source, true);
                for policy in chan.policies.into_iter().flatten() {
                    let own = self.policy_is_ours(&chan.info, &policy);
                    self.stage(Gossip::Update(policy), &source, own);
                }
                Ok(())
            }
        }
    }

    /// Merge the two halves of a proof, ordering signatures by endpoint.
    fn merge_proof(
        &self,
        info: &ChannelAnnouncement,
        local: &WaitingProof,
        remote: &WaitingProof,
    ) -> Result<ChannelAuthProof, Error> {
        let us = self.config.node_id;
        let local_is_1 = if us == info.node_1 {
            true
        } else if us == info.node_2 {
            false
        } else {
            return Err(Error::NotOurChannel(us, info.short_channel_id));
        };
        let (first, second) = if local_is_1 {
            (local, remote)
        } else {
            (remote, local)
        };

        Ok(ChannelAuthProof {
            node_1_sig: first.node_signature,
            node_2_sig: second.node_signature,
            bitcoin_1_sig: first.bitcoin_signature,
            bitcoin_2_sig: second.bitcoin_signature,
        })
    }

    fn policy_is_ours(&self, info: &ChannelAnnouncement, policy: &ChannelUpdate) -> bool {
        let key = if policy.direction() == 0 {
            &info.node_1
        } else {
            &info.node_2
        };
        *key == self.config.node_id
    }

    /// Queue a local partial proof for delivery to the counterparty.
    /// Delivery failures are retried by the runtime when the peer
    /// reconnects.
    fn send_partial(&mut self, proof: &WaitingProof) {
        match self.partial_counterparty(proof) {
            Some(remote) => {
                self.outbox
                    .send(remote, vec![Gossip::Proof(proof.to_announce_signatures())]);
            }
            None => warn!(
                target: "gossip",
                "No counterparty for waiting proof {}; channel unknown or not ours",
                proof.short_channel_id
            ),
        }
    }

    /// The peer a local partial proof should be delivered to.
    fn partial_counterparty(&self, proof: &WaitingProof) -> Option<PublicKey> {
        let chan = self.graph.channel(proof.short_channel_id).ok()?;

        chan.info.counterparty(&self.config.node_id)
    }

    fn drain_premature_updates(&mut self, scid: ShortChannelId) {
        for (upd, source) in self.premature_updates.remove(&scid).unwrap_or_default() {
            if let Err(e) = self.process_channel_update(upd, source) {
                warn!(target: "gossip", "Error applying deferred update for {scid}: {e}");
            }
        }
    }

    /// Stage a message for broadcast. `own` additionally records it for
    /// periodic retransmission.
    fn stage(&mut self, msg: Gossip, source: &Source, own: bool) {
        if own {
            self.own.insert(msg.clone(), None);
        }
        self.batch.insert(msg, source.peer());
    }
}
