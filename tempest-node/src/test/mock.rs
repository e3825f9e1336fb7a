//! Mock collaborators: graph, transport, notifier, wallet, switch and
//! channel database.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel as chan;

use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};

use crate::arbiter::retribution::SignDescriptor;
use crate::arbiter::{Channels, CloseSummary, SinkError, Switch, Wallet};
use crate::chain::{BlockEpoch, Notifier, SpendDetail, TxConfirmation};
use crate::crypto::{self, Digest, KeyPair, PublicKey, Signature, Signer as _};
use crate::gossip::message::{ChannelUpdate, Gossip, NodeAnnouncement};
use crate::graph::{self, Channel, Graph};
use crate::test::fixtures;
use crate::transport;
use crate::transport::Transport;
use crate::ShortChannelId;

/// In-memory channel graph with the monotonicity rules of the real one.
#[derive(Default)]
pub struct MockGraph {
    inner: Mutex<GraphInner>,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<PublicKey, NodeAnnouncement>,
    channels: HashMap<ShortChannelId, Channel>,
    height: u32,
}

impl MockGraph {
    pub fn new(height: u32) -> Self {
        let graph = Self::default();
        graph.set_height(height);
        graph
    }

    pub fn set_height(&self, height: u32) {
        self.inner.lock().unwrap().height = height;
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }

    /// Number of directional policies across all channels.
    pub fn policy_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .channels
            .values()
            .map(|c| c.policies.iter().flatten().count())
            .sum()
    }
}

impl Graph for MockGraph {
    fn add_node(&self, ann: NodeAnnouncement) -> Result<(), graph::Error> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(prev) = inner.nodes.get(&ann.node_id) {
            if ann.timestamp <= prev.timestamp {
                return Err(graph::Error::Stale);
            }
        }
        inner.nodes.insert(ann.node_id, ann);
        Ok(())
    }

    fn add_channel(&self, ann: crate::gossip::message::ChannelAnnouncement) -> Result<(), graph::Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.channels.contains_key(&ann.short_channel_id) {
            return Err(graph::Error::Stale);
        }
        inner.channels.insert(
            ann.short_channel_id,
            Channel {
                info: ann,
                policies: [None, None],
            },
        );
        Ok(())
    }

    fn update_channel(&self, upd: ChannelUpdate) -> Result<(), graph::Error> {
        let mut inner = self.inner.lock().unwrap();
        let chan = inner
            .channels
            .get_mut(&upd.short_channel_id)
            .ok_or(graph::Error::NotFound)?;
        let slot = &mut chan.policies[upd.direction()];

        if let Some(prev) = slot {
            if upd.timestamp <= prev.timestamp {
                return Err(graph::Error::Stale);
            }
        }
        *slot = Some(upd);
        Ok(())
    }

    fn add_proof(
        &self,
        scid: ShortChannelId,
        proof: crate::gossip::message::ChannelAuthProof,
    ) -> Result<(), graph::Error> {
        let mut inner = self.inner.lock().unwrap();
        let chan = inner.channels.get_mut(&scid).ok_or(graph::Error::NotFound)?;

        chan.info.proof = Some(proof);
        Ok(())
    }

    fn channel(&self, scid: ShortChannelId) -> Result<Channel, graph::Error> {
        self.inner
            .lock()
            .unwrap()
            .channels
            .get(&scid)
            .cloned()
            .ok_or(graph::Error::NotFound)
    }

    fn node(&self, id: &PublicKey) -> Result<Option<NodeAnnouncement>, graph::Error> {
        Ok(self.inner.lock().unwrap().nodes.get(id).cloned())
    }

    fn best_height(&self) -> Result<u32, graph::Error> {
        Ok(self.inner.lock().unwrap().height)
    }
}

/// Recording transport with injectable delivery failures.
#[derive(Default)]
pub struct MockTransport {
    broadcasts: Mutex<Vec<(HashSet<PublicKey>, Gossip)>>,
    sent: Mutex<Vec<(PublicKey, Vec<Gossip>)>>,
    online: Mutex<Vec<(PublicKey, chan::Sender<PublicKey>)>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `send_to_peer` fail until turned off again.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<(HashSet<PublicKey>, Gossip)> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(PublicKey, Vec<Gossip>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of armed online notifications for the given peer.
    pub fn online_registrations(&self, peer: &PublicKey) -> usize {
        self.online
            .lock()
            .unwrap()
            .iter()
            .filter(|(pk, _)| pk == peer)
            .count()
    }

    /// Simulate the peer connecting: fire and discard its registrations.
    pub fn connect(&self, peer: PublicKey) {
        let mut online = self.online.lock().unwrap();

        online.retain(|(pk, tx)| {
            if *pk == peer {
                tx.send(peer).ok();
                false
            } else {
                true
            }
        });
    }
}

impl Transport for MockTransport {
    fn broadcast(&self, skip: &HashSet<PublicKey>, msg: Gossip) {
        self.broadcasts.lock().unwrap().push((skip.clone(), msg));
    }

    fn send_to_peer(&self, peer: PublicKey, msgs: Vec<Gossip>) -> Result<(), transport::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(transport::Error::NotConnected(peer));
        }
        self.sent.lock().unwrap().push((peer, msgs));
        Ok(())
    }

    fn notify_when_online(&self, peer: PublicKey, online: chan::Sender<PublicKey>) {
        self.online.lock().unwrap().push((peer, online));
    }
}

/// Manually driven chain notifier.
#[derive(Default)]
pub struct MockNotifier {
    epochs: Mutex<Vec<chan::Sender<BlockEpoch>>>,
    confirmations: Mutex<Vec<(Txid, chan::Sender<TxConfirmation>)>>,
    spends: Mutex<Vec<(OutPoint, chan::Sender<SpendDetail>)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a block epoch to all subscribers.
    pub fn notify_block(&self, height: u32) {
        let epoch = BlockEpoch {
            height,
            hash: fixtures::chain_hash(),
        };
        self.epochs
            .lock()
            .unwrap()
            .retain(|tx| tx.send(epoch).is_ok());
    }

    /// Confirm a transaction, firing and discarding its subscriptions.
    pub fn confirm(&self, txid: Txid, height: u32) {
        let conf = TxConfirmation {
            txid,
            height,
            hash: fixtures::chain_hash(),
        };
        self.confirmations.lock().unwrap().retain(|(id, tx)| {
            if *id == txid {
                tx.send(conf).ok();
                false
            } else {
                true
            }
        });
    }

    /// Number of unconfirmed subscriptions for the given transaction.
    pub fn confirmation_subscriptions(&self, txid: &Txid) -> usize {
        self.confirmations
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == txid)
            .count()
    }
}

impl Notifier for MockNotifier {
    fn block_epochs(&self) -> chan::Receiver<BlockEpoch> {
        let (tx, rx) = chan::unbounded();
        self.epochs.lock().unwrap().push(tx);
        rx
    }

    fn register_confirmation(
        &self,
        txid: Txid,
        _n_confs: u32,
        _since_height: u32,
    ) -> chan::Receiver<TxConfirmation> {
        let (tx, rx) = chan::unbounded();
        self.confirmations.lock().unwrap().push((txid, tx));
        rx
    }

    fn register_spend(&self, outpoint: OutPoint, _since_height: u32) -> chan::Receiver<SpendDetail> {
        let (tx, rx) = chan::unbounded();
        self.spends.lock().unwrap().push((outpoint, tx));
        rx
    }
}

/// Wallet with a real signing key and a recording broadcaster.
pub struct MockWallet {
    key: KeyPair,
    script: ScriptBuf,
    published: Mutex<Vec<Transaction>>,
    fail_publish: AtomicBool,
}

impl MockWallet {
    pub fn new(seed: u8) -> Self {
        let key = fixtures::keypair(seed);
        let pubkey = bitcoin::PublicKey::new(key.public_key());
        let script = ScriptBuf::new_v0_p2wpkh(
            &pubkey
                .wpubkey_hash()
                .expect("fixture keys are compressed"),
        );

        Self {
            key,
            script,
            published: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
        }
    }

    /// The wallet's sweep script.
    pub fn script(&self) -> ScriptBuf {
        self.script.clone()
    }

    pub fn published(&self) -> Vec<Transaction> {
        self.published.lock().unwrap().clone()
    }

    /// Make `publish` fail until turned off again.
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

impl Wallet for MockWallet {
    fn sweep_script(&self) -> Result<ScriptBuf, SinkError> {
        Ok(self.script.clone())
    }

    fn sign_output(
        &self,
        tx: &Transaction,
        input: usize,
        desc: &SignDescriptor,
    ) -> Result<Signature, SinkError> {
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .segwit_signature_hash(
                input,
                &desc.witness_script,
                desc.value,
                EcdsaSighashType::All,
            )
            .map_err(SinkError::new)?;
        let digest = Digest::from_bytes(sighash.to_byte_array());

        Ok(crypto::sign(&digest, self.key.secret_key()))
    }

    fn publish(&self, tx: &Transaction) -> Result<(), SinkError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SinkError::new("mempool unreachable"));
        }
        // Re-announcing a known transaction is fine; record it regardless.
        self.published.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

/// Recording HTLC switch.
#[derive(Default)]
pub struct MockSwitch {
    closed: Mutex<Vec<OutPoint>>,
}

impl MockSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed_links(&self) -> Vec<OutPoint> {
        self.closed.lock().unwrap().clone()
    }
}

impl Switch for MockSwitch {
    fn close_breached_link(&self, channel_point: &OutPoint) {
        self.closed.lock().unwrap().push(*channel_point);
    }
}

/// Recording channel database.
#[derive(Default)]
pub struct MockChannels {
    summaries: Mutex<Vec<CloseSummary>>,
    fully_closed: Mutex<Vec<OutPoint>>,
}

impl MockChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<CloseSummary> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn fully_closed(&self) -> Vec<OutPoint> {
        self.fully_closed.lock().unwrap().clone()
    }
}

impl Channels for MockChannels {
    fn close_channel(&self, summary: CloseSummary) -> Result<(), SinkError> {
        self.summaries.lock().unwrap().push(summary);
        Ok(())
    }

    fn mark_fully_closed(&self, channel_point: &OutPoint) -> Result<(), SinkError> {
        self.fully_closed.lock().unwrap().push(*channel_point);
        Ok(())
    }
}
