//! Deterministic test fixtures: keys, signed announcements and breach
//! material.
use crossbeam_channel as chan;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};

use crate::arbiter::{BreachEvent, BreachedOutputDetail, Signals};
use crate::arbiter::retribution::{
    BreachedOutput, RetributionInfo, SignDescriptor, WitnessType,
};
use crate::crypto::{self, Digest, KeyPair, PublicKey, SecretKey, Signature, Signer as _};
use crate::gossip::message::{
    Address, AnnounceSignatures, ChannelAnnouncement, ChannelAuthProof, ChannelUpdate, Features,
    Gossip, NodeAnnouncement, Timestamp,
};
use crate::ShortChannelId;

/// A key pair derived from a one-byte seed. Deterministic across runs.
pub fn keypair(seed: u8) -> KeyPair {
    assert_ne!(seed, 0, "the zero key is not a valid secret key");

    KeyPair::new(SecretKey::from_slice(&[seed; 32]).expect("fixture seeds are valid keys"))
}

pub fn scid(height: u32, tx_index: u32, output_index: u16) -> ShortChannelId {
    ShortChannelId::new(height, tx_index, output_index)
}

/// The test chain.
pub fn chain_hash() -> BlockHash {
    BlockHash::all_zeros()
}

pub fn txid(seed: u8) -> Txid {
    Txid::from_byte_array([seed; 32])
}

pub fn outpoint(seed: u8, vout: u32) -> OutPoint {
    OutPoint::new(txid(seed), vout)
}

pub fn alias(name: &str) -> [u8; 32] {
    let mut alias = [0; 32];
    alias[..name.len()].copy_from_slice(name.as_bytes());
    alias
}

/// A signature placeholder for messages still under construction.
fn unsigned() -> Signature {
    crypto::sign(&Digest::hash(b"unsigned"), keypair(1).secret_key())
}

/// A valid, signed node announcement.
pub fn node_announcement(key: &KeyPair, timestamp: Timestamp) -> NodeAnnouncement {
    NodeAnnouncement {
        features: Features::empty(),
        timestamp,
        node_id: key.public_key(),
        alias: alias("tempest"),
        addresses: vec![Address::Ipv4 {
            ip: [127, 0, 0, 1].into(),
            port: 9735,
        }],
        signature: unsigned(),
    }
    .signed(key)
}

/// A channel between two nodes, with all four keys at hand so that any
/// signature the engine checks can be produced.
pub struct Channel {
    /// Node key of the first endpoint (lower public key).
    pub node_1: KeyPair,
    /// Node key of the second endpoint.
    pub node_2: KeyPair,
    /// Funding key of the first endpoint.
    pub bitcoin_1: KeyPair,
    /// Funding key of the second endpoint.
    pub bitcoin_2: KeyPair,
    pub scid: ShortChannelId,
}

/// Create a channel fixture between the nodes seeded `a` and `b`.
/// Endpoints are ordered by public key, as on the wire.
pub fn channel(a: u8, b: u8, scid: ShortChannelId) -> Channel {
    let (ka, kb) = (keypair(a), keypair(b));
    let ((node_1, seed_1), (node_2, seed_2)) =
        if ka.public_key().serialize() < kb.public_key().serialize() {
            ((ka, a), (kb, b))
        } else {
            ((kb, b), (ka, a))
        };

    Channel {
        node_1,
        node_2,
        bitcoin_1: keypair(seed_1.wrapping_add(100)),
        bitcoin_2: keypair(seed_2.wrapping_add(100)),
        scid,
    }
}

impl Channel {
    /// The node key for an endpoint (0 or 1).
    pub fn node_key(&self, endpoint: usize) -> &KeyPair {
        if endpoint == 0 {
            &self.node_1
        } else {
            &self.node_2
        }
    }

    /// The channel announcement, with or without its proof.
    pub fn announcement(&self, proven: bool) -> ChannelAnnouncement {
        let mut ann = ChannelAnnouncement {
            chain_hash: chain_hash(),
            features: Features::empty(),
            short_channel_id: self.scid,
            node_1: self.node_1.public_key(),
            node_2: self.node_2.public_key(),
            bitcoin_1: self.bitcoin_1.public_key(),
            bitcoin_2: self.bitcoin_2.public_key(),
            proof: None,
        };
        if proven {
            let digest = ann.digest();
            ann.proof = Some(ChannelAuthProof {
                node_1_sig: self.node_1.sign(&digest),
                node_2_sig: self.node_2.sign(&digest),
                bitcoin_1_sig: self.bitcoin_1.sign(&digest),
                bitcoin_2_sig: self.bitcoin_2.sign(&digest),
            });
        }
        ann
    }

    /// A signed policy update originated by the given endpoint.
    pub fn update(&self, direction: u8, timestamp: Timestamp) -> ChannelUpdate {
        let upd = ChannelUpdate {
            chain_hash: chain_hash(),
            short_channel_id: self.scid,
            timestamp,
            flags: direction & 1,
            cltv_expiry_delta: 144,
            htlc_minimum_msat: 1_000,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            signature: unsigned(),
        };
        upd.signed(self.node_key(usize::from(direction & 1)))
    }

    /// One endpoint's half of the channel proof.
    pub fn announce_signatures(&self, endpoint: usize) -> AnnounceSignatures {
        let digest = self.announcement(false).digest();
        let (node, bitcoin) = if endpoint == 0 {
            (&self.node_1, &self.bitcoin_1)
        } else {
            (&self.node_2, &self.bitcoin_2)
        };

        AnnounceSignatures {
            short_channel_id: self.scid,
            node_signature: node.sign(&digest),
            bitcoin_signature: bitcoin.sign(&digest),
        }
    }

    /// Everything an engine scenario submits, as `Gossip` values.
    pub fn gossip(&self, proven: bool) -> Gossip {
        Gossip::Channel(self.announcement(proven))
    }
}

/// A sign descriptor for a key-spend (p2wkh) output.
pub fn p2wkh_descriptor(key: &KeyPair, value: u64) -> SignDescriptor {
    let pubkey = bitcoin::PublicKey::new(key.public_key());

    SignDescriptor {
        pubkey: key.public_key(),
        witness_script: bitcoin::ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
        value,
    }
}

/// A sign descriptor for a script-spend output.
pub fn script_descriptor(key: &KeyPair, value: u64) -> SignDescriptor {
    let pubkey = bitcoin::PublicKey::new(key.public_key());

    SignDescriptor {
        pubkey: key.public_key(),
        witness_script: bitcoin::ScriptBuf::new_p2pk(&pubkey),
        value,
    }
}

/// Raw breach material, as the channel state machine would produce it.
pub fn breach_event(commit_seed: u8, key_seed: u8) -> BreachEvent {
    let key = keypair(key_seed);

    BreachEvent {
        commit_txid: txid(commit_seed),
        self_output: BreachedOutputDetail {
            amount: 100_000,
            outpoint: outpoint(commit_seed, 0),
            sign_descriptor: p2wkh_descriptor(&key, 100_000),
        },
        revoked_output: BreachedOutputDetail {
            amount: 200_000,
            outpoint: outpoint(commit_seed, 1),
            sign_descriptor: script_descriptor(&key, 200_000),
        },
        htlc_outputs: vec![],
    }
}

/// A ready-made retribution record, as the watcher would build it from
/// [`breach_event`].
pub fn retribution(commit_seed: u8, key_seed: u8) -> RetributionInfo {
    let event = breach_event(commit_seed, key_seed);
    let output = |detail: BreachedOutputDetail, witness_type| BreachedOutput {
        amount: detail.amount,
        outpoint: detail.outpoint,
        sign_descriptor: detail.sign_descriptor,
        witness_type,
        two_stage_claim: false,
    };

    RetributionInfo {
        commit_txid: event.commit_txid,
        channel_point: outpoint(commit_seed.wrapping_add(50), 0),
        self_output: output(event.self_output, WitnessType::NoDelayCommit),
        revoked_output: output(event.revoked_output, WitnessType::RevokedCommit),
        htlc_outputs: vec![],
    }
}

/// The sending halves of a watched channel's signals.
pub struct SignalSenders {
    pub settled: chan::Sender<()>,
    pub unilateral_close: chan::Sender<Txid>,
    pub breach: chan::Sender<BreachEvent>,
}

/// A channel signal pair: the channel object's senders and the watcher's
/// receivers.
pub fn signals() -> (SignalSenders, Signals) {
    let (settled_tx, settled_rx) = chan::unbounded();
    let (unilateral_tx, unilateral_rx) = chan::unbounded();
    let (breach_tx, breach_rx) = chan::unbounded();

    (
        SignalSenders {
            settled: settled_tx,
            unilateral_close: unilateral_tx,
            breach: breach_tx,
        },
        Signals {
            settled: settled_rx,
            unilateral_close: unilateral_rx,
            breach: breach_rx,
        },
    )
}

/// Helper for asserting on keys in senders-sets.
pub fn pk(seed: u8) -> PublicKey {
    keypair(seed).public_key()
}
