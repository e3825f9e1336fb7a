//! Gossip messages.
//!
//! The three announcement kinds relayed between peers, plus the
//! `AnnounceSignatures` partial proof the two endpoints of a channel
//! exchange to assemble the channel's authentication proof.
//!
//! Signatures commit to the double-SHA256 of a message's canonical
//! encoding with the signature fields left out.
use std::{fmt, io, net};

use bitcoin::BlockHash;

use crate::crypto::{self, Digest, PublicKey, Signature, Signer};
use crate::wire::{self, Encode};
use crate::ShortChannelId;

/// Announcement timestamp, in Unix seconds. Replacement of a live
/// announcement requires a strictly greater value.
pub type Timestamp = u32;

/// Advertized feature bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(u64);

impl Features {
    pub fn empty() -> Self {
        Self(0)
    }
}

impl From<u64> for Features {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

impl Encode for Features {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.encode(writer)
    }
}

/// Peer public network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4 { ip: net::Ipv4Addr, port: u16 },
    Ipv6 { ip: net::Ipv6Addr, port: u16 },
}

impl From<net::SocketAddr> for Address {
    fn from(other: net::SocketAddr) -> Self {
        let port = other.port();

        match other.ip() {
            net::IpAddr::V4(ip) => Self::Ipv4 { ip, port },
            net::IpAddr::V6(ip) => Self::Ipv6 { ip, port },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 { ip, port } => write!(f, "{}:{}", ip, port),
            Self::Ipv6 { ip, port } => write!(f, "{}:{}", ip, port),
        }
    }
}

impl Encode for Address {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Ipv4 { ip, port } => {
                let mut n = 1u8.encode(writer)?;
                n += ip.octets().encode(writer)?;
                n += port.encode(writer)?;

                Ok(n)
            }
            Self::Ipv6 { ip, port } => {
                let mut n = 2u8.encode(writer)?;
                n += ip.octets().encode(writer)?;
                n += port.encode(writer)?;

                Ok(n)
            }
        }
    }
}

/// Node announcing itself to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnouncement {
    /// Advertized features.
    pub features: Features,
    /// Monotonic timestamp.
    pub timestamp: Timestamp,
    /// The announced node.
    pub node_id: PublicKey,
    /// Non-unique alias, NUL-padded.
    pub alias: [u8; 32],
    /// Announced addresses.
    pub addresses: Vec<Address>,
    /// Signature by the node key over the announcement.
    pub signature: Signature,
}

impl NodeAnnouncement {
    fn payload<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.features.encode(writer)?;
        n += self.timestamp.encode(writer)?;
        n += self.node_id.encode(writer)?;
        n += self.alias.encode(writer)?;
        n += self.addresses.as_slice().encode(writer)?;

        Ok(n)
    }

    /// The digest the announcement signature commits to.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::new();
        #[allow(clippy::unwrap_used)]
        // Writing to a vector never fails.
        self.payload(&mut buf).unwrap();

        Digest::hash(&buf)
    }

    /// Re-sign this announcement, taking the node identity from the signer.
    pub fn signed(mut self, signer: &impl Signer) -> Self {
        self.node_id = signer.public_key();
        self.signature = signer.sign(&self.digest());
        self
    }

    /// Verify the announcement signature.
    pub fn verify(&self) -> Result<(), crypto::Error> {
        crypto::verify(&self.digest(), &self.signature, &self.node_id)
    }
}

/// The four-signature bundle authenticating a channel announcement: both
/// endpoints sign with their node key and their funding ("bitcoin") key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuthProof {
    pub node_1_sig: Signature,
    pub node_2_sig: Signature,
    pub bitcoin_1_sig: Signature,
    pub bitcoin_2_sig: Signature,
}

/// A channel announced to the network.
///
/// A local, not-yet-proven channel carries no proof and is never relayed;
/// announcements received from the network must carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAnnouncement {
    /// Chain the channel was funded on.
    pub chain_hash: BlockHash,
    /// Channel features.
    pub features: Features,
    /// Location of the funding output.
    pub short_channel_id: ShortChannelId,
    /// First endpoint, ordered by key.
    pub node_1: PublicKey,
    /// Second endpoint.
    pub node_2: PublicKey,
    /// First endpoint's funding key.
    pub bitcoin_1: PublicKey,
    /// Second endpoint's funding key.
    pub bitcoin_2: PublicKey,
    /// Authentication proof, once assembled.
    pub proof: Option<ChannelAuthProof>,
}

impl ChannelAnnouncement {
    fn payload<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.chain_hash.encode(writer)?;
        n += self.features.encode(writer)?;
        n += self.short_channel_id.encode(writer)?;
        n += self.node_1.encode(writer)?;
        n += self.node_2.encode(writer)?;
        n += self.bitcoin_1.encode(writer)?;
        n += self.bitcoin_2.encode(writer)?;

        Ok(n)
    }

    /// The digest all four proof signatures commit to.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::new();
        #[allow(clippy::unwrap_used)]
        // Writing to a vector never fails.
        self.payload(&mut buf).unwrap();

        Digest::hash(&buf)
    }

    /// The other endpoint of the channel, if `us` is one of them.
    pub fn counterparty(&self, us: &PublicKey) -> Option<PublicKey> {
        if *us == self.node_1 {
            Some(self.node_2)
        } else if *us == self.node_2 {
            Some(self.node_1)
        } else {
            None
        }
    }

    /// Verify the authentication proof against all four keys.
    pub fn verify(&self) -> Result<(), crypto::Error> {
        let Some(proof) = &self.proof else {
            return Ok(());
        };
        let digest = self.digest();

        crypto::verify(&digest, &proof.node_1_sig, &self.node_1)?;
        crypto::verify(&digest, &proof.node_2_sig, &self.node_2)?;
        crypto::verify(&digest, &proof.bitcoin_1_sig, &self.bitcoin_1)?;
        crypto::verify(&digest, &proof.bitcoin_2_sig, &self.bitcoin_2)?;

        Ok(())
    }
}

/// A directional routing policy update for an announced channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    /// Chain the channel was funded on.
    pub chain_hash: BlockHash,
    /// Channel the policy applies to.
    pub short_channel_id: ShortChannelId,
    /// Monotonic timestamp.
    pub timestamp: Timestamp,
    /// Bit 0 selects the originating endpoint (0 = `node_1`, 1 = `node_2`).
    pub flags: u8,
    /// Blocks subtracted from an HTLC's expiry when forwarded.
    pub cltv_expiry_delta: u16,
    /// Smallest HTLC the endpoint will route, in millisatoshis.
    pub htlc_minimum_msat: u64,
    /// Flat forwarding fee, in millisatoshis.
    pub fee_base_msat: u32,
    /// Proportional forwarding fee, in millionths.
    pub fee_proportional_millionths: u32,
    /// Signature by the originating endpoint's node key.
    pub signature: Signature,
}

impl ChannelUpdate {
    /// Which endpoint's policy this is: 0 for `node_1`, 1 for `node_2`.
    pub fn direction(&self) -> usize {
        (self.flags & 1) as usize
    }

    fn payload<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.chain_hash.encode(writer)?;
        n += self.short_channel_id.encode(writer)?;
        n += self.timestamp.encode(writer)?;
        n += self.flags.encode(writer)?;
        n += self.cltv_expiry_delta.encode(writer)?;
        n += self.htlc_minimum_msat.encode(writer)?;
        n += self.fee_base_msat.encode(writer)?;
        n += self.fee_proportional_millionths.encode(writer)?;

        Ok(n)
    }

    /// The digest the update signature commits to.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::new();
        #[allow(clippy::unwrap_used)]
        // Writing to a vector never fails.
        self.payload(&mut buf).unwrap();

        Digest::hash(&buf)
    }

    /// Re-sign this update with the originating endpoint's node key.
    pub fn signed(mut self, signer: &impl Signer) -> Self {
        self.signature = signer.sign(&self.digest());
        self
    }

    /// Verify the update signature under the given node key.
    pub fn verify(&self, key: &PublicKey) -> Result<(), crypto::Error> {
        crypto::verify(&self.digest(), &self.signature, key)
    }
}

/// One endpoint's half of a channel authentication proof: its node and
/// funding signatures over the channel announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceSignatures {
    /// Channel the signatures are for.
    pub short_channel_id: ShortChannelId,
    /// Signature by the sending endpoint's node key.
    pub node_signature: Signature,
    /// Signature by the sending endpoint's funding key.
    pub bitcoin_signature: Signature,
}

/// A gossip message submitted to the engine.
#[derive(Clone, PartialEq, Eq)]
pub enum Gossip {
    /// Node announcement.
    Node(NodeAnnouncement),
    /// Channel announcement.
    Channel(ChannelAnnouncement),
    /// Channel policy update.
    Update(ChannelUpdate),
    /// Partial channel proof.
    Proof(AnnounceSignatures),
}

impl From<NodeAnnouncement> for Gossip {
    fn from(ann: NodeAnnouncement) -> Self {
        Self::Node(ann)
    }
}

impl From<ChannelAnnouncement> for Gossip {
    fn from(ann: ChannelAnnouncement) -> Self {
        Self::Channel(ann)
    }
}

impl From<ChannelUpdate> for Gossip {
    fn from(upd: ChannelUpdate) -> Self {
        Self::Update(upd)
    }
}

impl From<AnnounceSignatures> for Gossip {
    fn from(proof: AnnounceSignatures) -> Self {
        Self::Proof(proof)
    }
}

impl fmt::Debug for Gossip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(ann) => write!(f, "Node({}, t={})", ann.node_id, ann.timestamp),
            Self::Channel(ann) => write!(f, "Channel({})", ann.short_channel_id),
            Self::Update(upd) => write!(
                f,
                "Update({}, dir={}, t={})",
                upd.short_channel_id,
                upd.direction(),
                upd.timestamp
            ),
            Self::Proof(p) => write!(f, "Proof({})", p.short_channel_id),
        }
    }
}

impl Encode for AnnounceSignatures {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.short_channel_id.encode(writer)?;
        n += self.node_signature.encode(writer)?;
        n += self.bitcoin_signature.encode(writer)?;

        Ok(n)
    }
}

impl wire::Decode for AnnounceSignatures {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let short_channel_id = wire::Decode::decode(reader)?;
        let node_signature = wire::Decode::decode(reader)?;
        let bitcoin_signature = wire::Decode::decode(reader)?;

        Ok(Self {
            short_channel_id,
            node_signature,
            bitcoin_signature,
        })
    }
}
