//! Tempest node core.
//!
//! The two long-running subsystems of the node: the authenticated gossip
//! engine, which validates, deduplicates, persists and trickle-broadcasts
//! signed network announcements while assembling two-party channel
//! authentication proofs, and the breach arbiter, which watches open
//! channels for revoked-state broadcasts and answers them with a justice
//! transaction.
#![warn(clippy::unwrap_used)]
pub mod arbiter;
pub mod chain;
pub mod gossip;
pub mod graph;
pub mod transport;
pub mod wire;

pub use tempest::{crypto, db, scid};
pub use tempest::{Database, ShortChannelId};

pub mod prelude {
    pub use crate::crypto::{PublicKey, SecretKey, Signature};
    pub use crate::gossip::message::{Gossip, Timestamp};
    pub use crate::ShortChannelId;
    pub use localtime::{LocalDuration, LocalTime};
}
