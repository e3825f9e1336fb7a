//! Tempest base library.
//!
//! Shared foundations for the node subsystems: secp256k1 key material and
//! signature verification, the short-channel-id, and the SQLite-backed
//! node database that the gossip and arbiter stores build on.
pub mod crypto;
pub mod db;
pub mod scid;

pub use crypto::{PublicKey, SecretKey, Signature};
pub use db::Database;
pub use scid::ShortChannelId;
