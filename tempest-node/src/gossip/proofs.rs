//! Waiting channel proofs.
//!
//! Half-assembled channel authentication proofs are persisted until the
//! counterpart half arrives, so that a restart never loses our side of an
//! exchange that is still in flight.
use std::io;

use sqlite as sql;
use thiserror::Error;

use crate::crypto::Signature;
use crate::gossip::message::AnnounceSignatures;
use crate::wire::{self, Decode, Encode};
use crate::{Database, ShortChannelId};

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// A record codec error.
    #[error("codec error: {0}")]
    Wire(#[from] wire::Error),
    /// The proof being removed does not exist. Safe to ignore.
    #[error("waiting proof not found")]
    NotFound,
}

/// Which endpoint of the exchange a partial proof came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Remote = 0,
    Local = 1,
}

impl Origin {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Remote => Self::Local,
            Self::Local => Self::Remote,
        }
    }
}

/// One half of a channel authentication proof, waiting for its counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingProof {
    /// Whether this half was produced by our own funding manager.
    pub is_local: bool,
    /// Channel the proof is for.
    pub short_channel_id: ShortChannelId,
    /// The endpoint's node-key signature.
    pub node_signature: Signature,
    /// The endpoint's funding-key signature.
    pub bitcoin_signature: Signature,
}

impl WaitingProof {
    pub fn new(is_local: bool, sigs: AnnounceSignatures) -> Self {
        Self {
            is_local,
            short_channel_id: sigs.short_channel_id,
            node_signature: sigs.node_signature,
            bitcoin_signature: sigs.bitcoin_signature,
        }
    }

    pub fn origin(&self) -> Origin {
        if self.is_local {
            Origin::Local
        } else {
            Origin::Remote
        }
    }

    /// Turn the stored half back into the message it arrived as.
    pub fn to_announce_signatures(&self) -> AnnounceSignatures {
        AnnounceSignatures {
            short_channel_id: self.short_channel_id,
            node_signature: self.node_signature,
            bitcoin_signature: self.bitcoin_signature,
        }
    }
}

impl Encode for WaitingProof {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = (self.origin() as u8).encode(writer)?;
        n += self.short_channel_id.encode(writer)?;
        n += self.node_signature.encode(writer)?;
        n += self.bitcoin_signature.encode(writer)?;

        Ok(n)
    }
}

impl Decode for WaitingProof {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let origin = u8::decode(reader)?;
        let short_channel_id = ShortChannelId::decode(reader)?;
        let node_signature = Signature::decode(reader)?;
        let bitcoin_signature = Signature::decode(reader)?;

        Ok(Self {
            is_local: origin == Origin::Local as u8,
            short_channel_id,
            node_signature,
            bitcoin_signature,
        })
    }
}

/// Waiting-proof store.
pub trait Store {
    /// Persist a partial proof, replacing any previous one under the same
    /// `(channel, origin)` key.
    fn add(&mut self, proof: &WaitingProof) -> Result<(), Error>;

    /// Fetch the partial proof under the given key.
    fn get(&self, scid: ShortChannelId, origin: Origin) -> Result<Option<WaitingProof>, Error>;

    /// Delete the partial proof under the given key.
    ///
    /// Returns [`Error::NotFound`] if there was nothing to delete; callers
    /// merging a proof may ignore it.
    fn remove(&mut self, scid: ShortChannelId, origin: Origin) -> Result<(), Error>;

    /// Run `f` over every stored partial proof.
    fn for_all(&self, f: &mut dyn FnMut(WaitingProof)) -> Result<(), Error>;
}

impl Store for Database {
    fn add(&mut self, proof: &WaitingProof) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO waiting_proofs (scid, origin, data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO UPDATE SET data = ?3",
        )?;
        stmt.bind((1, u64::from(proof.short_channel_id) as i64))?;
        stmt.bind((2, proof.origin() as i64))?;
        stmt.bind((3, wire::serialize(proof).as_slice()))?;
        stmt.next()?;

        Ok(())
    }

    fn get(&self, scid: ShortChannelId, origin: Origin) -> Result<Option<WaitingProof>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT data FROM waiting_proofs WHERE scid = ?1 AND origin = ?2")?;

        stmt.bind((1, u64::from(scid) as i64))?;
        stmt.bind((2, origin as i64))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            let data = row.try_read::<&[u8], _>("data")?;

            Ok(Some(wire::deserialize(data)?))
        } else {
            Ok(None)
        }
    }

    fn remove(&mut self, scid: ShortChannelId, origin: Origin) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("DELETE FROM waiting_proofs WHERE scid = ?1 AND origin = ?2")?;

        stmt.bind((1, u64::from(scid) as i64))?;
        stmt.bind((2, origin as i64))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn for_all(&self, f: &mut dyn FnMut(WaitingProof)) -> Result<(), Error> {
        let stmt = self
            .db
            .prepare("SELECT data FROM waiting_proofs ORDER BY scid, origin")?;

        for row in stmt.into_iter() {
            let row = row?;
            let data = row.try_read::<&[u8], _>("data")?;

            f(wire::deserialize(data)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fixtures;

    fn proof(scid: ShortChannelId, is_local: bool) -> WaitingProof {
        let chan = fixtures::channel(1, 2, scid);
        WaitingProof::new(is_local, chan.announce_signatures(0))
    }

    #[test]
    fn test_add_get_remove() {
        let mut db = Database::memory().unwrap();
        let scid = fixtures::scid(100, 1, 0);
        let local = proof(scid, true);

        db.add(&local).unwrap();
        assert_eq!(db.get(scid, Origin::Local).unwrap(), Some(local.clone()));
        assert_eq!(db.get(scid, Origin::Remote).unwrap(), None);

        db.remove(scid, Origin::Local).unwrap();
        assert_eq!(db.get(scid, Origin::Local).unwrap(), None);
        assert!(matches!(
            db.remove(scid, Origin::Local),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_replace_under_same_key() {
        let mut db = Database::memory().unwrap();
        let scid = fixtures::scid(100, 1, 0);

        db.add(&proof(scid, false)).unwrap();
        db.add(&proof(scid, false)).unwrap();

        let mut count = 0;
        db.for_all(&mut |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_for_all_both_origins() {
        let mut db = Database::memory().unwrap();
        let scid = fixtures::scid(100, 1, 0);

        db.add(&proof(scid, true)).unwrap();
        db.add(&proof(scid, false)).unwrap();
        db.add(&proof(fixtures::scid(101, 1, 0), true)).unwrap();

        let mut locals = 0;
        let mut remotes = 0;
        db.for_all(&mut |p| {
            if p.is_local {
                locals += 1;
            } else {
                remotes += 1;
            }
        })
        .unwrap();

        assert_eq!((locals, remotes), (2, 1));
    }
}
