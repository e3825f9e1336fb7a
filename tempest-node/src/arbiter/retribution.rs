//! Retribution records.
//!
//! Everything needed to reconstruct a justice transaction after a restart
//! is captured here and persisted the moment a breach is detected. A
//! record exists for exactly as long as the justice transaction has not
//! confirmed.
use std::io;

use sqlite as sql;
use thiserror::Error;

use bitcoin::{OutPoint, ScriptBuf, Txid};

use crate::crypto::PublicKey;
use crate::wire::{self, Decode, Encode};
use crate::Database;

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// A record codec error.
    #[error("codec error: {0}")]
    Wire(#[from] wire::Error),
    /// The record being removed does not exist.
    #[error("retribution not found")]
    NotFound,
}

/// What the wallet needs to sign for one breached output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignDescriptor {
    /// Key the signature must verify under.
    pub pubkey: PublicKey,
    /// Script code committed to by the signature. For key-spend outputs
    /// this is the implied pay-to-pubkey-hash script; for script spends,
    /// the witness script itself.
    pub witness_script: ScriptBuf,
    /// Value of the output being spent.
    pub value: u64,
}

impl Encode for SignDescriptor {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.pubkey.encode(writer)?;
        n += self.witness_script.encode(writer)?;
        n += self.value.encode(writer)?;

        Ok(n)
    }
}

impl Decode for SignDescriptor {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let pubkey = PublicKey::decode(reader)?;
        let witness_script = ScriptBuf::decode(reader)?;
        let value = u64::decode(reader)?;

        Ok(Self {
            pubkey,
            witness_script,
            value,
        })
    }
}

/// How a breached output is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessType {
    /// The counterparty's commitment output to us: a plain p2wkh spend
    /// with no delay.
    NoDelayCommit = 0,
    /// The revoked to-self output, spent through the revocation clause.
    RevokedCommit = 1,
    /// An HTLC offered by the counterparty, claimed with the revocation
    /// key.
    HtlcOffered = 2,
    /// An HTLC accepted by the counterparty, claimed with the revocation
    /// key.
    HtlcAccepted = 3,
}

impl WitnessType {
    pub fn from_u16(raw: u16) -> Result<Self, wire::Error> {
        match raw {
            0 => Ok(Self::NoDelayCommit),
            1 => Ok(Self::RevokedCommit),
            2 => Ok(Self::HtlcOffered),
            3 => Ok(Self::HtlcAccepted),
            other => Err(wire::Error::UnknownWitnessType(other)),
        }
    }
}

/// A single output of the revoked commitment that the justice transaction
/// will sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreachedOutput {
    /// Output value, in satoshis.
    pub amount: u64,
    /// Location of the output.
    pub outpoint: OutPoint,
    /// Signing material.
    pub sign_descriptor: SignDescriptor,
    /// Claim path.
    pub witness_type: WitnessType,
    /// Whether the claim goes through a second-level transaction.
    pub two_stage_claim: bool,
}

impl Encode for BreachedOutput {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.amount.encode(writer)?;
        n += self.outpoint.encode(writer)?;
        n += self.sign_descriptor.encode(writer)?;
        n += (self.witness_type as u16).encode(writer)?;
        n += u8::from(self.two_stage_claim).encode(writer)?;

        Ok(n)
    }
}

impl Decode for BreachedOutput {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let amount = u64::decode(reader)?;
        let outpoint = OutPoint::decode(reader)?;
        let sign_descriptor = SignDescriptor::decode(reader)?;
        let witness_type = WitnessType::from_u16(u16::decode(reader)?)?;
        let two_stage_claim = u8::decode(reader)? != 0;

        Ok(Self {
            amount,
            outpoint,
            sign_descriptor,
            witness_type,
            two_stage_claim,
        })
    }
}

/// The persisted state of one in-flight justice workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetributionInfo {
    /// The revoked commitment transaction broadcast by the counterparty.
    pub commit_txid: Txid,
    /// Funding outpoint of the breached channel.
    pub channel_point: OutPoint,
    /// Commitment output paying to us.
    pub self_output: BreachedOutput,
    /// The revoked to-self output.
    pub revoked_output: BreachedOutput,
    /// Outstanding HTLC outputs.
    pub htlc_outputs: Vec<BreachedOutput>,
}

impl RetributionInfo {
    /// All outputs swept by the justice transaction, in input order.
    pub fn breached_outputs(&self) -> impl Iterator<Item = &BreachedOutput> {
        [&self.self_output, &self.revoked_output]
            .into_iter()
            .chain(self.htlc_outputs.iter())
    }

    /// Total breached value, in satoshis.
    pub fn total_amount(&self) -> u64 {
        self.breached_outputs().map(|o| o.amount).sum()
    }
}

impl Encode for RetributionInfo {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.commit_txid.encode(writer)?;
        n += self.channel_point.encode(writer)?;
        n += self.self_output.encode(writer)?;
        n += self.revoked_output.encode(writer)?;
        n += wire::write_varint(self.htlc_outputs.len() as u64, writer)?;

        for htlc in &self.htlc_outputs {
            n += htlc.encode(writer)?;
        }
        Ok(n)
    }
}

impl Decode for RetributionInfo {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let commit_txid = Txid::decode(reader)?;
        let channel_point = OutPoint::decode(reader)?;
        let self_output = BreachedOutput::decode(reader)?;
        let revoked_output = BreachedOutput::decode(reader)?;

        let count = wire::read_varint(reader)?;
        let mut htlc_outputs = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            htlc_outputs.push(BreachedOutput::decode(reader)?);
        }

        Ok(Self {
            commit_txid,
            channel_point,
            self_output,
            revoked_output,
            htlc_outputs,
        })
    }
}

/// Retribution store.
pub trait Store {
    /// Persist a retribution, replacing any record for the same channel.
    fn add(&mut self, info: &RetributionInfo) -> Result<(), Error>;

    /// Delete the record for the given channel.
    ///
    /// Returns [`Error::NotFound`] if there was nothing to delete.
    fn remove(&mut self, channel_point: &OutPoint) -> Result<(), Error>;

    /// Run `f` over every stored retribution.
    fn for_all(&self, f: &mut dyn FnMut(RetributionInfo)) -> Result<(), Error>;
}

impl Store for Database {
    fn add(&mut self, info: &RetributionInfo) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO retributions (channel_point, data)
             VALUES (?1, ?2)
             ON CONFLICT DO UPDATE SET data = ?2",
        )?;
        stmt.bind((1, wire::serialize(&info.channel_point).as_slice()))?;
        stmt.bind((2, wire::serialize(info).as_slice()))?;
        stmt.next()?;

        Ok(())
    }

    fn remove(&mut self, channel_point: &OutPoint) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("DELETE FROM retributions WHERE channel_point = ?1")?;

        stmt.bind((1, wire::serialize(channel_point).as_slice()))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn for_all(&self, f: &mut dyn FnMut(RetributionInfo)) -> Result<(), Error> {
        let stmt = self.db.prepare("SELECT data FROM retributions")?;

        for row in stmt.into_iter() {
            let row = row?;
            let data = row.try_read::<&[u8], _>("data")?;

            f(wire::deserialize(data)?);
        }
        Ok(())
    }
}
