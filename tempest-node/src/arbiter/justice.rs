//! Justice transaction construction.
//!
//! A justice transaction sweeps every output of a revoked commitment into
//! a single wallet-owned output. Inputs are finalized one by one through
//! the witness dispatch below, keyed by each output's claim path.
use log::*;
use thiserror::Error;

use bitcoin::absolute::LockTime;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::arbiter::retribution::{RetributionInfo, SignDescriptor, WitnessType};
use crate::arbiter::{SinkError, Wallet};

/// Flat fee reserved for the justice transaction, in satoshis.
///
/// TODO: replace with a weight-based estimate once the fee estimator is
/// plumbed through; the too-small-to-sweep check below must be kept.
pub const JUSTICE_TX_FEE: u64 = 5_000;

#[derive(Debug, Error)]
pub enum Error {
    /// The contested value does not cover the sweep fee. There is nothing
    /// worth claiming; the attempt is abandoned.
    #[error("breached value {total} sat does not cover the {fee} sat sweep fee")]
    TooSmallToSweep { total: u64, fee: u64 },
    /// The wallet refused to sign or could not allocate a script.
    #[error("wallet: {0}")]
    Wallet(#[from] SinkError),
}

/// Build and sign the justice transaction for a breach.
///
/// One input per breached output, in [`RetributionInfo::breached_outputs`]
/// order, and a single sweep output paying the wallet.
pub fn create_justice_tx(wallet: &dyn Wallet, info: &RetributionInfo) -> Result<Transaction, Error> {
    let outputs: Vec<_> = info.breached_outputs().collect();
    let total = info.total_amount();
    let value = total.saturating_sub(JUSTICE_TX_FEE);

    if value == 0 {
        return Err(Error::TooSmallToSweep {
            total,
            fee: JUSTICE_TX_FEE,
        });
    }
    let sweep = wallet.sweep_script()?;

    debug!(
        target: "arbiter",
        "Sweeping {} breached output(s) worth {total} sat of channel {}",
        outputs.len(),
        info.channel_point
    );

    let mut tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: outputs
            .iter()
            .map(|o| TxIn {
                previous_output: o.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value,
            script_pubkey: sweep,
        }],
    };

    for (index, output) in outputs.iter().enumerate() {
        let witness = build_witness(
            output.witness_type,
            wallet,
            &tx,
            index,
            &output.sign_descriptor,
        )?;
        tx.input[index].witness = witness;
    }
    Ok(tx)
}

/// Produce the witness claiming a breached output.
///
/// All claim paths start with a signature; what follows depends on the
/// spend: a bare key for the no-delay commitment output, the `true` branch
/// selector plus witness script for the revocation clause, and the
/// revocation key plus witness script for either HTLC flavor.
pub fn build_witness(
    witness_type: WitnessType,
    wallet: &dyn Wallet,
    tx: &Transaction,
    input: usize,
    desc: &SignDescriptor,
) -> Result<Witness, Error> {
    let sig = wallet.sign_output(tx, input, desc)?;
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);

    let mut witness = Witness::new();
    witness.push(&sig_bytes);

    match witness_type {
        WitnessType::NoDelayCommit => {
            witness.push(desc.pubkey.serialize());
        }
        WitnessType::RevokedCommit => {
            witness.push([1u8]);
            witness.push(desc.witness_script.as_bytes());
        }
        WitnessType::HtlcOffered | WitnessType::HtlcAccepted => {
            witness.push(desc.pubkey.serialize());
            witness.push(desc.witness_script.as_bytes());
        }
    }
    Ok(witness)
}
