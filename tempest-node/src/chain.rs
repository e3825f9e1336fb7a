//! Chain events, as consumed by the gossip engine and the breach arbiter.
//!
//! The chain notifier is an external collaborator; subscriptions hand back
//! channel receivers so subsystem coordinators can select over them.
use crossbeam_channel as chan;

use bitcoin::{BlockHash, OutPoint, Txid};

/// A newly connected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    pub height: u32,
    pub hash: BlockHash,
}

/// A transaction reaching its requested confirmation depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    pub txid: Txid,
    /// Height of the confirming block.
    pub height: u32,
    pub hash: BlockHash,
}

/// An outpoint being spent on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendDetail {
    pub outpoint: OutPoint,
    pub spender_txid: Txid,
    pub height: u32,
}

/// Chain notification subscriptions.
pub trait Notifier: Send + Sync {
    /// Subscribe to new best blocks.
    fn block_epochs(&self) -> chan::Receiver<BlockEpoch>;

    /// Notify once `txid` has `n_confs` confirmations, scanning from
    /// `since_height` if the transaction already confirmed in the past.
    fn register_confirmation(
        &self,
        txid: Txid,
        n_confs: u32,
        since_height: u32,
    ) -> chan::Receiver<TxConfirmation>;

    /// Notify when `outpoint` is spent, scanning from `since_height`.
    fn register_spend(&self, outpoint: OutPoint, since_height: u32) -> chan::Receiver<SpendDetail>;
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    fn block_epochs(&self) -> chan::Receiver<BlockEpoch> {
        (**self).block_epochs()
    }

    fn register_confirmation(
        &self,
        txid: Txid,
        n_confs: u32,
        since_height: u32,
    ) -> chan::Receiver<TxConfirmation> {
        (**self).register_confirmation(txid, n_confs, since_height)
    }

    fn register_spend(&self, outpoint: OutPoint, since_height: u32) -> chan::Receiver<SpendDetail> {
        (**self).register_spend(outpoint, since_height)
    }
}
