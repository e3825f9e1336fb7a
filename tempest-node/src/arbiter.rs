//! The breach arbiter.
//!
//! Watches every open channel for a revoked-state broadcast by the
//! counterparty and answers one with a justice transaction sweeping all
//! contested outputs. Every step of the workflow is persisted first, so a
//! crash at any point resumes cleanly on the next start.
//!
//! One coordinator thread owns the watcher map; one short-lived watcher
//! thread runs per active channel, and one retribution thread per
//! in-flight justice workflow. They communicate only by typed channels.
pub mod justice;
pub mod retribution;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::{io, thread};

use crossbeam_channel as chan;
use log::*;
use thiserror::Error;

use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};

use crate::arbiter::retribution::{
    BreachedOutput, RetributionInfo, SignDescriptor, Store, WitnessType,
};
use crate::chain::Notifier;
use crate::crypto::Signature;

pub use justice::{create_justice_tx, JUSTICE_TX_FEE};

/// Error reported by an injected collaborator.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(String);

impl SinkError {
    pub fn new(msg: impl ToString) -> Self {
        Self(msg.to_string())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] retribution::Error),
    #[error("breach arbiter is not running")]
    NotRunning,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// The on-chain wallet, as consumed by the justice workflow.
pub trait Wallet: Send + Sync {
    /// Allocate a fresh script to sweep contested funds to.
    fn sweep_script(&self) -> Result<ScriptBuf, SinkError>;

    /// Sign `tx`'s `input` as described by `desc`.
    fn sign_output(
        &self,
        tx: &Transaction,
        input: usize,
        desc: &SignDescriptor,
    ) -> Result<Signature, SinkError>;

    /// Broadcast a transaction. Re-announcing a transaction the network
    /// already knows must succeed, so the workflow can republish after a
    /// restart.
    fn publish(&self, tx: &Transaction) -> Result<(), SinkError>;
}

/// The HTLC switch, told to take down the link of a breached channel.
pub trait Switch: Send + Sync {
    fn close_breached_link(&self, channel_point: &OutPoint);
}

/// How a channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    Cooperative,
    ForceClose,
    Breach,
}

/// Close summary persisted alongside the channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSummary {
    pub channel_point: OutPoint,
    pub close_txid: Txid,
    pub close_type: CloseType,
    /// Whether the close still awaits on-chain resolution.
    pub pending: bool,
}

/// The channel database, as consumed by the arbiter.
pub trait Channels: Send + Sync {
    /// Record that a channel began closing.
    fn close_channel(&self, summary: CloseSummary) -> Result<(), SinkError>;

    /// Record that a closing channel is fully resolved on chain.
    fn mark_fully_closed(&self, channel_point: &OutPoint) -> Result<(), SinkError>;
}

/// Raw signing material for one breached output, as produced by the
/// channel state machine.
#[derive(Debug, Clone)]
pub struct BreachedOutputDetail {
    pub amount: u64,
    pub outpoint: OutPoint,
    pub sign_descriptor: SignDescriptor,
}

/// A revoked-state spend detected by the channel state machine.
#[derive(Debug, Clone)]
pub struct BreachEvent {
    /// The revoked commitment transaction the counterparty broadcast.
    pub commit_txid: Txid,
    /// The commitment output paying to us.
    pub self_output: BreachedOutputDetail,
    /// The revoked to-self output.
    pub revoked_output: BreachedOutputDetail,
    /// Outstanding HTLCs, with whether each was offered by the remote.
    pub htlc_outputs: Vec<(BreachedOutputDetail, bool)>,
}

/// Signals a channel object publishes to its watcher. The channel owns the
/// sending halves; the arbiter never holds a reference back into the
/// channel.
#[derive(Debug, Clone)]
pub struct Signals {
    /// The channel was closed cooperatively.
    pub settled: chan::Receiver<()>,
    /// A non-breach force close hit the chain; carries the closing txid.
    pub unilateral_close: chan::Receiver<Txid>,
    /// A revoked state was broadcast.
    pub breach: chan::Receiver<BreachEvent>,
}

/// An open channel under watch.
#[derive(Debug, Clone)]
pub struct WatchedChannel {
    pub channel_point: OutPoint,
    pub signals: Signals,
}

/// A channel whose (non-breach) closing transaction awaits confirmation.
#[derive(Debug, Clone, Copy)]
pub struct PendingClose {
    pub channel_point: OutPoint,
    pub close_txid: Txid,
}

/// Breach arbiter configuration.
pub struct Config {
    pub notifier: Arc<dyn Notifier>,
    pub wallet: Arc<dyn Wallet>,
    pub switch: Arc<dyn Switch>,
    pub channels: Arc<dyn Channels>,
    /// Channels open when the arbiter starts. Later channels are added
    /// with [`BreachArbiter::watch_new_channel`].
    pub active: Vec<WatchedChannel>,
    /// Channels already closing when the arbiter starts.
    pub pending_close: Vec<PendingClose>,
}

/// Shared collaborator handles, cloned into every spawned task.
#[derive(Clone)]
struct Deps {
    notifier: Arc<dyn Notifier>,
    wallet: Arc<dyn Wallet>,
    switch: Arc<dyn Switch>,
    channels: Arc<dyn Channels>,
}

/// Events watchers send to the coordinator.
enum Contract {
    /// A breach was detected and pre-processed by the watcher.
    Breached(RetributionInfo),
    /// The channel settled cooperatively.
    Settled(OutPoint),
    /// The channel force-closed without a breach.
    Closed(PendingClose),
}

struct Running {
    new_channels: chan::Sender<WatchedChannel>,
    settled: chan::Sender<OutPoint>,
    shutdown: chan::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// The breach arbiter.
pub struct BreachArbiter<D> {
    deps: Deps,
    db: D,
    /// Channel sets handed over on first start.
    startup: Mutex<Option<(Vec<WatchedChannel>, Vec<PendingClose>)>>,
    running: Mutex<Option<Running>>,
    done: (chan::Sender<OutPoint>, chan::Receiver<OutPoint>),
}

impl<D> BreachArbiter<D>
where
    D: Store + Clone + Send + 'static,
{
    pub fn new(config: Config, db: D) -> Self {
        Self {
            deps: Deps {
                notifier: config.notifier,
                wallet: config.wallet,
                switch: config.switch,
                channels: config.channels,
            },
            db,
            startup: Mutex::new(Some((config.active, config.pending_close))),
            running: Mutex::new(None),
            done: chan::unbounded(),
        }
    }

    /// Start the arbiter. Idempotent.
    ///
    /// Loads pending retributions and resumes their confirmation waits,
    /// then spawns watchers for all active channels and close-confirmation
    /// waiters for channels already closing.
    pub fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock().expect("arbiter lock is not poisoned");
        if running.is_some() {
            return Ok(());
        }
        info!(target: "arbiter", "Starting breach arbiter");

        // Start-time store corruption is fatal and surfaces here.
        let mut pending = Vec::new();
        self.db.for_all(&mut |info| pending.push(info))?;

        let (new_tx, new_rx) = chan::unbounded();
        let (settled_tx, settled_rx) = chan::unbounded();
        let (shutdown_tx, shutdown_rx) = chan::bounded(0);

        for info in pending {
            info!(
                target: "arbiter",
                "Resuming retribution for channel {}", info.channel_point
            );
            let confirmed = self.deps.notifier.register_confirmation(info.commit_txid, 1, 0);

            spawn_retribution(
                self.db.clone(),
                self.deps.clone(),
                info,
                confirmed,
                shutdown_rx.clone(),
                self.done.0.clone(),
            )?;
        }

        let (active, pending_close) = self
            .startup
            .lock()
            .expect("arbiter lock is not poisoned")
            .take()
            .unwrap_or_default();

        for close in pending_close {
            spawn_close_waiter(self.deps.clone(), close, shutdown_rx.clone())?;
        }

        let thread = spawn_observer(
            self.db.clone(),
            self.deps.clone(),
            active,
            new_rx,
            settled_rx,
            shutdown_rx,
            self.done.0.clone(),
        )?;

        *running = Some(Running {
            new_channels: new_tx,
            settled: settled_tx,
            shutdown: shutdown_tx,
            thread,
        });
        Ok(())
    }

    /// Stop the arbiter and wait for the coordinator to exit. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().expect("arbiter lock is not poisoned").take()
        else {
            return;
        };
        info!(target: "arbiter", "Stopping breach arbiter");

        drop(running.shutdown);
        drop(running.new_channels);
        drop(running.settled);
        running.thread.join().ok();
    }

    /// Put a newly opened channel under watch. Supersedes any watcher
    /// already running for the same channel.
    pub fn watch_new_channel(&self, channel: WatchedChannel) -> Result<(), Error> {
        let running = self.running.lock().expect("arbiter lock is not poisoned");
        let Some(running) = running.as_ref() else {
            return Err(Error::NotRunning);
        };
        running
            .new_channels
            .send(channel)
            .map_err(|_| Error::NotRunning)
    }

    /// The channel settled cooperatively or force-closed through the usual
    /// path; its watcher is no longer needed.
    pub fn notify_settled(&self, channel_point: OutPoint) {
        let running = self.running.lock().expect("arbiter lock is not poisoned");

        if let Some(running) = running.as_ref() {
            running.settled.send(channel_point).ok();
        }
    }

    /// Channel points of retributions as they fully resolve. Useful for
    /// callers that block on resolution.
    pub fn resolved(&self) -> chan::Receiver<OutPoint> {
        self.done.1.clone()
    }
}

impl<D> Drop for BreachArbiter<D> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                drop(running.shutdown);
                running.thread.join().ok();
            }
        }
    }
}

/// Spawn the coordinator. Owns the watcher map; selects over new
/// contracts, breached contracts, settled contracts and shutdown.
fn spawn_observer<D>(
    db: D,
    deps: Deps,
    active: Vec<WatchedChannel>,
    new_channels: chan::Receiver<WatchedChannel>,
    settled: chan::Receiver<OutPoint>,
    shutdown: chan::Receiver<()>,
    done: chan::Sender<OutPoint>,
) -> Result<thread::JoinHandle<()>, Error>
where
    D: Store + Clone + Send + 'static,
{
    let builder = thread::Builder::new().name("arbiter".to_owned());
    let handle = builder.spawn(move || {
        let (events_tx, events_rx) = chan::unbounded();
        let mut watchers: HashMap<OutPoint, chan::Sender<()>> = HashMap::new();

        for channel in active {
            watch(channel, deps.clone(), events_tx.clone(), &mut watchers);
        }

        loop {
            chan::select! {
                recv(new_channels) -> channel => {
                    if let Ok(channel) = channel {
                        debug!(target: "arbiter", "Watching new channel {}", channel.channel_point);
                        watch(channel, deps.clone(), events_tx.clone(), &mut watchers);
                    }
                },
                recv(settled) -> channel_point => {
                    if let Ok(channel_point) = channel_point {
                        debug!(target: "arbiter", "Channel {channel_point} settled; dropping watcher");
                        watchers.remove(&channel_point);
                    }
                },
                recv(events_rx) -> event => {
                    let Ok(event) = event else { break };

                    match event {
                        Contract::Breached(info) => {
                            let channel_point = info.channel_point;

                            if let Err(e) = breached(&db, &deps, info, &shutdown, &done) {
                                // The persisted record, if any, drives a
                                // retry on the next start.
                                error!(target: "arbiter", "Error processing breach of {channel_point}: {e}");
                            }
                            watchers.remove(&channel_point);
                        }
                        Contract::Settled(channel_point) => {
                            watchers.remove(&channel_point);
                        }
                        Contract::Closed(close) => {
                            watchers.remove(&close.channel_point);

                            if let Err(e) = spawn_close_waiter(deps.clone(), close, shutdown.clone()) {
                                error!(target: "arbiter", "Error spawning close waiter: {e}");
                            }
                        }
                    }
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!(target: "arbiter", "Contract observer shutting down");
    })?;

    Ok(handle)
}

/// Handle a breach event on the coordinator: register the confirmation
/// notification, pre-commit the retribution, and hand it to its own task.
fn breached<D>(
    db: &D,
    deps: &Deps,
    info: RetributionInfo,
    shutdown: &chan::Receiver<()>,
    done: &chan::Sender<OutPoint>,
) -> Result<(), Error>
where
    D: Store + Clone + Send + 'static,
{
    warn!(
        target: "arbiter",
        "Revoked state broadcast for channel {}! Commitment {}",
        info.channel_point,
        info.commit_txid
    );

    // Subscribe first, pre-commit second: if we crash in between, the
    // restart path re-registers before spawning the workflow.
    let confirmed = deps.notifier.register_confirmation(info.commit_txid, 1, 0);

    let mut db = db.clone();
    db.add(&info)?;

    spawn_retribution(db, deps.clone(), info, confirmed, shutdown.clone(), done.clone())?;

    Ok(())
}

/// Spawn a watcher thread for a channel, superseding any previous watcher
/// for the same channel point.
fn watch(
    channel: WatchedChannel,
    deps: Deps,
    events: chan::Sender<Contract>,
    watchers: &mut HashMap<OutPoint, chan::Sender<()>>,
) {
    let (cancel_tx, cancel_rx) = chan::bounded(0);

    // Replacing the entry drops the previous cancel sender, which the old
    // watcher observes as a disconnect.
    watchers.insert(channel.channel_point, cancel_tx);

    let name = format!("watcher-{}", channel.channel_point);
    if let Err(e) = thread::Builder::new()
        .name(name)
        .spawn(move || watcher(channel, deps, events, cancel_rx))
    {
        error!(target: "arbiter", "Error spawning channel watcher: {e}");
    }
}

/// Per-channel watcher. Exits after the first signal, or when canceled.
fn watcher(
    channel: WatchedChannel,
    deps: Deps,
    events: chan::Sender<Contract>,
    cancel: chan::Receiver<()>,
) {
    let channel_point = channel.channel_point;

    chan::select! {
        recv(channel.signals.settled) -> res => {
            if res.is_ok() {
                debug!(target: "arbiter", "Channel {channel_point} closed cooperatively");
                events.send(Contract::Settled(channel_point)).ok();
            }
        },
        recv(channel.signals.unilateral_close) -> res => {
            if let Ok(close_txid) = res {
                debug!(target: "arbiter", "Channel {channel_point} force-closed by {close_txid}");
                events.send(Contract::Closed(PendingClose { channel_point, close_txid })).ok();
            }
        },
        recv(channel.signals.breach) -> res => {
            if let Ok(event) = res {
                // Take the link down before anything else; no more HTLCs
                // may cross a breached channel.
                deps.switch.close_breached_link(&channel_point);

                let summary = CloseSummary {
                    channel_point,
                    close_txid: event.commit_txid,
                    close_type: CloseType::Breach,
                    pending: true,
                };
                if let Err(e) = deps.channels.close_channel(summary) {
                    error!(target: "arbiter", "Error persisting breach close summary: {e}");
                }
                events.send(Contract::Breached(retribution_info(channel_point, event))).ok();
            }
        },
        recv(cancel) -> _ => {
            trace!(target: "arbiter", "Watcher for {channel_point} canceled");
        },
    }
}

/// Tag the raw breach material with witness types, producing the record
/// the justice workflow runs on.
fn retribution_info(channel_point: OutPoint, event: BreachEvent) -> RetributionInfo {
    let output = |detail: BreachedOutputDetail, witness_type, two_stage_claim| BreachedOutput {
        amount: detail.amount,
        outpoint: detail.outpoint,
        sign_descriptor: detail.sign_descriptor,
        witness_type,
        two_stage_claim,
    };

    RetributionInfo {
        commit_txid: event.commit_txid,
        channel_point,
        self_output: output(event.self_output, WitnessType::NoDelayCommit, false),
        revoked_output: output(event.revoked_output, WitnessType::RevokedCommit, false),
        htlc_outputs: event
            .htlc_outputs
            .into_iter()
            .map(|(detail, offered)| {
                let witness_type = if offered {
                    WitnessType::HtlcOffered
                } else {
                    WitnessType::HtlcAccepted
                };
                output(detail, witness_type, true)
            })
            .collect(),
    }
}

/// Spawn the task driving one retribution to completion. The caller has
/// already registered the breach confirmation notification, so the arbiter
/// is subscribed from the moment the breach is processed.
fn spawn_retribution<D>(
    db: D,
    deps: Deps,
    info: RetributionInfo,
    confirmed: chan::Receiver<crate::chain::TxConfirmation>,
    shutdown: chan::Receiver<()>,
    done: chan::Sender<OutPoint>,
) -> Result<(), Error>
where
    D: Store + Send + 'static,
{
    let name = format!("retribution-{}", info.channel_point);

    thread::Builder::new()
        .name(name)
        .spawn(move || exact_retribution(db, deps, info, confirmed, shutdown, done))?;

    Ok(())
}

/// Wait for a non-breach closing transaction to confirm, then mark the
/// channel fully closed.
fn spawn_close_waiter(
    deps: Deps,
    close: PendingClose,
    shutdown: chan::Receiver<()>,
) -> Result<(), Error> {
    let confirmed = deps.notifier.register_confirmation(close.close_txid, 1, 0);
    let name = format!("close-{}", close.channel_point);

    thread::Builder::new().name(name).spawn(move || {
        chan::select! {
            recv(confirmed) -> res => {
                if res.is_ok() {
                    debug!(
                        target: "arbiter",
                        "Close of channel {} confirmed", close.channel_point
                    );
                    if let Err(e) = deps.channels.mark_fully_closed(&close.channel_point) {
                        error!(target: "arbiter", "Error marking channel closed: {e}");
                    }
                }
            },
            recv(shutdown) -> _ => {},
        }
    })?;

    Ok(())
}

/// Drive one confirmed breach to full resolution.
///
/// Transient failures abort the attempt; the persisted retribution record
/// makes the next start retry from the top.
fn exact_retribution<D>(
    mut db: D,
    deps: Deps,
    info: RetributionInfo,
    confirmed: chan::Receiver<crate::chain::TxConfirmation>,
    shutdown: chan::Receiver<()>,
    done: chan::Sender<OutPoint>,
) where
    D: Store,
{
    let channel_point = info.channel_point;

    let breach_conf = chan::select! {
        recv(confirmed) -> res => match res {
            Ok(conf) => conf,
            Err(_) => {
                warn!(target: "arbiter", "Confirmation subscription for {channel_point} closed");
                return;
            }
        },
        recv(shutdown) -> _ => return,
    };
    info!(
        target: "arbiter",
        "Breach transaction {} confirmed at height {}; exacting retribution",
        info.commit_txid,
        breach_conf.height
    );

    let tx = match justice::create_justice_tx(deps.wallet.as_ref(), &info) {
        Ok(tx) => tx,
        Err(e) => {
            error!(target: "arbiter", "Error creating justice transaction for {channel_point}: {e}");
            return;
        }
    };
    if let Err(e) = deps.wallet.publish(&tx) {
        error!(target: "arbiter", "Error publishing justice transaction for {channel_point}: {e}");
        return;
    }
    info!(target: "arbiter", "Published justice transaction {}", tx.txid());

    let justice_confirmed = deps
        .notifier
        .register_confirmation(tx.txid(), 1, breach_conf.height);

    chan::select! {
        recv(justice_confirmed) -> res => {
            if res.is_err() {
                warn!(target: "arbiter", "Confirmation subscription for {channel_point} closed");
                return;
            }
        },
        recv(shutdown) -> _ => return,
    }

    if let Err(e) = deps.channels.mark_fully_closed(&channel_point) {
        error!(target: "arbiter", "Error marking channel {channel_point} closed: {e}");
        return;
    }
    match db.remove(&channel_point) {
        Ok(()) | Err(retribution::Error::NotFound) => {}
        Err(e) => {
            error!(target: "arbiter", "Error removing retribution for {channel_point}: {e}");
            return;
        }
    }
    info!(target: "arbiter", "Justice served for channel {channel_point}");

    done.send(channel_point).ok();
}
