//! The gossip coordinator.
//!
//! Spawns the single thread that owns the engine state and serializes all
//! transitions: ingress validation, block-epoch drains, trickle flushes,
//! retransmissions and peer-online retries. Callers talk to it through a
//! [`Gossiper`] handle; every submission is answered on its own completion
//! channel.
use std::{thread, time};

use crossbeam_channel as chan;
use log::*;

use crate::chain::Notifier;
use crate::crypto::PublicKey;
use crate::gossip::message::Gossip;
use crate::gossip::{proofs, Config, Engine, Error, Io, Source};
use crate::graph::Graph;
use crate::transport::Transport;

/// A message handed to the coordinator, with its completion channel.
struct Submission {
    msg: Gossip,
    source: Source,
    reply: chan::Sender<Result<(), Error>>,
}

/// Handle to a running gossip engine.
///
/// Dropping the handle shuts the coordinator down.
pub struct Gossiper {
    ingress: chan::Sender<Submission>,
    shutdown: Option<chan::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Gossiper {
    /// Start the gossip engine.
    ///
    /// Performs start-up recovery before spawning the coordinator, so a
    /// corrupt database surfaces here rather than killing the thread.
    pub fn start<D, G, T, N>(
        config: Config,
        db: D,
        graph: G,
        transport: T,
        notifier: &N,
    ) -> Result<Self, Error>
    where
        D: proofs::Store + Send + 'static,
        G: Graph + Send + 'static,
        T: Transport + Send + 'static,
        N: Notifier + ?Sized,
    {
        let epochs = notifier.block_epochs();
        let best_height = graph.best_height()?;

        let mut engine = Engine::new(config, db, graph);
        engine.initialize(best_height)?;

        let (ingress_tx, ingress_rx) = chan::unbounded();
        let (shutdown_tx, shutdown_rx) = chan::bounded(0);

        let thread = thread::Builder::new()
            .name("gossip".to_owned())
            .spawn(move || run(engine, ingress_rx, epochs, shutdown_rx, transport))?;

        Ok(Self {
            ingress: ingress_tx,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Process an announcement received from a peer. The peer is recorded
    /// in the senders-set so the batch flush skips it on fan-out.
    pub fn process_remote_announcement(
        &self,
        msg: Gossip,
        peer: PublicKey,
    ) -> chan::Receiver<Result<(), Error>> {
        self.submit(msg, Source::Peer(peer))
    }

    /// Process an announcement originated by this node.
    pub fn process_local_announcement(&self, msg: Gossip) -> chan::Receiver<Result<(), Error>> {
        self.submit(msg, Source::Local)
    }

    fn submit(&self, msg: Gossip, source: Source) -> chan::Receiver<Result<(), Error>> {
        let (reply, completion) = chan::bounded(1);

        // If the coordinator is gone the completion channel disconnects,
        // which callers observe as shutdown.
        self.ingress.send(Submission { msg, source, reply }).ok();

        completion
    }

    /// Shut the coordinator down and wait for it to exit.
    pub fn stop(self) {}
}

impl Drop for Gossiper {
    fn drop(&mut self) {
        self.shutdown.take();

        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

fn duration(d: localtime::LocalDuration) -> time::Duration {
    time::Duration::from_millis(d.as_millis() as u64)
}

fn run<D, G, T>(
    mut engine: Engine<D, G>,
    ingress: chan::Receiver<Submission>,
    epochs: chan::Receiver<crate::chain::BlockEpoch>,
    shutdown: chan::Receiver<()>,
    transport: T,
) where
    D: proofs::Store,
    G: Graph,
    T: Transport,
{
    let trickle = chan::tick(duration(engine.config().trickle_interval));
    let retransmit = chan::tick(duration(engine.config().retransmit_interval));
    let (online_tx, online_rx) = chan::unbounded::<PublicKey>();
    let mut epochs = epochs;

    // Effects queued by start-up recovery.
    drain(&mut engine, &transport, &online_tx);

    loop {
        let epochs_closed = chan::select! {
            recv(ingress) -> submission => match submission {
                Ok(Submission { msg, source, reply }) => {
                    let result = engine.submit(msg, source);
                    if let Err(e) = &result {
                        debug!(target: "gossip", "Rejected announcement: {e}");
                    }
                    reply.send(result).ok();
                    false
                }
                // All handles were dropped.
                Err(_) => break,
            },
            recv(epochs) -> epoch => match epoch {
                Ok(epoch) => {
                    engine.block_connected(epoch.height);
                    false
                }
                Err(_) => {
                    warn!(target: "gossip", "Block epoch subscription closed");
                    true
                }
            },
            recv(online_rx) -> peer => {
                if let Ok(peer) = peer {
                    engine.peer_online(peer);
                }
                false
            },
            recv(trickle) -> _ => {
                engine.trickle_tick();
                false
            },
            recv(retransmit) -> _ => {
                engine.retransmit_tick();
                false
            },
            recv(shutdown) -> _ => break,
        };

        if epochs_closed {
            epochs = chan::never();
        }
        drain(&mut engine, &transport, &online_tx);
    }
    debug!(target: "gossip", "Gossip coordinator shutting down");
}

/// Execute queued network effects. A failed point-to-point send arms a
/// one-shot online notification; the retry happens when the peer id comes
/// back on `online`.
fn drain<D, G, T>(engine: &mut Engine<D, G>, transport: &T, online: &chan::Sender<PublicKey>)
where
    D: proofs::Store,
    G: Graph,
    T: Transport,
{
    while let Some(io) = engine.outbox().next() {
        match io {
            Io::Broadcast { skip, msg } => transport.broadcast(&skip, msg),
            Io::Send { to, msgs } => {
                if let Err(e) = transport.send_to_peer(to, msgs) {
                    warn!(target: "gossip", "Delivery to {to} failed: {e}; retrying on reconnection");
                    transport.notify_when_online(to, online.clone());
                }
            }
        }
    }
}
