//! Paxos engine: drives this replica's proposer, acceptor and learner
//! behavior from mesh messages and locally submitted proposals.

use std::collections::VecDeque;

use rand::Rng;

use tokio::sync::{mpsc, watch};

use crate::directory::{Directory, Transaction};
use crate::replica::{
    PeerId, PeerMsg, ProposalClock, ReplicaMesh, ReplicaRole, Round,
};

/// Per-replica Paxos engine. Runs as a single task owning the mesh endpoint
/// and the round state; everything else reaches it through the proposal
/// channel.
pub struct PaxosEngine {
    /// My identity string for logging.
    me: String,

    mesh: ReplicaMesh,

    /// State of the one round this replica is tracking.
    round: Round,

    clock: ProposalClock,

    /// Submitted transactions waiting for my proposer to be free.
    pending: VecDeque<Transaction>,

    /// The transaction I submitted for the round in flight, which may
    /// differ from the value the round ends up pushing.
    own: Option<Transaction>,

    directory: Directory,

    /// Transactions submitted by client servants and failover controllers.
    rx_propose: mpsc::UnboundedReceiver<Transaction>,
}

impl PaxosEngine {
    pub fn new(
        me: String,
        mesh: ReplicaMesh,
        directory: Directory,
        rx_propose: mpsc::UnboundedReceiver<Transaction>,
    ) -> Self {
        let salt = rand::thread_rng().gen::<u16>();
        PaxosEngine {
            me,
            mesh,
            round: Round::default(),
            clock: ProposalClock::new(salt),
            pending: VecDeque::new(),
            own: None,
            directory,
            rx_propose,
        }
    }

    /// Queues `txn` for proposal, starting a round right away if my
    /// proposer is idle.
    fn submit(&mut self, txn: Transaction) {
        self.pending.push_back(txn);
        self.start_next();
    }

    /// Begins a round for the oldest pending transaction: draws a fresh
    /// proposal number and sends Prepare to every connected acceptor. A
    /// round that never gathers a quorum stays pending, and so does
    /// everything queued behind it.
    fn start_next(&mut self) {
        if self.round.in_flight() {
            return;
        }
        let Some(txn) = self.pending.pop_front() else {
            return;
        };

        let n = self.clock.next_number();
        pf_debug!(self.me; "proposing {} as {}", txn, n);
        self.own = Some(txn.clone());
        let prepare = self.round.start(n, txn);
        let sent = self.mesh.broadcast(&prepare, Some(ReplicaRole::Acceptor));
        if sent == 0 {
            pf_warn!(self.me; "no acceptors connected, round {} cannot complete", n);
        }
    }

    /// A round I was proposing in ended with `chosen`; if that was not my
    /// own transaction, propose mine again first thing.
    fn round_ended(&mut self, chosen: &Transaction) {
        if let Some(own) = self.own.take() {
            if own != *chosen {
                pf_debug!(self.me; "{} lost its round, retrying", own);
                self.pending.push_front(own);
            }
        }
        self.start_next();
    }

    fn reply(&self, msg: PeerMsg, peer: PeerId) {
        if let Err(e) = self.mesh.send_msg(msg, peer) {
            pf_warn!(self.me; "error replying to peer {}: {}", peer, e);
        }
    }

    /// Handles one message from a peer.
    fn handle_msg(&mut self, peer: PeerId, msg: PeerMsg) {
        match msg {
            PeerMsg::Prepare { n } => match self.round.on_prepare(n) {
                Some(promise) => {
                    pf_debug!(self.me; "promised {} to peer {}", n, peer);
                    self.reply(promise, peer);
                }
                None => {
                    pf_trace!(self.me; "ignored stale Prepare {} from {}", n, peer);
                }
            },

            PeerMsg::Promise { n, accepted } => {
                let acceptors = self.mesh.count(ReplicaRole::Acceptor);
                if let Some(accept) = self.round.on_promise(n, accepted, acceptors)
                {
                    pf_debug!(self.me; "promise quorum for {} among {} acceptors",
                                       n, acceptors);
                    self.mesh.broadcast(&accept, Some(ReplicaRole::Acceptor));
                }
            }

            PeerMsg::Accept { n, txn } => match self.round.on_accept(n, txn) {
                Some(response) => {
                    pf_debug!(self.me; "accepted {} from peer {}", n, peer);
                    self.reply(response, peer);
                }
                None => {
                    pf_trace!(self.me; "ignored stale Accept {} from {}", n, peer);
                }
            },

            PeerMsg::AcceptResponse { n, txn } => {
                let acceptors = self.mesh.count(ReplicaRole::Acceptor);
                if let Some(chosen) =
                    self.round.on_accept_response(n, txn, acceptors)
                {
                    pf_info!(self.me; "round {} decided {}", n, chosen);
                    self.mesh.broadcast(
                        &PeerMsg::Educate { txn: chosen.clone() },
                        None,
                    );
                    // the chosen value may be someone else's, adopted
                    self.directory.apply(&chosen);
                    self.round_ended(&chosen);
                }
            }

            PeerMsg::Educate { txn } => {
                pf_debug!(self.me; "educated by peer {} with {}", peer, txn);
                self.round.on_educate();
                self.directory.apply(&txn);
                self.round_ended(&txn);
            }

            PeerMsg::TellMyRole { .. } => {} // consumed by the mesh
        }
    }

    /// Engine main loop; returns once termination is signalled or all
    /// proposal senders are gone.
    pub async fn run(mut self, mut rx_term: watch::Receiver<bool>) {
        pf_debug!(self.me; "paxos engine running");

        loop {
            tokio::select! {
                // locally submitted proposal
                txn = self.rx_propose.recv() => {
                    match txn {
                        Some(txn) => self.submit(txn),
                        None => break,
                    }
                },

                // protocol message from a peer
                msg = self.mesh.recv_msg() => {
                    match msg {
                        Ok((peer, msg)) => self.handle_msg(peer, msg),
                        Err(_) => break,
                    }
                },

                // termination signal
                _ = rx_term.changed() => {
                    pf_info!(self.me; "paxos engine caught termination signal");
                    break;
                },
            }
        }

        pf_debug!(self.me; "paxos engine exited");
    }
}
