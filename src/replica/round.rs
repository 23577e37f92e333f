//! Per-replica Paxos round state and its pure message handlers.
//!
//! A replica tracks a single round at a time. The round ends when this
//! replica, as proposer, sees its accept quorum, or when it is educated
//! about a chosen value by anyone; either way both halves of the state are
//! replaced by a fresh `Round`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::directory::Transaction;
use crate::replica::PeerMsg;

/// Totally ordered proposal number.
pub type ProposalNumber = u64;

/// Whether `count` responses make a quorum among `acceptors` connected
/// acceptors. Uses `acceptors / 2 <= count`, so the quorum follows the
/// number of acceptors currently in the mesh rather than a fixed cluster
/// size, and for an odd count it is one short of a strict majority.
pub fn is_quorum(acceptors: usize, count: usize) -> bool {
    acceptors / 2 <= count
}

/// Generator of proposal numbers: wall-clock milliseconds in the high bits
/// and a per-replica salt in the low 16 bits. Strictly increasing per
/// replica even if the clock stalls or steps back.
#[derive(Debug)]
pub struct ProposalClock {
    last_ms: u64,
    salt: u16,
}

impl ProposalClock {
    pub fn new(salt: u16) -> Self {
        ProposalClock { last_ms: 0, salt }
    }

    pub fn next_number(&mut self) -> ProposalNumber {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_ms = now_ms.max(self.last_ms + 1);
        (self.last_ms << 16) | u64::from(self.salt)
    }
}

/// Acceptor half of the round state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcceptorState {
    pub max_promised: Option<ProposalNumber>,
    pub max_accepted: Option<ProposalNumber>,
    pub max_accepted_txn: Option<Transaction>,
}

/// Proposer half of the round state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProposerState {
    /// Number of my in-flight proposal, if any.
    pub proposal: Option<ProposalNumber>,

    /// Value I will push in phase 2; may be replaced by an adopted value.
    pub value: Option<Transaction>,

    pub promises_seen: usize,
    pub best_accepted_seen: Option<ProposalNumber>,
    pub accepts_seen: usize,

    pub reached_promise_quorum: bool,
    pub reached_accept_quorum: bool,
}

/// Round state of one replica.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Round {
    pub acceptor: AcceptorState,
    pub proposer: ProposerState,
}

impl Round {
    /// Starts proposing `txn` under number `n`, replacing any proposal of
    /// mine still in flight. Returns the Prepare to send to all acceptors.
    pub fn start(&mut self, n: ProposalNumber, txn: Transaction) -> PeerMsg {
        self.proposer = ProposerState {
            proposal: Some(n),
            value: Some(txn),
            ..Default::default()
        };
        PeerMsg::Prepare { n }
    }

    /// Whether a proposal of mine is in flight.
    pub fn in_flight(&self) -> bool {
        self.proposer.proposal.is_some()
    }

    /// Acceptor: handles Prepare. Returns the Promise to reply with, or
    /// `None` if `n` is not above what I already promised.
    pub fn on_prepare(&mut self, n: ProposalNumber) -> Option<PeerMsg> {
        let acceptor = &mut self.acceptor;
        if acceptor.max_promised.is_some_and(|p| n <= p) {
            return None;
        }
        acceptor.max_promised = Some(n);
        let accepted = acceptor.max_accepted.zip(acceptor.max_accepted_txn.clone());
        Some(PeerMsg::Promise { n, accepted })
    }

    /// Proposer: handles Promise. Returns the Accept to send to all
    /// acceptors when the promise quorum is first reached.
    pub fn on_promise(
        &mut self,
        n: ProposalNumber,
        accepted: Option<(ProposalNumber, Transaction)>,
        acceptors: usize,
    ) -> Option<PeerMsg> {
        let proposer = &mut self.proposer;
        if proposer.proposal != Some(n) {
            return None;
        }

        // adopt the highest value already accepted by anyone
        if let Some((accepted_n, accepted_txn)) = accepted {
            if proposer.best_accepted_seen.map_or(true, |b| accepted_n > b) {
                proposer.best_accepted_seen = Some(accepted_n);
                proposer.value = Some(accepted_txn);
            }
        }

        proposer.promises_seen += 1;
        if proposer.reached_promise_quorum
            || !is_quorum(acceptors, proposer.promises_seen)
        {
            return None;
        }
        proposer.reached_promise_quorum = true;
        proposer
            .value
            .clone()
            .map(|txn| PeerMsg::Accept { n, txn })
    }

    /// Acceptor: handles Accept. Returns the AcceptResponse to reply with,
    /// or `None` if I promised a higher number.
    pub fn on_accept(
        &mut self,
        n: ProposalNumber,
        txn: Transaction,
    ) -> Option<PeerMsg> {
        let acceptor = &mut self.acceptor;
        if acceptor.max_promised.is_some_and(|p| n < p) {
            return None;
        }
        acceptor.max_promised = Some(n);
        acceptor.max_accepted = Some(n);
        acceptor.max_accepted_txn = Some(txn.clone());
        Some(PeerMsg::AcceptResponse { n, txn })
    }

    /// Proposer: handles AcceptResponse. When the accept quorum is first
    /// reached, resets the round and returns the chosen value to educate
    /// everyone with.
    pub fn on_accept_response(
        &mut self,
        n: ProposalNumber,
        txn: Transaction,
        acceptors: usize,
    ) -> Option<Transaction> {
        let proposer = &mut self.proposer;
        if proposer.proposal != Some(n) {
            return None;
        }
        proposer.accepts_seen += 1;
        if proposer.reached_accept_quorum
            || !is_quorum(acceptors, proposer.accepts_seen)
        {
            return None;
        }
        proposer.reached_accept_quorum = true;
        let chosen = proposer.value.take().unwrap_or(txn);
        *self = Round::default();
        Some(chosen)
    }

    /// Learner: a value was chosen; forget the round.
    pub fn on_educate(&mut self) {
        *self = Round::default();
    }
}

#[cfg(test)]
mod round_tests {
    use super::*;

    fn register(user: &str) -> Transaction {
        Transaction::Register {
            user: user.into(),
            pass: "pw".into(),
        }
    }

    /// Unwraps a Promise into its accepted pair.
    fn promised(msg: Option<PeerMsg>) -> Option<(ProposalNumber, Transaction)> {
        match msg {
            Some(PeerMsg::Promise { accepted, .. }) => accepted,
            other => panic!("expected Promise, got {:?}", other),
        }
    }

    #[test]
    fn quorum_rule() {
        assert!(is_quorum(1, 1));
        assert!(!is_quorum(2, 0));
        assert!(is_quorum(2, 1));
        assert!(is_quorum(3, 1));
        assert!(!is_quorum(4, 1));
        assert!(is_quorum(4, 2));
        assert!(!is_quorum(5, 1));
        assert!(is_quorum(5, 2));
    }

    #[test]
    fn clock_strictly_increases() {
        let mut clock = ProposalClock::new(7);
        let mut last = clock.next_number();
        assert_eq!(last & 0xffff, 7);
        for _ in 0..1000 {
            let n = clock.next_number();
            assert!(n > last);
            last = n;
        }
        let mut other = ProposalClock::new(8);
        assert_ne!(other.next_number() & 0xffff, last & 0xffff);
    }

    #[test]
    fn stale_prepare_ignored() {
        let mut round = Round::default();
        assert!(round.on_prepare(10).is_some());
        assert_eq!(round.on_prepare(10), None);
        assert_eq!(round.on_prepare(9), None);
        assert!(round.on_prepare(11).is_some());
        assert_eq!(round.acceptor.max_promised, Some(11));
    }

    #[test]
    fn stale_accept_ignored() {
        let mut round = Round::default();
        round.on_prepare(20);
        assert_eq!(round.on_accept(19, register("x")), None);
        assert_eq!(
            round.on_accept(20, register("y")),
            Some(PeerMsg::AcceptResponse {
                n: 20,
                txn: register("y")
            })
        );
        assert_eq!(round.acceptor.max_accepted, Some(20));
        // accepting also raises the promise
        assert_eq!(round.on_prepare(20), None);
        assert_eq!(
            promised(round.on_prepare(21)),
            Some((20, register("y")))
        );
    }

    #[test]
    fn accept_waits_for_quorum() {
        let mut round = Round::default();
        assert_eq!(round.start(5, register("a")), PeerMsg::Prepare { n: 5 });
        // 4 acceptors: quorum at 2
        assert_eq!(round.on_promise(5, None, 4), None);
        assert_eq!(
            round.on_promise(5, None, 4),
            Some(PeerMsg::Accept {
                n: 5,
                txn: register("a")
            })
        );
        // one-shot
        assert_eq!(round.on_promise(5, None, 4), None);
        assert_eq!(round.on_promise(5, None, 4), None);
    }

    #[test]
    fn educate_waits_for_quorum() {
        let mut round = Round::default();
        round.start(5, register("a"));
        round.on_promise(5, None, 5);
        round.on_promise(5, None, 5);
        assert_eq!(round.on_accept_response(5, register("a"), 5), None);
        assert_eq!(
            round.on_accept_response(5, register("a"), 5),
            Some(register("a"))
        );
        // round is over, late responses do nothing
        assert_eq!(round, Round::default());
        assert_eq!(round.on_accept_response(5, register("a"), 5), None);
        assert_eq!(round.on_promise(5, None, 5), None);
    }

    #[test]
    fn mismatched_number_ignored() {
        let mut round = Round::default();
        round.start(30, register("a"));
        assert_eq!(round.on_promise(29, None, 1), None);
        assert_eq!(round.proposer.promises_seen, 0);
        assert_eq!(round.on_accept_response(31, register("a"), 1), None);
        assert_eq!(round.proposer.accepts_seen, 0);
    }

    #[test]
    fn adopts_highest_accepted_value() {
        let mut round = Round::default();
        round.start(50, register("mine"));
        assert_eq!(round.on_promise(50, Some((10, register("old"))), 5), None);
        let accept = round.on_promise(50, Some((40, register("newer"))), 5);
        assert_eq!(
            accept,
            Some(PeerMsg::Accept {
                n: 50,
                txn: register("newer")
            })
        );
        // a lower accepted number seen later does not displace it
        round.on_promise(50, Some((20, register("older"))), 5);
        assert_eq!(round.proposer.value, Some(register("newer")));
        assert_eq!(round.proposer.best_accepted_seen, Some(40));
    }

    #[test]
    fn restart_replaces_proposal() {
        let mut round = Round::default();
        round.on_prepare(3);
        round.start(5, register("a"));
        round.on_promise(5, None, 2);
        round.start(6, register("b"));
        assert_eq!(round.proposer.promises_seen, 0);
        assert_eq!(round.proposer.value, Some(register("b")));
        // acceptor half untouched
        assert_eq!(round.acceptor.max_promised, Some(3));
    }

    /// Three acceptors and two proposers exchanging messages by hand.
    struct Cluster {
        acceptors: Vec<Round>,
        p1: Round,
        p2: Round,
        educated: Vec<Transaction>,
    }

    impl Cluster {
        fn new() -> Self {
            Cluster {
                acceptors: vec![Round::default(); 3],
                p1: Round::default(),
                p2: Round::default(),
                educated: vec![],
            }
        }

        fn proposer(&mut self, which: usize) -> &mut Round {
            if which == 1 {
                &mut self.p1
            } else {
                &mut self.p2
            }
        }

        /// Delivers Prepare(n) to acceptor `a` and its Promise back.
        fn prepare(&mut self, which: usize, a: usize, n: ProposalNumber) {
            if let Some(PeerMsg::Promise { n, accepted }) =
                self.acceptors[a].on_prepare(n)
            {
                // the Accept it may trigger is delivered by `accept()`
                self.proposer(which).on_promise(n, accepted, 3);
            }
        }

        /// Delivers Accept(n, value) to acceptor `a` and its response back.
        fn accept(&mut self, which: usize, a: usize, n: ProposalNumber) {
            let state = &self.proposer(which).proposer;
            if !state.reached_promise_quorum {
                return;
            }
            let Some(txn) = state.value.clone() else {
                return;
            };
            if let Some(PeerMsg::AcceptResponse { n, txn }) =
                self.acceptors[a].on_accept(n, txn)
            {
                if let Some(chosen) =
                    self.proposer(which).on_accept_response(n, txn, 3)
                {
                    self.educated.push(chosen);
                }
            }
        }
    }

    #[test]
    fn later_proposer_adopts_accepted_value() {
        let mut c = Cluster::new();
        c.p1.start(100, register("first"));
        for a in 0..3 {
            c.prepare(1, a, 100);
        }
        // acceptors take p1's value but p1 has not heard back yet
        for a in 0..3 {
            let txn = register("first");
            c.acceptors[a].on_accept(100, txn);
        }
        c.p2.start(200, register("second"));
        for a in 0..3 {
            c.prepare(2, a, 200);
        }
        for a in 0..3 {
            c.accept(2, a, 200);
        }
        assert_eq!(c.educated, vec![register("first")]);
    }

    #[test]
    fn preempted_proposer_never_educates() {
        let mut c = Cluster::new();
        c.p1.start(100, register("first"));
        for a in 0..3 {
            c.prepare(1, a, 100);
        }
        c.p2.start(200, register("second"));
        for a in 0..3 {
            c.prepare(2, a, 200);
        }
        // p1's accepts now bounce off every acceptor
        for a in 0..3 {
            c.accept(1, a, 100);
        }
        for a in 0..3 {
            c.accept(2, a, 200);
        }
        assert_eq!(c.educated, vec![register("second")]);
        assert!(c.educated.iter().all(|t| *t == c.educated[0]));
    }
}
