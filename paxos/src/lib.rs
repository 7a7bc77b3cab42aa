//! Single-decree Paxos: one node state machine that plays proposer, acceptor, and learner at
//! once, driven by `propose`/`recv` and an injected [NetworkSink].
//!
//! This crate does not retransmit, does not time out, and does not invent proposal numbers.
//! Those are a caller's problem (typically `paxos_sim`, or a real deployment's leader-election
//! layer). What this crate guarantees is safety: agreement and non-triviality hold no matter how
//! its messages are lost, delayed, reordered, or duplicated by whatever sits underneath
//! [NetworkSink].

use std::cmp::Ordering;

use biometrics::Counter;

///////////////////////////////////////////// biometrics /////////////////////////////////////////////

static PROPOSE: Counter = Counter::new("paxos.node.propose");
static PREPARE_RECV: Counter = Counter::new("paxos.node.prepare.recv");
static PREPARE_PROMISED: Counter = Counter::new("paxos.node.prepare.promised");
static PREPARE_STALE: Counter = Counter::new("paxos.node.prepare.stale");
static PROMISE_RECV: Counter = Counter::new("paxos.node.promise.recv");
static PROMISE_STALE: Counter = Counter::new("paxos.node.promise.stale");
static ACCEPT_REQUEST_RECV: Counter = Counter::new("paxos.node.accept_request.recv");
static ACCEPT_REQUEST_STALE: Counter = Counter::new("paxos.node.accept_request.stale");
static ACCEPTED_RECV: Counter = Counter::new("paxos.node.accepted.recv");
static ACCEPTED_STALE: Counter = Counter::new("paxos.node.accepted.stale");
static VALUE_CHOSEN: Counter = Counter::new("paxos.node.chosen");
static SAFETY_VIOLATION: Counter = Counter::new("paxos.node.safety_violation");

/// Register this crate's counters with a `biometrics` emitter, so a host process can wire
/// `paxos`'s counters into whatever it already emits.
pub fn all_counters() -> Vec<&'static Counter> {
    vec![
        &PROPOSE,
        &PREPARE_RECV,
        &PREPARE_PROMISED,
        &PREPARE_STALE,
        &PROMISE_RECV,
        &PROMISE_STALE,
        &ACCEPT_REQUEST_RECV,
        &ACCEPT_REQUEST_STALE,
        &ACCEPTED_RECV,
        &ACCEPTED_STALE,
        &VALUE_CHOSEN,
        &SAFETY_VIOLATION,
    ]
}

//////////////////////////////////////////////// NodeId ////////////////////////////////////////////////

/// Identifies a replica. The cluster is fixed-membership: ids are assigned once and never
/// recycled for the lifetime of a [crate::Node] or its reboots.
pub type NodeId = u64;

//////////////////////////////////////////////// Proposal //////////////////////////////////////////////

/// A `(seq, data)` pair — what the Paxos literature calls a decree. `seq == 0` is reserved as the
/// empty sentinel; no real round is ever numbered 0.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Proposal {
    pub seq: u64,
    pub data: Vec<u8>,
}

impl Proposal {
    /// The empty proposal: `seq == 0`, no data. Every node starts here.
    pub const EMPTY: Proposal = Proposal {
        seq: 0,
        data: Vec::new(),
    };

    /// A proposal carrying `data` but not yet stamped with a round number. Used by the proposer
    /// while it still doesn't know if any acceptor has a higher-numbered value to adopt.
    fn unstamped(data: Vec<u8>) -> Proposal {
        Proposal { seq: 0, data }
    }

    /// `true` iff `self.seq == 0`.
    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    /// Total order by `seq` alone; two proposals with the same `seq` are never compared in this
    /// crate for anything but equality (the protocol's invariants rule it out — see I4 in the
    /// crate-level spec this implements).
    pub fn less_than(&self, other: &Proposal) -> bool {
        self.seq < other.seq
    }
}

//////////////////////////////////////////////// MessageKind ///////////////////////////////////////////

/// The four Paxos phases, carried as a plain tag rather than an enum-of-structs, because every
/// [Message] has the same shape (`seq` + one [Proposal]) regardless of phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Prepare,
    Promise,
    AcceptRequest,
    Accepted,
}

//////////////////////////////////////////////// Message ///////////////////////////////////////////////

/// Inter-node traffic. `prop` is meaningful for `Promise` (the acceptor's prior accept, maybe
/// empty), `AcceptRequest` (the value being pushed), and `Accepted` (the accepted proposal); for
/// `Prepare` it is unused and left [Proposal::EMPTY].
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: MessageKind,
    pub seq: u64,
    pub prop: Proposal,
}

//////////////////////////////////////////////// NetworkSink ///////////////////////////////////////////

/// The capability a [Node] uses to emit messages. A real deployment wraps a transport; tests and
/// `paxos_sim` use the `Vec<Message>` impl below as a scratch outbox, then route each entry
/// through a link model themselves. `Node` takes this as a parameter on `propose`/`recv` rather
/// than storing it — see this crate's README section on why, or `DESIGN.md` in the workspace
/// root.
pub trait NetworkSink {
    /// Fire-and-forget: may be dropped, delayed, or reordered downstream. Never duplicated by
    /// anything in this crate.
    fn send(&mut self, msg: Message);
}

impl NetworkSink for Vec<Message> {
    fn send(&mut self, msg: Message) {
        self.push(msg);
    }
}

//////////////////////////////////////////////////// Node //////////////////////////////////////////////

/// One replica, playing proposer, acceptor, and learner simultaneously. The three roles are kept
/// as independent fields on one struct rather than as a tagged variant, because every node
/// genuinely plays all three roles at once — there is no mode to switch between.
#[derive(Clone, Debug)]
pub struct Node {
    // Identity.
    id: NodeId,
    peers: Vec<NodeId>,

    // Proposer, volatile.
    prop_seq: u64,
    promises: usize,
    reported: Proposal,

    // Learner, volatile.
    accept_seq: u64,
    accepts: usize,
    learning: Proposal,
    chosen: Proposal,

    // Acceptor, durable. These two fields, and only these two, must survive a crash; see
    // `reboot`.
    promise_seq: u64,
    accepted: Proposal,
}

impl Node {
    /// A fresh node with empty state. `peers` should include `id` itself — every node sends
    /// Prepare/AcceptRequest/Accepted to itself too, and is counted in its own quorum.
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Node {
        Node {
            id,
            peers,
            prop_seq: 0,
            promises: 0,
            reported: Proposal::EMPTY,
            accept_seq: 0,
            accepts: 0,
            learning: Proposal::EMPTY,
            chosen: Proposal::EMPTY,
            promise_seq: 0,
            accepted: Proposal::EMPTY,
        }
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The fixed peer set this node was constructed with, including itself.
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// `peers.len() / 2 + 1` — the smallest size at which any two subsets of peers must
    /// intersect.
    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// The highest `seq` this node has promised not to accept below. Durable; survives `reboot`.
    pub fn promise_seq(&self) -> u64 {
        self.promise_seq
    }

    /// The highest-numbered proposal this node has accepted, or [Proposal::EMPTY]. Durable;
    /// survives `reboot`.
    pub fn accepted(&self) -> &Proposal {
        &self.accepted
    }

    /// Start a new round as proposer. `seq` must be strictly greater than every `seq` this node
    /// has previously proposed; the caller (not this crate) is responsible for proposal-number
    /// uniqueness and monotonicity across the whole cluster. Violating monotonicity on this node
    /// is a programmer error and panics rather than silently corrupting `prop_seq`.
    pub fn propose(&mut self, seq: u64, data: Vec<u8>, sink: &mut dyn NetworkSink) {
        assert!(
            seq > self.prop_seq,
            "propose: seq {seq} must be strictly greater than the last proposed seq {} on node {}",
            self.prop_seq,
            self.id,
        );
        PROPOSE.click();
        self.prop_seq = seq;
        self.promises = 0;
        self.reported = Proposal::unstamped(data);
        self.broadcast(
            Message {
                from: self.id,
                to: self.id,
                kind: MessageKind::Prepare,
                seq,
                prop: Proposal::EMPTY,
            },
            sink,
        );
    }

    /// `Some(data)` once a value has been chosen on this node, else `None`. Once this returns
    /// `Some`, it returns the same `Some` forever (across any number of `recv` calls) — `chosen`
    /// is write-once, enforced by the panic in `handle_accepted` rather than by refusing to
    /// overwrite it.
    pub fn chosen_value(&self) -> Option<Vec<u8>> {
        if self.chosen.is_empty() {
            None
        } else {
            Some(self.chosen.data.clone())
        }
    }

    /// Crash-and-recover: returns a new node that preserves only `id`, `peers`, `promise_seq`,
    /// and `accepted` — exactly the fields a real deployment must have flushed to stable storage
    /// before replying to a `Prepare` or `AcceptRequest` (see `handle_prepare`,
    /// `handle_accept_request`). Everything else — `prop_seq`, `promises`, `reported`,
    /// `accept_seq`, `accepts`, `learning`, `chosen` — resets, which is why a rebooted node that
    /// had chosen a value forgets it until it re-learns via a fresh round of `Accepted`
    /// messages.
    pub fn reboot(self) -> Node {
        Node {
            id: self.id,
            peers: self.peers,
            prop_seq: 0,
            promises: 0,
            reported: Proposal::EMPTY,
            accept_seq: 0,
            accepts: 0,
            learning: Proposal::EMPTY,
            chosen: Proposal::EMPTY,
            promise_seq: self.promise_seq,
            accepted: self.accepted,
        }
    }

    /// Dispatch by `msg.kind`. [MessageKind] has exactly four variants and this match is
    /// exhaustive, so "a message with an unrecognized kind is ignored" (the distilled spec's
    /// phrasing) is enforced by the compiler rather than by a runtime default arm.
    pub fn recv(&mut self, msg: Message, sink: &mut dyn NetworkSink) {
        match msg.kind {
            MessageKind::Prepare => self.handle_prepare(msg, sink),
            MessageKind::Promise => self.handle_promise(msg, sink),
            MessageKind::AcceptRequest => self.handle_accept_request(msg, sink),
            MessageKind::Accepted => self.handle_accepted(msg),
        }
    }

    /// Acceptor role: answer a request to not accept below `msg.seq`.
    fn handle_prepare(&mut self, msg: Message, sink: &mut dyn NetworkSink) {
        PREPARE_RECV.click();
        if self.promise_seq >= msg.seq {
            PREPARE_STALE.click();
            return;
        }
        // Durable write-through before the reply is emitted: a crash after this line but before
        // the Promise is delivered must still honor the promise on reboot.
        self.promise_seq = msg.seq;
        PREPARE_PROMISED.click();
        self.send(
            msg.from,
            MessageKind::Promise,
            msg.seq,
            self.accepted.clone(),
            sink,
        );
    }

    /// Proposer role: count a quorum of promises, then broadcast an AcceptRequest for whichever
    /// value the quorum reported (or our own, if none did).
    fn handle_promise(&mut self, msg: Message, sink: &mut dyn NetworkSink) {
        PROMISE_RECV.click();
        if msg.seq != self.prop_seq {
            PROMISE_STALE.click();
            return;
        }
        self.promises += 1;
        if self.reported.less_than(&msg.prop) {
            self.reported = msg.prop;
        }
        if self.promises != self.quorum() {
            return;
        }
        // Stamp whichever value we're carrying — ours, or the highest-numbered one an acceptor
        // already accepted — with this round's seq, and push it to every acceptor.
        self.reported.seq = self.prop_seq;
        self.broadcast(
            Message {
                from: self.id,
                to: self.id,
                kind: MessageKind::AcceptRequest,
                seq: self.prop_seq,
                prop: self.reported.clone(),
            },
            sink,
        );
    }

    /// Acceptor role: accept `msg.prop` under `msg.seq` unless a higher seq has already been
    /// promised, then broadcast the acceptance to every peer (there is no distinguished learner;
    /// every node tallies `Accepted`s for itself).
    fn handle_accept_request(&mut self, msg: Message, sink: &mut dyn NetworkSink) {
        ACCEPT_REQUEST_RECV.click();
        if self.promise_seq > msg.seq {
            ACCEPT_REQUEST_STALE.click();
            return;
        }
        // Durable write-through before Accepted is broadcast.
        self.accepted = msg.prop.clone();
        self.broadcast(
            Message {
                from: self.id,
                to: self.id,
                kind: MessageKind::Accepted,
                seq: msg.seq,
                prop: msg.prop,
            },
            sink,
        );
    }

    /// Learner role: tally `Accepted`s per round, detect disagreement within a round (a safety
    /// violation — see the crate-level spec's §7), and decide once a quorum agrees.
    fn handle_accepted(&mut self, msg: Message) {
        ACCEPTED_RECV.click();
        match self.accept_seq.cmp(&msg.seq) {
            Ordering::Greater => {
                ACCEPTED_STALE.click();
                return;
            }
            Ordering::Less => {
                self.accept_seq = msg.seq;
                self.accepts = 1;
                self.learning = msg.prop;
            }
            Ordering::Equal => {
                self.accepts += 1;
                if self.learning.data != msg.prop.data {
                    SAFETY_VIOLATION.click();
                    panic!(
                        "safety violation: node {} saw two different values accepted for seq {}: {:?} vs {:?}",
                        self.id, msg.seq, self.learning.data, msg.prop.data,
                    );
                }
            }
        }
        if self.accepts != self.quorum() {
            return;
        }
        if !self.chosen.is_empty() && self.chosen.data != self.learning.data {
            SAFETY_VIOLATION.click();
            panic!(
                "safety violation: node {} learned a value for seq {} that disagrees with the already-chosen value: {:?} vs {:?}",
                self.id, self.learning.seq, self.chosen.data, self.learning.data,
            );
        }
        if self.chosen.is_empty() {
            VALUE_CHOSEN.click();
        }
        self.chosen = self.learning.clone();
    }

    /// Send `msg` to every peer (including self), filling in `from`/`seq`/`prop` once per
    /// recipient.
    fn broadcast(&self, template: Message, sink: &mut dyn NetworkSink) {
        for &to in &self.peers {
            sink.send(Message {
                to,
                ..template.clone()
            });
        }
    }

    /// Send a single targeted reply.
    fn send(&self, to: NodeId, kind: MessageKind, seq: u64, prop: Proposal, sink: &mut dyn NetworkSink) {
        sink.send(Message {
            from: self.id,
            to,
            kind,
            seq,
            prop,
        });
    }
}

/////////////////////////////////////////////////// tests //////////////////////////////////////////////
