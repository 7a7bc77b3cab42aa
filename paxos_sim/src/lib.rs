//! A deterministic discrete-event network simulator for `paxos`.
//!
//! [ClusterSimulator] owns a fixed set of [paxos::Node]s, a per-directed-pair [Link] loss/latency
//! model, and an [EventCalendar] that orders everything by virtual time. Nothing here touches a
//! real clock, socket, or thread — `cont`/`cont_until` are synchronous and reentrant-free, which
//! is what makes the whole thing replayable from a seed (see `with_seed`).

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use biometrics::Counter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use paxos::{Message, Node, NodeId};

///////////////////////////////////////////// biometrics /////////////////////////////////////////////

static MESSAGE_SCHEDULED: Counter = Counter::new("paxos_sim.cluster.message.scheduled");
static MESSAGE_DROPPED_LINK: Counter = Counter::new("paxos_sim.cluster.message.dropped.link");
static MESSAGE_DROPPED_SENDER_HALTED: Counter =
    Counter::new("paxos_sim.cluster.message.dropped.sender_halted");
static MESSAGE_DROPPED_RECIPIENT_HALTED: Counter =
    Counter::new("paxos_sim.cluster.message.dropped.recipient_halted");
static NODE_DOWN: Counter = Counter::new("paxos_sim.cluster.down");
static NODE_UP: Counter = Counter::new("paxos_sim.cluster.up");

/// Register this crate's counters with a `biometrics` emitter, alongside `paxos::all_counters`.
pub fn all_counters() -> Vec<&'static Counter> {
    vec![
        &MESSAGE_SCHEDULED,
        &MESSAGE_DROPPED_LINK,
        &MESSAGE_DROPPED_SENDER_HALTED,
        &MESSAGE_DROPPED_RECIPIENT_HALTED,
        &NODE_DOWN,
        &NODE_UP,
    ]
}

//////////////////////////////////////////////////// Link //////////////////////////////////////////////

/// A directed link's loss/latency model: http://citeseerx.ist.psu.edu/viewdoc/download?doi=10.1.1.21.5841&rep=rep1&type=pdf
/// describes this as a clipped normal — we sample `Normal(mean, stddev^2)` and reject samples
/// below `min`, redrawing up to 100 times before giving up.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// Probability in `[0, 1)` that a message on this link never arrives.
    pub drop: f64,
    /// Samples below this are rejected and redrawn.
    pub min: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl Link {
    /// `min = 0, mean = 1, stddev = 0` — every link, including self-loops, starts out here.
    pub const DEFAULT: Link = Link {
        drop: 0.0,
        min: 0.0,
        mean: 1.0,
        stddev: 0.0,
    };

    /// `None` if this draw is dropped, else `Some(delay)` with `delay >= min`. Panics if the
    /// distribution can't produce a sample `>= min` in 100 draws — that's a misconfigured link
    /// (e.g. `min > mean + a few stddev`), not a runtime fault.
    pub fn transfer(&self, rng: &mut impl Rng) -> Option<f64> {
        if rng.gen::<f64>() < self.drop {
            return None;
        }
        let normal = Normal::new(self.mean, self.stddev).unwrap_or_else(|e| {
            panic!("link {self:?} has an unsamplable latency distribution: {e:?}")
        });
        for _ in 0..100 {
            let delay = normal.sample(rng);
            if delay >= self.min {
                return Some(delay);
            }
        }
        panic!("link {self:?} could not produce a latency sample >= min in 100 draws");
    }
}

impl Default for Link {
    fn default() -> Link {
        Link::DEFAULT
    }
}

////////////////////////////////////////////// ScheduledEvent //////////////////////////////////////////

/// An `(happen, msg)` pair ordered by `happen` alone. `f64` isn't `Ord`, so this carries a manual
/// impl rather than `#[derive(Ord)]`; `happen` is never NaN because `Link::transfer` only ever
/// returns finite delays and `EventCalendar::add` asserts `after >= 0`.
#[derive(Clone, Debug)]
struct ScheduledEvent {
    happen: f64,
    msg: Message,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.happen == other.happen
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.happen.partial_cmp(&other.happen)
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .expect("event times must never be NaN")
    }
}

////////////////////////////////////////////// EventCalendar ///////////////////////////////////////////

/// A min-priority queue of `(virtual time, Message)`, plus the monotonic clock it advances. Ties
/// in `happen` break arbitrarily (`BinaryHeap` is not stable) — per the spec this implements, no
/// test may depend on tie order for anything but safety.
#[derive(Debug, Default)]
pub struct EventCalendar {
    now: f64,
    heap: BinaryHeap<Reverse<ScheduledEvent>>,
}

impl EventCalendar {
    pub fn new() -> EventCalendar {
        EventCalendar::default()
    }

    /// Schedule `msg` to arrive `after` virtual-time units from now.
    pub fn add(&mut self, msg: Message, after: f64) {
        assert!(
            after >= 0.0,
            "events may only be scheduled into the future, got after={after}"
        );
        let happen = self.now + after;
        self.heap.push(Reverse(ScheduledEvent { happen, msg }));
    }

    /// The `happen` time of the next event to be popped, if any.
    pub fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(ev)| ev.happen)
    }

    /// Pop the next event, advancing `now` to its `happen` time.
    pub fn advance(&mut self) -> Option<Message> {
        let Reverse(ev) = self.heap.pop()?;
        self.now = ev.happen;
        Some(ev.msg)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The virtual clock, as of the last `advance`.
    pub fn now(&self) -> f64 {
        self.now
    }
}

///////////////////////////////////////////// ClusterSimulator /////////////////////////////////////////

/// Owns every node in the cluster, which ids are currently halted, the per-link loss/latency
/// model, and the event calendar. This is the only place virtual time and randomness live —
/// `paxos::Node` touches neither.
pub struct ClusterSimulator {
    nodes: HashMap<NodeId, Node>,
    halts: HashSet<NodeId>,
    links: HashMap<(NodeId, NodeId), Link>,
    calendar: EventCalendar,
    rng: StdRng,
}

impl ClusterSimulator {
    /// A fresh `n`-node cluster, ids `1..=n`, every link (including self-loops) at
    /// [Link::DEFAULT], seeded from the process's entropy source. Prefer [ClusterSimulator::with_seed]
    /// in tests that need to replay a failure.
    pub fn new(n: u64) -> ClusterSimulator {
        ClusterSimulator::with_seed(n, rand::random::<u64>())
    }

    /// As [ClusterSimulator::new], but with a caller-chosen seed for the link model's RNG — the
    /// only source of non-determinism in this crate.
    pub fn with_seed(n: u64, seed: u64) -> ClusterSimulator {
        assert!(n > 0, "a cluster must have at least one node");
        let peers: Vec<NodeId> = (1..=n).collect();
        let mut nodes = HashMap::with_capacity(peers.len());
        let mut links = HashMap::with_capacity(peers.len() * peers.len());
        for &id in &peers {
            nodes.insert(id, Node::new(id, peers.clone()));
            for &other in &peers {
                links.insert((id, other), Link::DEFAULT);
            }
        }
        ClusterSimulator {
            nodes,
            halts: HashSet::new(),
            links,
            calendar: EventCalendar::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Direct, read-only access to a node — for inspecting durable state in tests (`promise_seq`,
    /// `accepted`) without driving it through the network.
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("no such node: {id}"))
    }

    pub fn is_down(&self, id: NodeId) -> bool {
        self.halts.contains(&id)
    }

    /// Shorthand for `self.node(id).chosen_value()`.
    pub fn chosen_value(&self, id: NodeId) -> Option<Vec<u8>> {
        self.node(id).chosen_value()
    }

    /// Direct access to a link's parameters, for tests that want to assert on them.
    pub fn link(&self, from: NodeId, to: NodeId) -> &Link {
        self.links
            .get(&(from, to))
            .unwrap_or_else(|| panic!("no such link: {from} -> {to}"))
    }

    /// Reconfigure a single directed link. Scenario 6's stress test rewrites every pair before
    /// each run.
    pub fn set_link(&mut self, from: NodeId, to: NodeId, link: Link) {
        self.links.insert((from, to), link);
    }

    /// Mark `id` crashed. In-flight messages already on the calendar are untouched; they're
    /// dropped individually at delivery time (to `id`) or at send time (from `id`).
    pub fn down(&mut self, id: NodeId) {
        NODE_DOWN.click();
        self.halts.insert(id);
    }

    /// Clear `id`'s halt flag and reboot it: durable acceptor state survives, every volatile
    /// proposer/learner field resets.
    pub fn up(&mut self, id: NodeId) {
        NODE_UP.click();
        self.halts.remove(&id);
        let node = self
            .nodes
            .remove(&id)
            .unwrap_or_else(|| panic!("no such node: {id}"));
        self.nodes.insert(id, node.reboot());
    }

    /// Drive node `id` to start a new round as proposer, routing whatever it emits through the
    /// link model. Does not itself advance the calendar — call `cont`/`cont_until` afterward.
    pub fn propose(&mut self, id: NodeId, seq: u64, data: Vec<u8>) {
        let mut outbox: Vec<Message> = Vec::new();
        {
            let node = self
                .nodes
                .get_mut(&id)
                .unwrap_or_else(|| panic!("no such node: {id}"));
            node.propose(seq, data, &mut outbox);
        }
        for msg in outbox {
            self.route(msg);
        }
    }

    /// Drain the calendar completely.
    pub fn cont(&mut self) {
        while self.deliver_next() {}
    }

    /// Drain the calendar until the next event's `happen` time exceeds `t`.
    pub fn cont_until(&mut self, t: f64) {
        loop {
            match self.calendar.peek_time() {
                Some(next) if next <= t => {
                    self.deliver_next();
                }
                _ => return,
            }
        }
    }

    /// Pop and deliver one event. Returns `false` once the calendar is empty.
    fn deliver_next(&mut self) -> bool {
        let msg = match self.calendar.advance() {
            Some(msg) => msg,
            None => return false,
        };
        if self.halts.contains(&msg.to) {
            MESSAGE_DROPPED_RECIPIENT_HALTED.click();
            return true;
        }
        let mut outbox: Vec<Message> = Vec::new();
        if let Some(node) = self.nodes.get_mut(&msg.to) {
            node.recv(msg, &mut outbox);
        }
        for out in outbox {
            self.route(out);
        }
        true
    }

    /// The network sink: consult `msg.from`'s halt status and the `(from, to)` link, then either
    /// drop or schedule. This is the only place a [Message] is ever handed to the [EventCalendar].
    fn route(&mut self, msg: Message) {
        if self.halts.contains(&msg.from) {
            MESSAGE_DROPPED_SENDER_HALTED.click();
            return;
        }
        let link = self
            .links
            .get(&(msg.from, msg.to))
            .cloned()
            .unwrap_or(Link::DEFAULT);
        match link.transfer(&mut self.rng) {
            Some(delay) => {
                MESSAGE_SCHEDULED.click();
                self.calendar.add(msg, delay);
            }
            None => {
                MESSAGE_DROPPED_LINK.click();
            }
        }
    }
}

/////////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cluster_has_every_link_at_default() {
        let cl = ClusterSimulator::with_seed(3, 1);
        for from in 1..=3 {
            for to in 1..=3 {
                assert_eq!(cl.link(from, to), &Link::DEFAULT);
            }
        }
    }

    #[test]
    fn basic_commit() {
        let mut cl = ClusterSimulator::with_seed(3, 42);
        cl.propose(1, 1, b"hello".to_vec());
        cl.cont();
        assert_eq!(cl.chosen_value(1), Some(b"hello".to_vec()));
        assert_eq!(cl.chosen_value(2), Some(b"hello".to_vec()));
        assert_eq!(cl.chosen_value(3), Some(b"hello".to_vec()));
        assert_eq!(cl.calendar.len(), 0);
    }

    #[test]
    fn minority_down_still_commits() {
        let mut cl = ClusterSimulator::with_seed(3, 7);
        cl.down(3);
        cl.propose(1, 1, b"hello".to_vec());
        cl.cont();
        assert_eq!(cl.chosen_value(1), Some(b"hello".to_vec()));
    }

    #[test]
    fn majority_down_never_commits() {
        let mut cl = ClusterSimulator::with_seed(3, 7);
        cl.down(2);
        cl.down(3);
        cl.propose(1, 1, b"hello".to_vec());
        cl.cont();
        assert_eq!(cl.chosen_value(1), None);
    }

    #[test]
    fn down_then_up_preserves_durable_state_and_resets_chosen() {
        let mut cl = ClusterSimulator::with_seed(3, 99);
        cl.propose(1, 1, b"hello".to_vec());
        cl.cont();
        assert!(cl.chosen_value(3).is_some());
        let promise_seq_before = cl.node(3).promise_seq();
        let accepted_before = cl.node(3).accepted().clone();
        cl.down(3);
        cl.up(3);
        assert_eq!(cl.node(3).promise_seq(), promise_seq_before);
        assert_eq!(cl.node(3).accepted(), &accepted_before);
        assert_eq!(cl.chosen_value(3), None);
    }

    #[test]
    fn link_transfer_respects_drop_probability() {
        let mut rng = StdRng::seed_from_u64(5);
        let always_drops = Link {
            drop: 1.0,
            ..Link::DEFAULT
        };
        assert_eq!(always_drops.transfer(&mut rng), None);
    }

    #[test]
    #[should_panic(expected = "could not produce a latency sample")]
    fn link_transfer_panics_when_min_is_unreachable() {
        let mut rng = StdRng::seed_from_u64(5);
        let impossible = Link {
            drop: 0.0,
            min: 1_000_000.0,
            mean: 1.0,
            stddev: 0.001,
        };
        impossible.transfer(&mut rng);
    }

    #[test]
    fn event_calendar_orders_by_happen_time() {
        let mut cal = EventCalendar::new();
        let msg = |seq: u64| Message {
            from: 1,
            to: 1,
            kind: paxos::MessageKind::Prepare,
            seq,
            prop: paxos::Proposal::EMPTY,
        };
        cal.add(msg(3), 3.0);
        cal.add(msg(1), 1.0);
        cal.add(msg(2), 2.0);
        assert_eq!(cal.advance().unwrap().seq, 1);
        assert_eq!(cal.advance().unwrap().seq, 2);
        assert_eq!(cal.advance().unwrap().seq, 3);
        assert!(cal.advance().is_none());
    }
}
