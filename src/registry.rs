//! The circuit registry: the single point of truth for a running session.
//!
//! One [`Registry`] exists per party and session. During the
//! single-threaded circuit-build phase it hands out gate, wire and
//! sharing-slot identifiers and takes ownership of the constructed gates
//! and wires. During the online phase, evaluator tasks use it to discover
//! which gates are ready to run (the active queue) and to track
//! termination (the evaluated-gates counter). Only the active queue and
//! the evaluated-gates counter are touched concurrently; everything else
//! is deliberately unsynchronized.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::channel::{self, send_to, Channel};
use crate::circuit::{Gate, GateId, Wire, WireId};
use crate::config::Config;

/// Errors raised by registry operations.
#[derive(Debug)]
pub enum Error {
    /// A message was addressed to the sending party itself.
    SendToSelf(usize),
    /// A message was addressed to a party outside the session.
    UnknownParty {
        /// The addressed party.
        party: usize,
        /// The number of parties in the session.
        parties: usize,
    },
    /// `send` was called before a transport was registered.
    ChannelNotRegistered,
    /// A sharing-slot allocation of zero values was requested.
    EmptyAllocation,
    /// A message could not be sent over the channel.
    Channel(channel::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SendToSelf(party) => {
                write!(f, "Party {party} tried to send a message to itself")
            }
            Error::UnknownParty { party, parties } => {
                write!(f, "Party {party} is not part of a session of {parties} parties")
            }
            Error::ChannelNotRegistered => {
                f.write_str("No transport has been registered with the registry")
            }
            Error::EmptyAllocation => {
                f.write_str("A sharing-slot allocation must cover at least one value")
            }
            Error::Channel(e) => write!(f, "Channel error: {e:?}"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

/// The registry of gates, wires and sharing slots of one party's session.
///
/// Gate and wire slots follow registration order; when gates draw their
/// ids through [`Registry::next_gate_id`] right before being registered,
/// slot indices and gate ids coincide.
pub struct Registry<C> {
    my_id: usize,
    parties: usize,
    channel: Option<C>,

    // Id counters are plain integers: ids are only allocated during the
    // single-threaded circuit-build phase.
    gate_id: usize,
    wire_id: usize,
    arithmetic_sharing_id: usize,
    boolean_sharing_id: usize,

    gates: Vec<Option<Box<dyn Gate>>>,
    input_gates: Vec<GateId>,
    wires: Vec<Option<Box<dyn Wire>>>,

    active_gates: Mutex<VecDeque<GateId>>,
    evaluated_gates: AtomicUsize,
}

impl<C: Channel> Registry<C> {
    /// Creates an empty registry for the party described by `config`.
    pub fn new(config: &Config) -> Self {
        Registry {
            my_id: config.my_id(),
            parties: config.parties(),
            channel: None,
            gate_id: 0,
            wire_id: 0,
            arithmetic_sharing_id: 0,
            boolean_sharing_id: 0,
            gates: Vec::new(),
            input_gates: Vec::new(),
            wires: Vec::new(),
            active_gates: Mutex::new(VecDeque::new()),
            evaluated_gates: AtomicUsize::new(0),
        }
    }

    /// This party's 0-based index.
    pub fn my_id(&self) -> usize {
        self.my_id
    }

    /// The total number of parties in the session.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Returns the next unused gate id.
    pub fn next_gate_id(&mut self) -> GateId {
        let id = self.gate_id;
        self.gate_id += 1;
        id
    }

    /// Returns the next unused wire id.
    pub fn next_wire_id(&mut self) -> WireId {
        let id = self.wire_id;
        self.wire_id += 1;
        id
    }

    /// Reserves a range of `n` arithmetic sharing ids, returning its start.
    pub fn next_arithmetic_sharing_id(&mut self, n: usize) -> Result<usize, Error> {
        if n == 0 {
            return Err(Error::EmptyAllocation);
        }
        let start = self.arithmetic_sharing_id;
        self.arithmetic_sharing_id += n;
        Ok(start)
    }

    /// Reserves a range of `n` boolean sharing ids, returning its start.
    pub fn next_boolean_sharing_id(&mut self, n: usize) -> Result<usize, Error> {
        if n == 0 {
            return Err(Error::EmptyAllocation);
        }
        let start = self.boolean_sharing_id;
        self.boolean_sharing_id += n;
        Ok(start)
    }

    /// Takes ownership of a gate, returning the slot it was stored in.
    pub fn register_gate(&mut self, gate: Box<dyn Gate>) -> GateId {
        self.gates.push(Some(gate));
        self.gates.len() - 1
    }

    /// Registers a gate that carries party inputs, recording its id in the
    /// input-gate index.
    pub fn register_input_gate(&mut self, gate: Box<dyn Gate>) -> GateId {
        let id = gate.gate_id();
        let slot = self.register_gate(gate);
        self.input_gates.push(id);
        slot
    }

    /// The ids of all input gates, in registration order.
    pub fn input_gates(&self) -> &[GateId] {
        &self.input_gates
    }

    /// The gate stored in `slot`, or `None` if the slot was unregistered
    /// or never existed.
    pub fn gate(&self, slot: GateId) -> Option<&dyn Gate> {
        self.gates.get(slot).and_then(|gate| gate.as_deref())
    }

    /// Drops the gate stored in `slot`. The slot remains indexable but
    /// stays empty forever.
    pub fn unregister_gate(&mut self, slot: GateId) {
        if let Some(gate) = self.gates.get_mut(slot) {
            *gate = None;
        }
    }

    /// Takes ownership of a wire, returning the slot it was stored in.
    pub fn register_wire(&mut self, wire: Box<dyn Wire>) -> WireId {
        self.wires.push(Some(wire));
        self.wires.len() - 1
    }

    /// The wire stored in `slot`, or `None` if the slot was unregistered
    /// or never existed.
    pub fn wire(&self, slot: WireId) -> Option<&dyn Wire> {
        self.wires.get(slot).and_then(|wire| wire.as_deref())
    }

    /// Drops the wire stored in `slot`. The wire table is not locked, so
    /// this must only be called while no evaluator task is running.
    pub fn unregister_wire(&mut self, slot: WireId) {
        if let Some(wire) = self.wires.get_mut(slot) {
            *wire = None;
        }
    }

    /// Installs the transport used by [`Registry::send`].
    pub fn register_channel(&mut self, channel: C) {
        self.channel = Some(channel);
    }

    /// Sends a message to the party with the given index.
    ///
    /// Addressing the sending party itself is rejected without performing
    /// any I/O.
    pub async fn send(&self, party: usize, msg: &[u8]) -> Result<(), Error> {
        if party == self.my_id {
            return Err(Error::SendToSelf(party));
        }
        if party >= self.parties {
            return Err(Error::UnknownParty {
                party,
                parties: self.parties,
            });
        }
        let channel = self.channel.as_ref().ok_or(Error::ChannelNotRegistered)?;
        send_to(channel, party, "direct message", msg).await?;
        Ok(())
    }

    /// Marks a gate as ready to be evaluated by pushing its id onto the
    /// active queue.
    pub fn push_active_gate(&self, gate_id: GateId) {
        let mut queue = self
            .active_gates
            .lock()
            .expect("active queue mutex poisoned");
        queue.push_back(gate_id);
        trace!(gate_id, "pushed gate onto the active queue");
    }

    /// Pops the next ready gate off the active queue, or `None` if the
    /// queue is currently empty.
    ///
    /// The emptiness check and the pop happen under the same critical
    /// section, so the operation is race-free against concurrent pushes
    /// and pops.
    pub fn pop_active_gate(&self) -> Option<GateId> {
        self.active_gates
            .lock()
            .expect("active queue mutex poisoned")
            .pop_front()
    }

    /// Atomically bumps the number of evaluated gates.
    pub fn increment_evaluated(&self) {
        // Relaxed suffices: the counter is only consulted for termination.
        self.evaluated_gates.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of gates evaluated so far.
    pub fn evaluated_gates(&self) -> usize {
        self.evaluated_gates.load(Ordering::Relaxed)
    }

    /// The total number of gate ids handed out so far.
    pub fn total_gates(&self) -> usize {
        self.gate_id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::channel::{recv_from, SimpleChannel};
    use crate::circuit::{Gate, GateId, Wire, WireId};
    use crate::config::Config;

    use super::{Error, Registry};

    #[derive(Debug)]
    struct TestGate(GateId);

    impl Gate for TestGate {
        fn gate_id(&self) -> GateId {
            self.0
        }
    }

    #[derive(Debug)]
    struct TestWire(WireId);

    impl Wire for TestWire {
        fn wire_id(&self) -> WireId {
            self.0
        }
    }

    fn registry(my_id: usize, parties: usize) -> Registry<SimpleChannel> {
        Registry::new(&Config::new(my_id, parties).unwrap())
    }

    #[test]
    fn gate_and_wire_ids_count_up_from_zero() {
        let mut reg = registry(0, 2);
        assert_eq!(
            [reg.next_gate_id(), reg.next_gate_id(), reg.next_gate_id()],
            [0, 1, 2]
        );
        assert_eq!([reg.next_wire_id(), reg.next_wire_id()], [0, 1]);
        assert_eq!(reg.total_gates(), 3);
    }

    #[test]
    fn sharing_ranges_are_disjoint_and_ordered() {
        let mut reg = registry(0, 2);
        assert_eq!(reg.next_arithmetic_sharing_id(4).unwrap(), 0);
        assert_eq!(reg.next_arithmetic_sharing_id(1).unwrap(), 4);
        assert_eq!(reg.next_arithmetic_sharing_id(3).unwrap(), 5);
        // Boolean slots are allocated independently.
        assert_eq!(reg.next_boolean_sharing_id(2).unwrap(), 0);
        assert_eq!(reg.next_boolean_sharing_id(2).unwrap(), 2);
        assert!(matches!(
            reg.next_arithmetic_sharing_id(0),
            Err(Error::EmptyAllocation)
        ));
        assert!(matches!(
            reg.next_boolean_sharing_id(0),
            Err(Error::EmptyAllocation)
        ));
    }

    #[test]
    fn gates_are_indexable_until_unregistered() {
        let mut reg = registry(0, 2);
        for _ in 0..3 {
            let id = reg.next_gate_id();
            let slot = reg.register_gate(Box::new(TestGate(id)));
            assert_eq!(slot, id);
        }
        assert_eq!(reg.gate(1).unwrap().gate_id(), 1);
        reg.unregister_gate(1);
        assert!(reg.gate(1).is_none());
        assert_eq!(reg.gate(0).unwrap().gate_id(), 0);
        assert_eq!(reg.gate(2).unwrap().gate_id(), 2);
        assert!(reg.gate(7).is_none());
    }

    #[test]
    fn wires_are_indexable_until_unregistered() {
        let mut reg = registry(0, 2);
        for _ in 0..2 {
            let id = reg.next_wire_id();
            assert_eq!(reg.register_wire(Box::new(TestWire(id))), id);
        }
        assert_eq!(reg.wire(0).unwrap().wire_id(), 0);
        reg.unregister_wire(0);
        assert!(reg.wire(0).is_none());
        assert_eq!(reg.wire(1).unwrap().wire_id(), 1);
    }

    #[test]
    fn input_gates_are_recorded_in_registration_order() {
        let mut reg = registry(0, 2);
        let a = reg.next_gate_id();
        reg.register_input_gate(Box::new(TestGate(a)));
        let b = reg.next_gate_id();
        reg.register_gate(Box::new(TestGate(b)));
        let c = reg.next_gate_id();
        reg.register_input_gate(Box::new(TestGate(c)));
        assert_eq!(reg.input_gates(), &[a, c]);
    }

    #[tokio::test]
    async fn sending_to_self_is_rejected_without_io() {
        let mut channels = SimpleChannel::channels(2);
        let c1 = channels.pop().unwrap();
        let c0 = channels.pop().unwrap();
        let mut reg = registry(1, 2);

        assert!(matches!(
            reg.send(0, b"ping").await,
            Err(Error::ChannelNotRegistered)
        ));
        reg.register_channel(c1);
        assert!(matches!(reg.send(1, b"ping").await, Err(Error::SendToSelf(1))));
        assert!(matches!(
            reg.send(5, b"ping").await,
            Err(Error::UnknownParty {
                party: 5,
                parties: 2
            })
        ));

        reg.send(0, b"ping").await.unwrap();
        let received: Vec<u8> = recv_from(&c0, 1, "direct message").await.unwrap();
        assert_eq!(received, b"ping".to_vec());
    }

    #[test]
    fn active_queue_hands_out_each_gate_exactly_once() {
        let reg = Arc::new(registry(0, 2));
        let drained = Arc::new(AtomicUsize::new(0));
        let total = 10;

        let producers: Vec<_> = [vec![0, 2, 4, 6, 8], vec![1, 3, 5, 7, 9]]
            .into_iter()
            .map(|ids| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for id in ids {
                        reg.push_active_gate(id);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let drained = Arc::clone(&drained);
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    loop {
                        match reg.pop_active_gate() {
                            Some(id) => {
                                popped.push(id);
                                drained.fetch_add(1, Ordering::SeqCst);
                            }
                            None => {
                                if drained.load(Ordering::SeqCst) == total {
                                    return popped;
                                }
                                thread::yield_now();
                            }
                        }
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..total).collect::<Vec<_>>());
        assert!(reg.pop_active_gate().is_none());
    }

    #[test]
    fn evaluated_gates_counter_is_atomic() {
        let reg = Arc::new(registry(0, 2));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for _ in 0..25 {
                        reg.increment_evaluated();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(reg.evaluated_gates(), 100);
    }
}
