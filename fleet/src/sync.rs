//! Fixed-arity coordination primitives for the active group.
//!
//! `Synchronizer` is an N-way barrier with an all-gather exchange on top;
//! `QuorumGate` is the counter that admits exactly `num_active` workers into
//! the inner loop per formation. Neither is cancellable: the reconciler
//! guarantees that every path entering a collective also exits it, and that
//! all members call the same collectives the same number of times per cycle.

use std::sync::{Condvar, Mutex};

/// Value carried through `all_gather`. Each round is homogeneous by
/// construction; the enum exists because the same synchroniser instance
/// carries errors, port lists and endpoint lists at different call sites.
#[derive(Clone, Debug, PartialEq)]
pub enum GatherPayload {
    Error(Option<String>),
    Ports(Vec<u16>),
    Endpoints(Vec<(String, u16)>),
}

struct Round {
    arrived: usize,
    generation: u64,
}

/// N-way barrier. `sync()` blocks until all `arity` participants arrive and
/// returns a caller index in `[0, arity)` assigned by arrival order within
/// the round. Every barrier crossing is a happens-before edge across all
/// participants.
pub struct Synchronizer {
    arity: usize,
    round: Mutex<Round>,
    cond: Condvar,
    slots: Mutex<Vec<Option<GatherPayload>>>,
}

impl Synchronizer {
    pub fn new(arity: usize) -> Synchronizer {
        assert!(arity > 0, "synchronizer arity must be positive");
        Synchronizer {
            arity,
            round: Mutex::new(Round {
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
            slots: Mutex::new(vec![None; arity]),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Barrier. The last arrival resets the round and wakes the rest.
    pub fn sync(&self) -> usize {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        let index = round.arrived;
        round.arrived += 1;
        if round.arrived == self.arity {
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            self.cond.notify_all();
        } else {
            let generation = round.generation;
            while round.generation == generation {
                round = self
                    .cond
                    .wait(round)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        index
    }

    /// Barrier plus exchange: every caller receives the same `arity`-length
    /// sequence, ordered by caller index.
    ///
    /// Three internal barriers: capture the index, wait for all deposits,
    /// and hold everyone until all snapshots are taken so a later round
    /// cannot overwrite a slot that has not been read yet.
    pub fn all_gather(&self, value: GatherPayload) -> Vec<GatherPayload> {
        let index = self.sync();
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots[index] = Some(value);
        }
        self.sync();
        let gathered: Vec<GatherPayload> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .map(|s| s.clone().expect("all_gather slot missing after barrier"))
                .collect()
        };
        self.sync();
        gathered
    }
}

/// Countdown latch with re-arming, carrying the quorum semantics: workers
/// `arrive()` then `wait()`; once `num_active` have arrived the gate opens;
/// each admitted worker later calls `add(1)` to re-arm the next formation.
pub struct QuorumGate {
    count: Mutex<i64>,
    cond: Condvar,
}

impl QuorumGate {
    pub fn new(n: usize) -> QuorumGate {
        QuorumGate {
            count: Mutex::new(n as i64),
            cond: Condvar::new(),
        }
    }

    pub fn arrive(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        debug_assert!(*count >= 0, "quorum gate underflow");
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn add(&self, n: usize) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += n as i64;
    }
}
