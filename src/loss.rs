//! Deliberate, configurable loss of outgoing segments, used to exercise the recovery paths.
//!
//! Both roles consult a [LossSimulator] before sending a unit that the protocol is designed to
//!  lose: the server for DATA and FEC segments, the client for ACKs. A dropped unit is accounted
//!  for as if it had been sent.

#[cfg(test)] use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use crate::packet_header::SegmentKind;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OutgoingUnit {
    pub kind: SegmentKind,
    pub seqn: u32,
}

impl OutgoingUnit {
    pub fn new(kind: SegmentKind, seqn: u32) -> OutgoingUnit {
        OutgoingUnit { kind, seqn }
    }
}

#[cfg_attr(test, automock)]
pub trait LossSimulator: Send {
    fn should_drop(&mut self, unit: OutgoingUnit) -> bool;
}

pub struct NoLoss;

impl LossSimulator for NoLoss {
    fn should_drop(&mut self, _unit: OutgoingUnit) -> bool {
        false
    }
}

/// Drops each unit independently with a fixed probability. The RNG is seeded explicitly so that
///  a run can be reproduced.
pub struct RandomLoss {
    probability: f64,
    rng: StdRng,
}

impl RandomLoss {
    pub fn new(probability: f64, seed: u64) -> RandomLoss {
        RandomLoss {
            probability,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl LossSimulator for RandomLoss {
    fn should_drop(&mut self, _unit: OutgoingUnit) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        self.rng.gen::<f64>() < self.probability
    }
}

/// Builds the loss simulator for a configured drop probability: negative or zero turns loss off
pub fn for_probability(probability: f64, seed: u64) -> Box<dyn LossSimulator> {
    if probability > 0.0 {
        Box::new(RandomLoss::new(probability, seed))
    }
    else {
        Box::new(NoLoss)
    }
}

/// An exact loss schedule: units registered with [ScriptedLoss::drop_once] are dropped the first
///  time they are sent and go through on retransmission, units registered with
///  [ScriptedLoss::drop_always] never go through.
#[derive(Default)]
pub struct ScriptedLoss {
    once: FxHashSet<OutgoingUnit>,
    always: FxHashSet<OutgoingUnit>,
}

impl ScriptedLoss {
    pub fn new() -> ScriptedLoss {
        Default::default()
    }

    pub fn drop_once(mut self, kind: SegmentKind, seqn: u32) -> ScriptedLoss {
        self.once.insert(OutgoingUnit::new(kind, seqn));
        self
    }

    pub fn drop_always(mut self, kind: SegmentKind, seqn: u32) -> ScriptedLoss {
        self.always.insert(OutgoingUnit::new(kind, seqn));
        self
    }
}

impl LossSimulator for ScriptedLoss {
    fn should_drop(&mut self, unit: OutgoingUnit) -> bool {
        self.always.contains(&unit) || self.once.remove(&unit)
    }
}
