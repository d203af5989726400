//! # Phase barrier
//!
//! A reusable barrier for a changing set of parties. Each phase ends when every registered party has arrived,
//! then the phase number goes up and all the parked parties are released together.
//!
//! Parties are identified by [Party] handles from a registration table. The table is an arena:
//! slots are never reused, so a handle of a deregistered party stays deregistered forever.
//! It lets the barrier tell misuse (arriving twice, arriving after deregistration) apart from normal arrivals.
//!
//! Everything sits behind a single mutex: the counters, the phase and the table.
//! Arrival counting and phase advancement can't race each other this way.
//!
//! ## Advancing
//!
//! The phase advances as soon as `arrived >= required` is seen under the lock. It happens either on an arrival
//! or on a deregistration, which lowers `required`. The party that completes a phase doesn't park at all.
//!
//! Deregistering the last party advances the phase one last time and terminates the barrier.
//!
//! ## Waking
//!
//! Waiters remember the phase they arrived in and sleep until the phase differs.
//! Wakeups are broadcast, a spurious or stray wakeup just puts the waiter back to sleep.

use std::{
    fmt::{self, Display},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::scope,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    error::{Result, SyncError},
    interrupt::{Parking, Unpark},
};

/// A participant's handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Party(usize);

impl Party {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party #{}", self.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Registered { last_arrival: Option<u64> },
    Deregistered,
}

#[derive(Debug)]
struct BarrierState {
    phase: u64,
    /// 0 <= arrived <= required
    required: usize,
    arrived: usize,
    slots: Vec<Slot>,
    terminated: bool,
}

impl BarrierState {
    /// count the arrival, return its phase
    fn arrive(&mut self, party: Party) -> Result<u64> {
        let phase = self.phase;
        match self.slots.get_mut(party.0) {
            None => Err(SyncError::illegal(format!("{party} is unknown to the barrier"))),
            Some(Slot::Deregistered) => Err(SyncError::illegal(format!(
                "{party} is deregistered and can't arrive"
            ))),
            Some(Slot::Registered {
                last_arrival: Some(last),
            }) if *last == phase => Err(SyncError::illegal(format!(
                "{party} has already arrived in phase {phase}"
            ))),
            Some(Slot::Registered { last_arrival }) => {
                *last_arrival = Some(phase);
                self.arrived += 1;
                Ok(phase)
            }
        }
    }

    /// arrive and leave for good, return the arrival phase
    fn deregister(&mut self, party: Party) -> Result<u64> {
        let phase = self.phase;
        match self.slots.get_mut(party.0) {
            None => Err(SyncError::illegal(format!("{party} is unknown to the barrier"))),
            Some(Slot::Deregistered) => Err(SyncError::illegal(format!(
                "{party} is already deregistered"
            ))),
            Some(Slot::Registered {
                last_arrival: Some(last),
            }) if *last == phase => Err(SyncError::illegal(format!(
                "{party} has already arrived in phase {phase}"
            ))),
            Some(slot) => {
                // leaving counts as the arrival, so `arrived` stays as is and `required` shrinks
                *slot = Slot::Deregistered;
                self.required -= 1;
                Ok(phase)
            }
        }
    }

    /// move to the next phase if nobody is missing
    fn try_advance(&mut self) -> bool {
        if self.arrived < self.required {
            return false;
        }
        self.arrived = 0;
        self.phase += 1;
        if self.required == 0 {
            self.terminated = true;
        }
        true
    }
}

struct BarrierCore {
    state: Mutex<BarrierState>,
    advanced: Condvar,
}

impl BarrierCore {
    /// the state is never left half-updated, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Unpark for BarrierCore {
    fn unpark(&self) {
        let _state = self.lock();
        self.advanced.notify_all();
    }
}

pub struct PhaseBarrier {
    core: Arc<BarrierCore>,
}

impl PhaseBarrier {
    /// A barrier in phase 0 with `parties` registered, see [Self::parties] for their handles
    pub fn new(parties: usize) -> Self {
        Self {
            core: Arc::new(BarrierCore {
                state: Mutex::new(BarrierState {
                    phase: 0,
                    required: parties,
                    arrived: 0,
                    slots: vec![Slot::Registered { last_arrival: None }; parties],
                    terminated: false,
                }),
                advanced: Condvar::new(),
            }),
        }
    }

    /// Add a party, it's expected to arrive starting from the current phase
    ///
    /// # Errors
    /// [SyncError::IllegalState] once the barrier is terminated
    pub fn register(&self) -> Result<Party> {
        let mut state = self.core.lock();
        if state.terminated {
            warn!("registration on a terminated barrier");
            return Err(SyncError::illegal("the barrier is terminated"));
        }
        let party = Party(state.slots.len());
        state.slots.push(Slot::Registered { last_arrival: None });
        state.required += 1;
        debug!(%party, parties = state.required, "registered");
        Ok(party)
    }

    /// handles of the currently registered parties
    pub fn parties(&self) -> Vec<Party> {
        self.core
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Registered { .. }))
            .map(|(i, _)| Party(i))
            .collect()
    }

    /// Arrive without waiting for the others. Returns the arrival phase.
    pub fn arrive(&self, party: Party) -> Result<u64> {
        let mut state = self.core.lock();
        let phase = state.arrive(party).inspect_err(log_misuse)?;
        trace!(%party, phase, "arrived");
        self.advance_if_complete(&mut state);
        Ok(phase)
    }

    /// Arrive and leave the barrier. If it was the last missing arrival, the phase advances.
    /// Returns the arrival phase.
    ///
    /// The party must not be used after that, any further arrival is [SyncError::IllegalState].
    pub fn arrive_and_deregister(&self, party: Party) -> Result<u64> {
        let mut state = self.core.lock();
        let phase = state.deregister(party).inspect_err(log_misuse)?;
        debug!(%party, phase, parties = state.required, "deregistered");
        self.advance_if_complete(&mut state);
        Ok(phase)
    }

    /// Arrive and park until all the other parties arrive.
    /// Returns the phase the barrier moved on to.
    ///
    /// # Errors
    /// - [SyncError::IllegalState] on misuse, nothing is counted then
    /// - [SyncError::Interrupted] if interrupted while parked, the arrival stays counted
    pub fn arrive_and_await_advance(&self, party: Party) -> Result<u64> {
        self.arrive_and_wait(party, None)
    }

    /// Same as [Self::arrive_and_await_advance], but gives up with [SyncError::TimedOut] after `timeout`.
    /// The arrival stays counted. A timeout too far away to be represented means no deadline at all.
    pub fn arrive_and_await_advance_timeout(&self, party: Party, timeout: Duration) -> Result<u64> {
        self.arrive_and_wait(party, Instant::now().checked_add(timeout))
    }

    /// Park until the barrier leaves `phase`, returns the current phase.
    /// Returns straight away if the barrier is past `phase` already, or terminated:
    /// the phase of a terminated barrier never changes, so its last phase is returned as is.
    pub fn await_advance(&self, phase: u64) -> Result<u64> {
        let state = self.core.lock();
        self.wait_for_advance(state, phase, None)
    }

    pub fn phase(&self) -> u64 {
        self.core.lock().phase
    }

    pub fn registered_parties(&self) -> usize {
        self.core.lock().required
    }

    pub fn arrived_parties(&self) -> usize {
        self.core.lock().arrived
    }

    pub fn unarrived_parties(&self) -> usize {
        let state = self.core.lock();
        state.required - state.arrived
    }

    /// the last party has deregistered
    pub fn is_terminated(&self) -> bool {
        self.core.lock().terminated
    }

    fn arrive_and_wait(&self, party: Party, deadline: Option<Instant>) -> Result<u64> {
        let mut state = self.core.lock();
        let phase = state.arrive(party).inspect_err(log_misuse)?;
        trace!(%party, phase, "arrived, waiting for the others");
        self.advance_if_complete(&mut state);
        self.wait_for_advance(state, phase, deadline)
    }

    fn advance_if_complete(&self, state: &mut BarrierState) {
        if state.try_advance() {
            debug!(
                phase = state.phase,
                parties = state.required,
                terminated = state.terminated,
                "phase advanced"
            );
            self.core.advanced.notify_all();
        }
    }

    fn wait_for_advance(
        &self,
        mut state: MutexGuard<'_, BarrierState>,
        phase: u64,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        // termination always comes with an advance, so checking it once up front is enough
        if state.phase != phase || state.terminated {
            return Ok(state.phase);
        }

        let core = &self.core;
        let parking = Parking::enter(Arc::clone(core) as Arc<dyn Unpark>);
        loop {
            if state.phase != phase {
                return Ok(state.phase);
            }
            if let Err(e) = parking.checkpoint() {
                warn!(phase, "interrupted while waiting for the phase to advance");
                return Err(e);
            }
            state = match deadline {
                None => core
                    .advanced
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(phase, "timed out waiting for the phase to advance");
                        return Err(SyncError::TimedOut);
                    }
                    core.advanced
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

fn log_misuse(e: &SyncError) {
    warn!(error = %e, "barrier misuse");
}

fn worker(barrier: &PhaseBarrier, party: Party) -> Result<()> {
    info!(%party, "started phase 1, waiting for the rest");
    barrier.arrive_and_await_advance(party)?;
    info!(%party, "started phase 2, waiting again");
    barrier.arrive_and_await_advance(party)?;
    info!(%party, "done");
    barrier.arrive_and_deregister(party)?;
    Ok(())
}

/// Every worker goes through 2 phases in lockstep, then leaves the barrier
pub fn run(workers: usize) {
    let barrier = PhaseBarrier::new(workers);
    scope(|s| {
        for party in barrier.parties() {
            let barrier = &barrier;
            s.spawn(move || {
                if let Err(e) = worker(barrier, party) {
                    warn!(%party, error = %e, "worker failed");
                }
            });
        }
    });
    info!(
        phase = barrier.phase(),
        terminated = barrier.is_terminated(),
        "all workers left"
    );
}
