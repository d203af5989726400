//! # Monitor
//!
//! A lock paired with a condition variable: one thread does some work, waits, and continues once another thread
//! (holding the same lock) signals it.
//!
//! The interface is guard-based, as it's for [std::sync::Condvar]:
//! - [Monitor::acquire] locks and returns a [MonitorGuard], dropping the guard is the only way to unlock
//! - [MonitorGuard::await_signal] takes the guard (a proof the lock is held), unlocks, parks, re-locks
//! - [MonitorGuard::signal] wakes everyone parked, but keeps the lock
//!
//! ## Notify then continue
//!
//! Signalling doesn't yield the lock. The waiter has to re-lock before returning from the wait,
//! so the rest of the signaller's critical section always runs first:
//!
//! ```text
//! A: acquire, m1, await_signal .................. m2
//! B:                           acquire, m3, signal, m4, (unlock)
//! ```
//!
//! ## Spurious wake-ups
//!
//! Condvars may wake up for no reason. A counter of signals sits behind the lock, the waiter remembers its value
//! and goes back to sleep until the counter changes. Same trick as the futex-based condvar's counter,
//! just guarded by the mutex instead of being atomic.
//!
//! A signal sent with nobody waiting isn't remembered anywhere: the counter moves, but a later waiter
//! snapshots the moved value.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, scope},
    time::{Duration, Instant},
};

use tracing::{info, trace, warn};

use crate::{
    error::{Result, SyncError},
    interrupt::{Parking, Unpark},
};

struct MonitorState {
    signals: u64,
    waiters: usize,
}

struct MonitorCore {
    lock: Mutex<MonitorState>,
    condition: Condvar,
}

impl MonitorCore {
    /// Nothing leaves [MonitorState] half-updated on panic, so a poisoned lock is still good to use
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Unpark for MonitorCore {
    fn unpark(&self) {
        let _state = self.lock();
        self.condition.notify_all();
    }
}

pub struct Monitor {
    core: Arc<MonitorCore>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            core: Arc::new(MonitorCore {
                lock: Mutex::new(MonitorState {
                    signals: 0,
                    waiters: 0,
                }),
                condition: Condvar::new(),
            }),
        }
    }

    /// Scoped locking, the lock is held until the guard is dropped (or parked in [MonitorGuard::await_signal])
    pub fn acquire(&self) -> MonitorGuard<'_> {
        MonitorGuard {
            monitor: self,
            state: self.core.lock(),
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the monitor's lock is held
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    state: MutexGuard<'a, MonitorState>,
}

impl<'a> MonitorGuard<'a> {
    /// Unlock, sleep until signalled, lock again.
    ///
    /// # Errors
    /// [SyncError::Interrupted] if the thread was interrupted before or while waiting.
    /// The lock is released in this case, as the guard is gone.
    pub fn await_signal(self) -> Result<Self> {
        self.wait(None)
    }

    /// Same as [Self::await_signal], but gives up with [SyncError::TimedOut] after `timeout`.
    /// A timeout too far away to be represented means no deadline at all.
    pub fn await_signal_timeout(self, timeout: Duration) -> Result<Self> {
        self.wait(Instant::now().checked_add(timeout))
    }

    /// Wake all the threads waiting on the monitor. They proceed once this guard is gone.
    pub fn signal(&mut self) {
        self.state.signals = self.state.signals.wrapping_add(1);
        trace!(waiters = self.state.waiters, "signalling");
        self.monitor.core.condition.notify_all();
    }

    /// number of threads parked in [Self::await_signal] right now
    pub fn waiters(&self) -> usize {
        self.state.waiters
    }

    fn wait(self, deadline: Option<Instant>) -> Result<Self> {
        let Self { monitor, mut state } = self;
        let core = &monitor.core;

        let parking = Parking::enter(Arc::clone(core) as Arc<dyn Unpark>);
        let seen = state.signals;
        state.waiters += 1;
        trace!("waiting for a signal");

        let outcome = loop {
            if state.signals != seen {
                break Ok(());
            }
            if let Err(e) = parking.checkpoint() {
                break Err(e);
            }
            state = match deadline {
                None => core
                    .condition
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(SyncError::TimedOut);
                    }
                    core.condition
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };

        state.waiters -= 1;
        drop(parking);

        match outcome {
            Ok(()) => Ok(Self { monitor, state }),
            Err(e) => {
                warn!(error = %e, "monitor wait failed");
                Err(e) // the state guard drops here => unlocked
            }
        }
    }
}

/// Lock the monitor once somebody is parked on it, so the signal is never sent into the void
fn acquire_once_parked(monitor: &Monitor) -> MonitorGuard<'_> {
    loop {
        let guard = monitor.acquire();
        if guard.waiters() > 0 {
            return guard;
        }
        drop(guard);
        thread::sleep(Duration::from_millis(1));
    }
}

/// The two-role handshake: the waiter prints 1 then 2, the notifier 3 then 4.
/// The output is always 1, 3, 4, 2.
pub fn run() {
    let monitor = Monitor::new();
    scope(|s| {
        s.spawn(|| {
            let guard = monitor.acquire();
            info!("1");
            match guard.await_signal() {
                Ok(_guard) => info!("2"),
                Err(e) => warn!(error = %e, "the waiter gave up"),
            }
        });
        s.spawn(|| {
            let mut guard = acquire_once_parked(&monitor);
            info!("3");
            guard.signal();
            info!("4");
        });
    });
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;

    use crate::interrupt::Interrupter;
    use crate::logging::init_test_logging;

    use super::*;

    #[test]
    fn test_handshake_order() {
        init_test_logging();

        // vary who starts first, the notifier holds off until the waiter is parked anyway
        for delay in [0, 1, 5, 20] {
            let monitor = Monitor::new();
            let events = Mutex::new(Vec::new());
            let log = |e: u8| events.lock().unwrap().push(e);

            scope(|s| {
                s.spawn(|| {
                    thread::sleep(Duration::from_millis(delay));
                    let guard = monitor.acquire();
                    log(1);
                    let _guard = guard.await_signal().unwrap();
                    log(2);
                });
                s.spawn(|| {
                    let mut guard = acquire_once_parked(&monitor);
                    log(3);
                    guard.signal();
                    // give the waiter a chance to run ahead, it shouldn't
                    thread::sleep(Duration::from_millis(10));
                    log(4);
                });
            });

            assert_eq!(vec![1, 3, 4, 2], events.into_inner().unwrap());
        }
    }

    #[test]
    fn test_signal_wakes_everyone() {
        init_test_logging();
        let monitor = Monitor::new();

        scope(|s| {
            let waiters: Vec<_> = (0..3)
                .map(|_| s.spawn(|| monitor.acquire().await_signal().map(|_| ())))
                .collect();

            loop {
                let mut guard = monitor.acquire();
                if guard.waiters() == 3 {
                    guard.signal();
                    break;
                }
                drop(guard);
                thread::sleep(Duration::from_millis(1));
            }

            for waiter in waiters {
                assert_eq!(Ok(()), waiter.join().unwrap());
            }
        });
        assert_eq!(0, monitor.acquire().waiters());
    }

    #[test]
    fn test_signal_without_waiters_is_lost() {
        let monitor = Monitor::new();
        monitor.acquire().signal();

        let result = monitor
            .acquire()
            .await_signal_timeout(Duration::from_millis(50));
        assert!(matches!(result, Err(SyncError::TimedOut)));
        // the lock isn't stuck after the error
        assert_eq!(0, monitor.acquire().waiters());
    }

    #[test]
    fn test_huge_timeout_waits_for_the_signal() {
        let monitor = Monitor::new();

        scope(|s| {
            let waiter = s.spawn(|| {
                monitor
                    .acquire()
                    .await_signal_timeout(Duration::MAX)
                    .map(|_| ())
            });
            acquire_once_parked(&monitor).signal();
            assert_eq!(Ok(()), waiter.join().unwrap());
        });
    }

    #[test]
    fn test_interrupt_while_parked() {
        init_test_logging();
        let monitor = Monitor::new();
        let (tx, rx) = mpsc::channel();

        scope(|s| {
            let victim = s.spawn(|| {
                tx.send(Interrupter::current()).unwrap();
                monitor.acquire().await_signal().map(|_| ())
            });
            let bystander = s.spawn(|| monitor.acquire().await_signal().map(|_| ()));

            let interrupter = rx.recv().unwrap();
            while monitor.acquire().waiters() < 2 {
                thread::sleep(Duration::from_millis(1));
            }
            interrupter.interrupt();
            assert_eq!(Err(SyncError::Interrupted), victim.join().unwrap());
            // the flag is consumed by the failed wait
            assert!(!interrupter.is_interrupted());

            // the other waiter is still there and still gets its signal
            let mut guard = acquire_once_parked(&monitor);
            assert_eq!(1, guard.waiters());
            guard.signal();
            drop(guard);
            assert_eq!(Ok(()), bystander.join().unwrap());
        });
    }

    #[test]
    fn test_interrupted_before_waiting() {
        let monitor = Monitor::new();
        Interrupter::current().interrupt();

        let result = monitor.acquire().await_signal();
        assert!(matches!(result, Err(SyncError::Interrupted)));
        assert!(!crate::interrupt::interrupted());
    }
}
