//! # Interruption
//!
//! Rust threads can't be interrupted out of the box, so here's a small per-thread flag in the spirit of
//! "interrupt the thread, let the blocking call fail".
//!
//! - [Interrupter::current] hands out a handle to the calling thread's flag, it could be sent to other threads
//! - [Interrupter::interrupt] raises the flag and wakes the primitive the thread is parked on (if any)
//! - a blocking call that sees the flag clears it and returns [SyncError::Interrupted]
//!
//! ## Lost wake-ups
//!
//! The parked thread checks the flag while holding the primitive's lock and only then goes to `Condvar::wait`,
//! which releases the lock atomically. The interrupter wakes the primitive under the very same lock.
//! So it either comes before the check (the check sees the flag) or after the thread got parked (the wake reaches it).
//!
//! Registration of the primitive goes through the `parked_on` mutex. If the interrupter saw nothing registered,
//! its flag store happens-before the registration, hence before the check.
//!
//! Locking order is always "primitive, then `parked_on`" for the waiter. The interrupter never holds both.

use std::sync::{
    atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
    Arc, Mutex, PoisonError,
};

use tracing::trace;

use crate::error::{Result, SyncError};

/// A primitive that can wake its parked threads on request
pub(crate) trait Unpark: Send + Sync {
    /// must take the primitive's lock before notifying
    fn unpark(&self);
}

#[derive(Default)]
struct InterruptState {
    interrupted: AtomicBool,
    parked_on: Mutex<Option<Arc<dyn Unpark>>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState::default());
}

/// Handle to interrupt a particular thread
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// the calling thread's handle
    pub fn current() -> Self {
        CURRENT.with(|state| Self {
            state: Arc::clone(state),
        })
    }

    /// Raise the flag and kick the thread out of its wait.
    /// The flag stays raised until a blocking call (or [interrupted]) consumes it.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Release);
        // clone and let go of parked_on before touching the primitive's lock
        let parked_on = self
            .state
            .parked_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(primitive) = parked_on {
            trace!("waking an interrupted thread");
            primitive.unpark();
        }
    }

    /// peek without clearing
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Acquire)
    }
}

/// Test and clear the calling thread's flag
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.swap(false, Acquire))
}

/// Marks the calling thread as parked on a primitive for as long as it lives
pub(crate) struct Parking {
    state: Arc<InterruptState>,
}

impl Parking {
    /// should be called with the primitive's lock held
    pub(crate) fn enter(primitive: Arc<dyn Unpark>) -> Self {
        let state = CURRENT.with(Arc::clone);
        *state
            .parked_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(primitive);
        Self { state }
    }

    /// consume the flag if it's up, should be called with the primitive's lock held
    pub(crate) fn checkpoint(&self) -> Result<()> {
        // cheap load first, the swap is only needed when there's something to clear
        if self.state.interrupted.load(Relaxed) && self.state.interrupted.swap(false, Acquire) {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }
}

impl Drop for Parking {
    fn drop(&mut self) {
        self.state
            .parked_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn test_flag_is_per_thread() {
        let me = Interrupter::current();
        let other = thread::spawn(|| {
            let handle = Interrupter::current();
            handle.interrupt();
            handle.is_interrupted()
        })
        .join()
        .unwrap();

        assert!(other);
        assert!(!me.is_interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn test_interrupted_clears_the_flag() {
        Interrupter::current().interrupt();
        assert!(Interrupter::current().is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn test_checkpoint_consumes_the_flag() {
        struct Nobody;
        impl Unpark for Nobody {
            fn unpark(&self) {}
        }

        let parking = Parking::enter(Arc::new(Nobody));
        assert_eq!(Ok(()), parking.checkpoint());
        Interrupter::current().interrupt();
        assert_eq!(Err(SyncError::Interrupted), parking.checkpoint());
        assert_eq!(Ok(()), parking.checkpoint());
    }
}
