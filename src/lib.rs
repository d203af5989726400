pub mod error;
pub mod interrupt;
pub mod logging;
pub mod monitor;
pub mod phase_barrier;

pub use error::{Result, SyncError};
pub use interrupt::Interrupter;
pub use monitor::{Monitor, MonitorGuard};
pub use phase_barrier::{Party, PhaseBarrier};
