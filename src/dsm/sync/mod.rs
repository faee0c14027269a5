//! Distributed synchronization primitives: centralized FIFO locks and
//! barriers built on the same transport as the coherence core

pub mod barrier;
pub mod lock;

pub use barrier::BarrierRegistry;
pub use lock::LockRegistry;
