//! Distributed shared memory engine
//!
//! The subsystems, leaves first: `types` (vocabulary), `memory` (page
//! table, permission layer, fault trap, allocator), `coherence` (directory,
//! authority access, migration protocol), `net` (wire protocol, transport,
//! dispatch), `sync` (distributed locks and barriers), `context` (the
//! per-node handle tying them together).

pub mod coherence;
pub mod config;
pub mod context;
pub mod memory;
pub mod net;
pub mod sync;
pub mod types;
