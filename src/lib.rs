//! Quilt - user-level distributed shared memory
//!
//! Gives a cluster of processes the illusion of one shared address space:
//! any node touches a shared address and transparently sees a consistent
//! view of memory that physically lives on another node.
//!
//! # Features
//!
//! - **Single virtual address space**: a pointer value names the same
//!   logical page on every node
//! - **Directory-based coherence**: single-writer/multiple-reader pages
//!   with a centralized ownership directory
//! - **Transparent migration**: bounds-checked accessors fault into the
//!   protocol, fetch pages for read or write and invalidate stale copies
//! - **Distributed synchronization**: centralized FIFO locks and barriers
//!   over the same transport
//! - **Counters**: per-node fault, migration and network statistics
//!
//! # Example
//!
//! ```no_run
//! use quilt::prelude::*;
//!
//! let node = Quilt::builder(NodeConfig::manager(7000, 1)).build()?;
//! let base = node.allocate(4096)?;
//! node.write_u64(base, 42)?;
//! assert_eq!(node.read_u64(base)?, 42);
//! # Ok::<(), DsmError>(())
//! ```

// Public API modules
pub mod prelude;
pub mod quilt;

// Engine modules
pub mod dsm;
pub mod telemetry;

// Re-export the public API at the crate root for convenience
pub use prelude::*;
