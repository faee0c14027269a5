//! Page coherence: directory, authority access and the migration protocol

pub mod authority;
pub mod directory;
pub mod migration;

pub use authority::{CoherenceAuthority, DirPending, LocalAuthority, RemoteAuthority};
pub use directory::{Directory, DirectoryEvent};
