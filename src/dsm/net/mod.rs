//! Networking: wire protocol, transports and the dispatch loop

pub mod dispatch;
pub mod handlers;
pub mod protocol;
pub mod transport;

pub use dispatch::Dispatcher;
pub use protocol::{Message, WireHeader, MSG_MAGIC};
pub use transport::{LoopbackHub, LoopbackTransport, TcpTransport, Transport};
