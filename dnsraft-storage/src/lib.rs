//! Replicated record storage: a string map kept consistent across nodes by
//! Raft.

pub mod raft;
pub mod shutdown;
pub mod store;

pub use raft::node::{NodeRole, NodeStatus};
pub use raft::transport::{MemoryNetwork, TcpTransport, Transport};
pub use shutdown::Shutdown;
pub use store::Store;
