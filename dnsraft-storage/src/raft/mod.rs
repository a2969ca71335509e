// Raft log, consensus node, and the runtime that drives it
pub mod log;
pub mod node;
pub mod rpc;
pub(crate) mod runtime;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod transport;
