pub mod config;
pub mod error;
pub mod types;

pub use config::{NodeConfig, RaftConfig};
pub use error::{StoreError, StoreResult};
pub use types::{ClusterMember, ClusterMembership, LogIndex, NodeId, Term};
