pub mod budget;
pub mod connections;

pub use budget::{CallBudget, CallLimits, TrackerLease};
pub use connections::{ClusterConnections, ConnectedCluster};
