//! Session Supervisor variants: local subprocess and containerized, plus
//! the shared contract and event types they both speak.

pub mod container;
pub mod local;
pub mod trait_def;
pub mod types;

pub use container::{ContainerSupervisor, EmergencyCleanupRegistry};
pub use local::LocalSupervisor;
pub use trait_def::Supervisor;
pub use types::{AgentEvent, AgentHandle, MaterializedTask, UsageReading};
