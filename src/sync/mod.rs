//! Synchronization: network metrics, the leader/follower coordinator and
//! the session task that drives both

pub mod metrics;
pub mod coordinator;
pub mod session;

pub use metrics::{network_entropy, network_free_energy};
pub use coordinator::{LastSync, SyncCoordinator, SyncOutcome};
pub use session::{SessionEvent, SessionHandle, SessionState, SessionStatus, SyncSession};
