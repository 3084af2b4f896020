//! Turn capture and task-state coordination for monitored agent sessions.
//!
//! Three sources report on each monitored entity: real-time lifecycle signals
//! (tier 1), the agent's transcript (tier 2) and raw terminal output
//! (tier 3). All writes for one entity run under that entity's advisory lock,
//! which is the only exclusion shared between processes.

pub mod admission;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod process;
pub mod reconciler;
pub mod sampler;
pub mod state_machine;
pub mod store;
pub mod transcript;
pub mod watchdog;
pub mod workers;
