pub mod atomic;
pub mod commands;
pub mod config;
pub mod error;
pub mod launcher;
pub mod liveness;
pub mod logs;
pub mod masking;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod section;
pub mod store;
pub mod worker;

pub use error::{ErrorBody, OrchestratorError};
pub use orchestrator::{Orchestrator, StartReport, StatusReport, StopReport, Termination};
pub use registry::WorkerStatus;
