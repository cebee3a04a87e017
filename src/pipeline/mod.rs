// src/pipeline/mod.rs

pub mod orchestrator;
pub mod session;
pub mod shutdown;

pub use orchestrator::{PipelineOrchestrator, PipelineSettings, RunOutcome};
pub use session::SessionSummary;
pub use shutdown::ShutdownSignal;
