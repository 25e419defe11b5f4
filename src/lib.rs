// src/lib.rs

// The task control plane: see src/orchestrator/mod.rs for the component breakdown.
pub mod orchestrator;

pub use orchestrator::{Config, GraphContext, OrchestratorError, Task, TaskStore};
