pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod stats;
pub mod streaks;
pub mod types;

pub use orchestrator::WorkflowOrchestrator;
