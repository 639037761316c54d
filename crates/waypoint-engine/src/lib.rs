//! Orchestration engine: the tool registry, the chat turn runner, the
//! deployment progress tracker, story generation, and status polling.

pub mod deploy;
pub mod error;
pub mod generation;
pub mod providers;
pub mod registry;
pub mod runner;
pub mod status;
pub mod tools;

pub use deploy::DeploymentTracker;
pub use error::EngineError;
pub use generation::GenerationService;
pub use registry::{KeywordStageResolver, StageResolver, ToolRegistry, ToolSource};
pub use runner::{ChatRunner, RunnerConfig, TurnOutcome, TurnRequest};
pub use status::{task_snapshot, PollEvent, PollWatcher};
