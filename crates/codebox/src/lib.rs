pub mod artifacts;
pub mod config;
pub mod dispatch;
pub mod llm;
pub mod logger;
pub mod plot;
pub mod prompts;
pub mod sandbox;

pub use dispatch::{Dispatcher, ExecutionResult, FaultKind};
pub use prompts::Action;
