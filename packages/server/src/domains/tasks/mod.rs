pub mod data;
pub mod gate;
pub mod models;
pub mod orchestrator;

pub use orchestrator::{TaskOrchestrator, TASK_KIND};
