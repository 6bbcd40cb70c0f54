pub mod orchestrator;
pub mod strategy;
pub mod types;
