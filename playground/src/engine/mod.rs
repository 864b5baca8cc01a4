//! Execution engine: sandbox management and job orchestration

pub mod executer;
pub mod sandbox;
