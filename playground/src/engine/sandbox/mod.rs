//! Sandbox layer
//!
//! - [`SandboxBackend`]: box init / stage run / cleanup, implemented by [`IsolateBackend`]
//! - [`SandboxPool`]: fixed set of boxes leased one job at a time
//! - [`meta`], [`capture`]: isolate meta parsing and bounded output capture

pub mod capture;
pub mod config;
#[cfg(test)]
pub mod fake;
pub mod isolate_box;
pub mod meta;
pub mod pool;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::core::outcome::Outcome;
use crate::core::runtimes::{ResourceCaps, Stage, StageLimits};

pub use capture::CapturedOutput;
pub use config::SandboxConfig;
pub use isolate_box::IsolateBackend;
pub use pool::{SandboxLease, SandboxPool};

/// Everything a backend needs to run one stage
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: Stage,
    /// Program and arguments, executed from the box working directory
    pub command: Vec<String>,
    pub stdin: Option<String>,
    pub limits: StageLimits,
    pub caps: ResourceCaps,
    pub env: Vec<(String, String)>,
    /// Host directory mounted read-only at `/runtime`
    pub mount: Option<PathBuf>,
}

/// Result of one stage as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order
    pub output: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub status: Option<&'static str>,
    pub message: Option<String>,
    /// Output hit `output_max_size` and was cut
    pub truncated: bool,
    /// Peak memory in bytes
    pub memory: Option<u64>,
    /// CPU time in milliseconds
    pub cpu_time: Option<u64>,
    /// Wall time in milliseconds
    pub wall_time: Option<u64>,
    #[serde(skip)]
    pub outcome: Outcome,
}

impl StageResult {
    pub fn new(outcome: Outcome, captured: CapturedOutput) -> Self {
        Self {
            stdout: captured.stdout,
            stderr: captured.stderr,
            output: captured.output,
            code: outcome.code(),
            signal: outcome.signal().map(str::to_string),
            status: outcome.status(),
            message: captured.message,
            truncated: captured.truncated,
            memory: None,
            cpu_time: None,
            wall_time: None,
            outcome,
        }
    }

    /// The stage finished by exiting with code 0
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Isolation primitive driven by the pool and the orchestrator
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Reset box `box_id` to a pristine state and return its working directory
    async fn init(&self, box_id: u32) -> Result<PathBuf>;

    /// Run one stage inside an initialised box
    async fn run(&self, box_id: u32, request: &StageRequest) -> Result<StageResult>;

    /// Kill every process in the box and delete its filesystem
    async fn cleanup(&self, box_id: u32) -> Result<()>;
}
