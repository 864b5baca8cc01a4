//! Job orchestration
//!
//! Drives one job through its lifecycle on a leased sandbox:
//!
//! ```text
//! Created -> Primed -> [Compiling -> CompileFailed | Compiled] -> Running
//!         -> RunFailed | Completed -> CleanedUp
//! ```
//!
//! Cleanup runs on every path, including failed priming and engine errors.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, warn};

use crate::core::runtimes::Stage;
use crate::core::utils::is_safe_relative_path;
use crate::engine::sandbox::{SandboxLease, SandboxPool, StageResult};
use crate::error::EngineError;
use crate::jobs::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Primed,
    Compiling,
    CompileFailed,
    Compiled,
    Running,
    RunFailed,
    Completed,
    CleanedUp,
}

/// Stage results of a finished job. `run` is absent when compilation failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<StageResult>,
    pub run: Option<StageResult>,
}

impl ExecutionResult {
    /// Response shape for `/execute`: a missing run stage mirrors compile
    pub fn with_run_fallback(mut self) -> Self {
        if self.run.is_none() {
            self.run = self.compile.clone();
        }
        self
    }
}

pub struct JobExecution {
    job: Job,
    state: JobState,
    pool: Arc<SandboxPool>,
    lease: Option<SandboxLease>,
}

fn infra(e: anyhow::Error) -> EngineError {
    EngineError::Infrastructure(e)
}

impl JobExecution {
    pub fn new(job: Job, pool: Arc<SandboxPool>) -> Self {
        Self {
            job,
            state: JobState::Created,
            pool,
            lease: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn expect_state(&self, expected: JobState) -> Result<(), EngineError> {
        if self.state != expected {
            return Err(infra(anyhow::anyhow!(
                "job {} is {:?}, expected {:?}",
                self.job.id,
                self.state,
                expected
            )));
        }
        Ok(())
    }

    /// Lease a sandbox and stage the job's files into it
    pub async fn prime(&mut self) -> Result<(), EngineError> {
        self.expect_state(JobState::Created)?;

        let lease = self.pool.acquire().await?;
        let work_dir = lease.work_dir().to_path_buf();
        self.lease = Some(lease);

        for file in &self.job.files {
            if !is_safe_relative_path(&file.name) {
                return Err(infra(anyhow::anyhow!(
                    "file path {:?} escapes the working directory",
                    file.name
                )));
            }
            let path = work_dir.join(&file.name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))
                    .map_err(infra)?;
            }
            let content = file.decode().map_err(infra)?;
            fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))
                .map_err(infra)?;
        }

        self.state = JobState::Primed;
        Ok(())
    }

    async fn run_stage(&self, stage: Stage) -> Result<Option<StageResult>, EngineError> {
        let Some(request) = self.job.stage_request(stage) else {
            return Ok(None);
        };
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| infra(anyhow::anyhow!("job {} holds no sandbox", self.job.id)))?;

        let result = self
            .pool
            .backend()
            .run(lease.box_id(), &request)
            .await
            .with_context(|| format!("{} stage of job {}", stage.as_str(), self.job.id))
            .map_err(infra)?;
        Ok(Some(result))
    }

    /// Compile (when the runtime has a compiler) and run. A failed compile
    /// skips the run stage.
    pub async fn execute(&mut self) -> Result<ExecutionResult, EngineError> {
        self.expect_state(JobState::Primed)?;
        let mut result = ExecutionResult::default();

        if self.job.runtime.is_compiled() {
            self.state = JobState::Compiling;
            let compile = self.run_stage(Stage::Compile).await?;
            let failed = compile.as_ref().is_some_and(|c| !c.is_success());
            result.compile = compile;

            if failed {
                self.state = JobState::CompileFailed;
                info!("Job {} compile failed; skipping run", self.job.id);
                return Ok(result);
            }
            self.state = JobState::Compiled;
        }

        self.state = JobState::Running;
        let run = self.run_stage(Stage::Run).await?;
        self.state = match &run {
            Some(r) if r.is_success() => JobState::Completed,
            _ => JobState::RunFailed,
        };
        result.run = run;

        Ok(result)
    }

    /// Release the sandbox. Safe to call more than once.
    pub async fn cleanup(&mut self) -> Result<(), EngineError> {
        let Some(lease) = self.lease.take() else {
            self.state = JobState::CleanedUp;
            return Ok(());
        };
        let released = self.pool.release(lease).await;
        self.state = JobState::CleanedUp;
        released
    }
}

/// Run a job from start to finish. Cleanup always happens; its failure takes
/// precedence over the job's own result.
pub async fn run_job(pool: Arc<SandboxPool>, job: Job) -> Result<ExecutionResult, EngineError> {
    let job_id = job.id;
    let runtime = format!("{}-{}", job.runtime.language, job.runtime.version);
    info!("Job {} started ({})", job_id, runtime);

    let mut execution = JobExecution::new(job, pool);
    let outcome = match execution.prime().await {
        Ok(()) => execution.execute().await,
        Err(e) => Err(e),
    };
    let final_state = execution.state();
    let cleaned = execution.cleanup().await;

    match (outcome, cleaned) {
        (Ok(result), Ok(())) => {
            info!("Job {} finished: {:?}", job_id, final_state);
            Ok(result)
        }
        (Err(e), Ok(())) => {
            warn!("Job {} failed in {:?}: {}", job_id, final_state, e);
            Err(e)
        }
        (outcome, Err(cleanup)) => {
            if let Err(e) = outcome {
                error!("Job {} failed in {:?}: {}", job_id, final_state, e);
            }
            error!("Job {}: {}", job_id, cleanup);
            Err(cleanup)
        }
    }
}
