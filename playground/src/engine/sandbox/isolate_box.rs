//! Isolate backend
//!
//! Drives the `isolate` binary: one box per pool slot, cgroups always on so
//! CPU time and memory cover every descendant process. Stage output is piped
//! through the engine so it can be bounded and interleaved.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::capture::{CapturedOutput, OutputCapture, Stream};
use super::config::SandboxConfig;
use super::meta::parse_meta;
use super::{SandboxBackend, StageRequest, StageResult};
use crate::core::outcome::{Outcome, TimeLimit, KILL_SIGNAL};
use crate::core::runtimes::StageLimits;

const READ_CHUNK: usize = 8192;

pub struct IsolateBackend {
    config: SandboxConfig,
}

impl IsolateBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        Command::new(&self.config.isolate_bin)
    }

    /// Fail unless isolate can create a cgroup-backed box
    pub async fn ensure_cgroups_available(&self, probe_box_id: u32) -> Result<()> {
        let id = probe_box_id.to_string();
        let probe = self
            .command()
            .args(["--box-id", &id, "--cg", "--init"])
            .output()
            .await;
        let _ = self
            .command()
            .args(["--box-id", &id, "--cg", "--cleanup"])
            .output()
            .await;

        match probe {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => anyhow::bail!(
                "Isolate cgroup support is required but not available: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to execute {}", self.config.isolate_bin)
            }),
        }
    }

    /// Arguments for `isolate --run`
    fn run_args(&self, box_id: u32, request: &StageRequest, meta_path: &Path) -> Vec<String> {
        let limits = &request.limits;
        let caps = &request.caps;
        let wall_secs = self.config.wall_limit(limits).as_secs_f64();

        let mut args = vec![
            format!("--box-id={}", box_id),
            "--cg".to_string(),
            "--silent".to_string(),
            format!("--meta={}", meta_path.display()),
            format!("--wall-time={}", wall_secs),
            "--extra-time=0".to_string(),
            format!("--processes={}", caps.max_process_count),
            format!("--open-files={}", caps.max_open_files),
            format!("--fsize={}", (caps.max_file_size / 1024).max(1)),
        ];

        if limits.cpu_time_ms > 0 {
            args.push(format!("--time={}", limits.cpu_time_ms as f64 / 1000.0));
        }
        if limits.memory_bytes > 0 {
            args.push(format!("--cg-mem={}", (limits.memory_bytes / 1024).max(1)));
        }
        if self.config.share_net {
            args.push("--share-net".to_string());
        }

        args.extend(self.config.dirs.iter().map(|d| format!("--dir={}", d)));
        if let Some(mount) = &request.mount {
            args.push(format!("--dir=/runtime={}", mount.display()));
        }

        args.extend(
            self.config
                .env
                .iter()
                .chain(request.env.iter())
                .map(|(k, v)| format!("--env={}={}", k, v)),
        );

        args.push("--run".to_string());
        args.push("--".to_string());

        // isolate execs without a PATH search
        let mut command = request.command.iter();
        if let Some(program) = command.next() {
            if program.starts_with('/') || program.starts_with("./") {
                args.push(program.clone());
            } else {
                args.push(format!("/usr/bin/{}", program));
            }
            args.extend(command.cloned());
        }

        args
    }

    /// Ask the isolate keeper to stop, then kill it if it ignores us
    async fn terminate(&self, child: &mut Child) -> Result<()> {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match timeout(self.config.kill_grace, child.wait()).await {
            Ok(status) => {
                status.context("Failed to wait for isolate")?;
            }
            Err(_) => {
                warn!("isolate did not exit after SIGTERM; killing");
                child.kill().await.context("Failed to kill isolate")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    async fn init(&self, box_id: u32) -> Result<PathBuf> {
        let id = box_id.to_string();

        // Clean up any residue from a previous owner
        let _ = self
            .command()
            .args(["--box-id", &id, "--cg", "--cleanup"])
            .output()
            .await;

        let output = self
            .command()
            .args(["--box-id", &id, "--cg", "--init"])
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", box_id, stderr.trim());
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Initialized isolate box {} at {}", box_id, box_path);

        Ok(PathBuf::from(box_path).join("box"))
    }

    async fn run(&self, box_id: u32, request: &StageRequest) -> Result<StageResult> {
        if request.command.is_empty() {
            anyhow::bail!("No command specified for {} stage", request.stage.as_str());
        }

        let meta_file = tempfile::Builder::new()
            .prefix("isolate-meta-")
            .suffix(".txt")
            .tempfile()
            .context("Failed to create meta file")?;
        let args = self.run_args(box_id, request, meta_file.path());
        debug!("Running isolate with args: {:?}", args);

        let deadline = Instant::now() + self.config.wait_bound(&request.limits);
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn isolate")?;

        // Feed stdin concurrently so a program that never reads it cannot stall us
        let stdin_task = child.stdin.take().map(|mut pipe| {
            let input = request.stdin.clone().unwrap_or_default();
            tokio::spawn(async move {
                let _ = pipe.write_all(input.as_bytes()).await;
            })
        });

        let stdout = child.stdout.take().context("isolate stdout not piped")?;
        let stderr = child.stderr.take().context("isolate stderr not piped")?;
        let mut capture = OutputCapture::new(request.caps.output_max_size);
        let mut deadline_hit = pump_output(stdout, stderr, &mut capture, deadline).await;

        if deadline_hit || capture.is_truncated() {
            self.terminate(&mut child).await?;
        } else {
            match timeout_at(deadline, child.wait()).await {
                Ok(status) => {
                    status.context("Failed to wait for isolate")?;
                }
                Err(_) => {
                    deadline_hit = true;
                    self.terminate(&mut child).await?;
                }
            }
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        let meta_content = fs::read_to_string(meta_file.path())
            .await
            .unwrap_or_default();
        let meta = parse_meta(&meta_content);
        let truncated = capture.is_truncated();
        let mut captured = capture.finish();

        if deadline_hit {
            warn!(
                "isolate box {} exceeded the engine wait bound; stage killed",
                box_id
            );
        }
        let outcome = stage_outcome(
            deadline_hit,
            truncated,
            &meta_content,
            &request.limits,
            &mut captured,
        )
        .with_context(|| format!("isolate box {}", box_id))?;

        if captured.message.is_none() && !outcome.is_success() {
            captured.message = meta.message.clone();
        }

        let mut result = StageResult::new(outcome, captured);
        if !meta_content.trim().is_empty() {
            result.memory = Some(meta.memory_kb * 1024);
            result.cpu_time = Some(meta.time_ms);
            result.wall_time = Some(meta.wall_time_ms);
        }

        info!(
            "Box {} {} stage finished: {} (cpu {}ms, wall {}ms)",
            box_id,
            request.stage.as_str(),
            result.outcome,
            meta.time_ms,
            meta.wall_time_ms
        );

        Ok(result)
    }

    async fn cleanup(&self, box_id: u32) -> Result<()> {
        let output = self
            .command()
            .args(["--box-id", &box_id.to_string(), "--cg", "--cleanup"])
            .output()
            .await
            .context("Failed to run isolate --cleanup")?;

        if !output.status.success() {
            anyhow::bail!(
                "isolate --cleanup failed for box {}: {}",
                box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!("Cleaned up isolate box {}", box_id);
        Ok(())
    }
}

/// Drain both streams into `capture` until they close, one of them overflows
/// or `deadline` passes. Returns `true` when the deadline fired.
async fn pump_output<O, E>(
    mut stdout: O,
    mut stderr: E,
    capture: &mut OutputCapture,
    deadline: Instant,
) -> bool
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let (mut out_open, mut err_open) = (true, true);

    while (out_open || err_open) && !capture.is_truncated() {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    capture.push(Stream::Stdout, &out_buf[..n]);
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    capture.push(Stream::Stderr, &err_buf[..n]);
                }
            },
            _ = sleep_until(deadline) => return true,
        }
    }
    false
}

/// Classify a finished stage. The keeper writes no meta file when the engine
/// had to kill it, so those cases are decided here.
fn stage_outcome(
    deadline_hit: bool,
    truncated: bool,
    meta_content: &str,
    limits: &StageLimits,
    captured: &mut CapturedOutput,
) -> Result<Outcome> {
    if deadline_hit {
        captured
            .message
            .get_or_insert_with(|| "Wall time limit exceeded".to_string());
        return Ok(Outcome::TimedOut(TimeLimit::Wall));
    }
    if meta_content.trim().is_empty() {
        if truncated {
            return Ok(Outcome::Signaled(KILL_SIGNAL.to_string()));
        }
        anyhow::bail!("isolate produced no meta file: {}", captured.stderr.trim());
    }
    parse_meta(meta_content).outcome(limits)
}
