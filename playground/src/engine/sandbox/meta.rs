//! Isolate meta file parser
//!
//! Parses the meta file written by `isolate --meta` and maps it to an [`Outcome`].

use crate::core::outcome::{signal_name, Outcome, TimeLimit};
use crate::core::runtimes::StageLimits;

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded (`TO`)
    TimeOut,
    /// Killed by signal (`SG`)
    Signal,
    /// Non-zero exit (`RE`)
    RuntimeError,
    /// Internal error in isolate (`XX`)
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Peak memory in KB (cg-mem or max-rss, whichever is larger)
    pub memory_kb: u64,
    pub exit_code: i32,
    pub exit_signal: Option<i32>,
    pub status: IsolateStatus,
    /// Set when the cgroup OOM killer fired
    pub oom_killed: bool,
    /// Human-readable status message from isolate
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: 0,
            exit_signal: None,
            status: IsolateStatus::Ok,
            oom_killed: false,
            message: None,
        }
    }
}

impl IsolateMeta {
    /// Classify the run. An isolate internal error is not a program outcome
    /// and is returned as an error.
    pub fn outcome(&self, limits: &StageLimits) -> anyhow::Result<Outcome> {
        let memory_limit_kb = (limits.memory_bytes > 0).then(|| limits.memory_bytes as u64 / 1024);
        let over_memory = memory_limit_kb.is_some_and(|limit| self.memory_kb >= limit);

        let outcome = match self.status {
            IsolateStatus::InternalError => {
                anyhow::bail!(
                    "isolate internal error: {}",
                    self.message.as_deref().unwrap_or("unknown")
                )
            }
            _ if self.oom_killed => Outcome::OutOfMemory,
            IsolateStatus::TimeOut => {
                let wall = self
                    .message
                    .as_deref()
                    .is_some_and(|m| m.contains("wall"));
                if wall {
                    Outcome::TimedOut(TimeLimit::Wall)
                } else {
                    Outcome::TimedOut(TimeLimit::Cpu)
                }
            }
            // cgroup kills sometimes surface as a plain SIGKILL near the ceiling
            IsolateStatus::Signal if over_memory => Outcome::OutOfMemory,
            IsolateStatus::Signal => Outcome::Signaled(signal_name(self.exit_signal.unwrap_or(9))),
            IsolateStatus::RuntimeError | IsolateStatus::Ok => Outcome::Exited(self.exit_code),
        };
        Ok(outcome)
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = (t * 1000.0) as u64;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u64;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "status" => status_str = value.to_string(),
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => meta.exit_signal = value.parse().ok(),
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    meta.status = match status_str.as_str() {
        "TO" => IsolateStatus::TimeOut,
        "SG" => IsolateStatus::Signal,
        "RE" => IsolateStatus::RuntimeError,
        "XX" => IsolateStatus::InternalError,
        _ if meta.exit_signal.is_some() => IsolateStatus::Signal,
        "" if meta.exit_code == 0 => IsolateStatus::Ok,
        _ => IsolateStatus::RuntimeError,
    };

    meta
}
