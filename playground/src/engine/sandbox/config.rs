//! Sandbox configuration
//!
//! Isolate settings derived from [`AppConfig`]. Owned by the backend; there is
//! no global copy.

use std::time::Duration;

use crate::config::AppConfig;
use crate::core::runtimes::StageLimits;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Path to the isolate binary
    pub isolate_bin: String,
    /// Host directories exposed inside every box (isolate `--dir` rules)
    pub dirs: Vec<String>,
    /// Environment passed to every stage before runtime-specific variables
    pub env: Vec<(String, String)>,
    /// Allow network access from inside the box
    pub share_net: bool,
    /// Wall limit for stages whose own timeout is unbounded
    pub hard_stage_timeout: Duration,
    /// Time allowed past the wall limit before the keeper is killed
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolate_bin: "isolate".to_string(),
            dirs: vec![
                "/usr".to_string(),
                "/lib".to_string(),
                "/lib64:maybe".to_string(),
                "/etc:noexec".to_string(),
                "/tmp:tmp".to_string(),
            ],
            env: vec![
                ("PATH".to_string(), "/runtime/bin:/usr/local/bin:/usr/bin:/bin".to_string()),
                ("HOME".to_string(), "/tmp".to_string()),
            ],
            share_net: false,
            hard_stage_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(1),
        }
    }
}

impl SandboxConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            isolate_bin: config.isolate_bin.clone(),
            share_net: !config.disable_networking,
            hard_stage_timeout: Duration::from_millis(config.hard_stage_timeout_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            ..Self::default()
        }
    }

    /// Wall-clock limit handed to isolate for a stage
    pub fn wall_limit(&self, limits: &StageLimits) -> Duration {
        if limits.timeout_ms > 0 {
            Duration::from_millis(limits.timeout_ms as u64)
        } else {
            self.hard_stage_timeout
        }
    }

    /// Longest the engine waits on isolate before killing it
    pub fn wait_bound(&self, limits: &StageLimits) -> Duration {
        self.wall_limit(limits) + self.kill_grace
    }
}
