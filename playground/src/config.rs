//! Engine configuration
//!
//! Loaded once from `PLAYGROUND_*` environment variables (optionally via `.env`)
//! and handed to every component by reference.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::core::runtimes::{Limits, ResourceCaps, StageLimits};

/// Process-wide configuration snapshot
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Root for installed packages (`<data_directory>/packages/...`)
    pub data_directory: PathBuf,
    /// Runtime definitions file
    pub runtimes_config: PathBuf,
    /// Package index URL
    pub repo_url: String,
    /// Number of sandbox slots
    pub max_concurrent_jobs: usize,
    /// Jobs allowed to wait for a slot before new ones are rejected (None = unbounded)
    pub max_queue_depth: Option<usize>,
    /// First isolate box id owned by this process
    pub box_id_offset: u32,
    /// Path to the isolate binary
    pub isolate_bin: String,
    pub disable_networking: bool,
    /// Upper bound for a stage whose own timeout is unbounded (ms)
    pub hard_stage_timeout_ms: u64,
    /// Extra time past the wall limit before the keeper is killed (ms)
    pub kill_grace_ms: u64,
    /// Default ceilings applied to every runtime unless overridden
    pub limits: Limits,
    pub caps: ResourceCaps,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2000)),
            data_directory: PathBuf::from("/playground"),
            runtimes_config: PathBuf::from("./files/runtimes.toml"),
            repo_url: "https://github.com/engineer-man/piston/releases/download/pkgs/index"
                .to_string(),
            max_concurrent_jobs: 64,
            max_queue_depth: None,
            box_id_offset: 0,
            isolate_bin: "isolate".to_string(),
            disable_networking: true,
            hard_stage_timeout_ms: 60_000,
            kill_grace_ms: 1_000,
            limits: Limits {
                compile: StageLimits {
                    timeout_ms: 10_000,
                    cpu_time_ms: 10_000,
                    memory_bytes: -1,
                },
                run: StageLimits {
                    timeout_ms: 3_000,
                    cpu_time_ms: 3_000,
                    memory_bytes: -1,
                },
            },
            caps: ResourceCaps {
                output_max_size: 1024,
                max_process_count: 64,
                max_open_files: 2048,
                max_file_size: 10_000_000,
            },
        }
    }
}

impl AppConfig {
    /// Build configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let max_queue_depth = match std::env::var("PLAYGROUND_MAX_QUEUE_DEPTH") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid PLAYGROUND_MAX_QUEUE_DEPTH: {}", raw))?,
            ),
            _ => None,
        };

        let config = Self {
            bind_addr: env_or("PLAYGROUND_BIND_ADDR", d.bind_addr)?,
            data_directory: env_or("PLAYGROUND_DATA_DIRECTORY", d.data_directory)?,
            runtimes_config: env_or("PLAYGROUND_RUNTIMES_CONFIG", d.runtimes_config)?,
            repo_url: std::env::var("PLAYGROUND_REPO_URL").unwrap_or(d.repo_url),
            max_concurrent_jobs: env_or("PLAYGROUND_MAX_CONCURRENT_JOBS", d.max_concurrent_jobs)?,
            max_queue_depth,
            box_id_offset: env_or("PLAYGROUND_BOX_ID_OFFSET", d.box_id_offset)?,
            isolate_bin: std::env::var("PLAYGROUND_ISOLATE_BIN").unwrap_or(d.isolate_bin),
            disable_networking: env_or("PLAYGROUND_DISABLE_NETWORKING", d.disable_networking)?,
            hard_stage_timeout_ms: env_or(
                "PLAYGROUND_HARD_STAGE_TIMEOUT",
                d.hard_stage_timeout_ms,
            )?,
            kill_grace_ms: env_or("PLAYGROUND_KILL_GRACE", d.kill_grace_ms)?,
            limits: Limits {
                compile: StageLimits {
                    timeout_ms: env_or("PLAYGROUND_COMPILE_TIMEOUT", d.limits.compile.timeout_ms)?,
                    cpu_time_ms: env_or(
                        "PLAYGROUND_COMPILE_CPU_TIME",
                        d.limits.compile.cpu_time_ms,
                    )?,
                    memory_bytes: env_or(
                        "PLAYGROUND_COMPILE_MEMORY_LIMIT",
                        d.limits.compile.memory_bytes,
                    )?,
                },
                run: StageLimits {
                    timeout_ms: env_or("PLAYGROUND_RUN_TIMEOUT", d.limits.run.timeout_ms)?,
                    cpu_time_ms: env_or("PLAYGROUND_RUN_CPU_TIME", d.limits.run.cpu_time_ms)?,
                    memory_bytes: env_or(
                        "PLAYGROUND_RUN_MEMORY_LIMIT",
                        d.limits.run.memory_bytes,
                    )?,
                },
            },
            caps: ResourceCaps {
                output_max_size: env_or("PLAYGROUND_OUTPUT_MAX_SIZE", d.caps.output_max_size)?,
                max_process_count: env_or(
                    "PLAYGROUND_MAX_PROCESS_COUNT",
                    d.caps.max_process_count,
                )?,
                max_open_files: env_or("PLAYGROUND_MAX_OPEN_FILES", d.caps.max_open_files)?,
                max_file_size: env_or("PLAYGROUND_MAX_FILE_SIZE", d.caps.max_file_size)?,
            },
        };

        if config.max_concurrent_jobs == 0 {
            anyhow::bail!("PLAYGROUND_MAX_CONCURRENT_JOBS must be at least 1");
        }

        Ok(config)
    }

    /// Directory holding installed packages
    pub fn packages_dir(&self) -> PathBuf {
        self.data_directory.join("packages")
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.limits.run.timeout_ms, 3_000);
        assert_eq!(config.limits.compile.memory_bytes, -1);
        assert_eq!(config.caps.output_max_size, 1024);
        assert_eq!(config.packages_dir(), PathBuf::from("/playground/packages"));
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        std::env::set_var("PLAYGROUND_TEST_ENV_OR_OK", " 42 ");
        std::env::set_var("PLAYGROUND_TEST_ENV_OR_BAD", "forty-two");

        assert_eq!(env_or("PLAYGROUND_TEST_ENV_OR_OK", 7u32).unwrap(), 42);
        assert_eq!(env_or("PLAYGROUND_TEST_ENV_OR_UNSET", 7u32).unwrap(), 7);
        assert!(env_or("PLAYGROUND_TEST_ENV_OR_BAD", 7u32).is_err());
    }
}
