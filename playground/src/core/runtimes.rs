//! Runtime registry
//!
//! Runtimes are read once at startup from the runtimes TOML file plus the
//! `runtime.toml` of every fully installed package, then shared read-only.
//!
//! ```toml
//! [[runtime]]
//! language = "python"
//! version = "3.10.0"
//! aliases = ["py", "python3"]
//! run_command = "/usr/bin/python3"
//!
//! [runtime.limits]
//! run_timeout = 10000
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::version::{pick_latest, VersionRange};
use crate::packages::INSTALLED_SENTINEL;

/// File a package ships to describe the runtimes it provides
pub const PACKAGE_RUNTIME_FILE: &str = "runtime.toml";

/// Execution stage of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compile,
    Run,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Compile, Stage::Run];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Run => "run",
        }
    }
}

/// Ceilings for one stage. Values <= 0 mean unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    /// Wall-clock timeout in milliseconds
    pub timeout_ms: i64,
    /// CPU time in milliseconds, summed over every process of the stage
    pub cpu_time_ms: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub compile: StageLimits,
    pub run: StageLimits,
}

impl Limits {
    pub fn stage(&self, stage: Stage) -> &StageLimits {
        match stage {
            Stage::Compile => &self.compile,
            Stage::Run => &self.run,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageLimits {
        match stage {
            Stage::Compile => &mut self.compile,
            Stage::Run => &mut self.run,
        }
    }
}

/// Sandbox resources that do not vary per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCaps {
    /// Bytes kept per output stream before the stage is stopped
    pub output_max_size: usize,
    pub max_process_count: u32,
    pub max_open_files: u32,
    /// Largest file a stage may write, in bytes
    pub max_file_size: u64,
}

/// A concrete, executable language version
#[derive(Debug, Clone)]
pub struct Runtime {
    pub language: String,
    pub version: Version,
    pub aliases: Vec<String>,
    /// Name of the underlying runtime (e.g. `node` for typescript)
    pub runtime: Option<String>,
    /// Compile command; code file names are appended
    pub compile_command: Option<Vec<String>>,
    /// Run command; the main file and job args are appended
    pub run_command: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Host directory mounted read-only at `/runtime`
    pub mount: Option<PathBuf>,
    pub limits: Limits,
    pub caps: ResourceCaps,
}

impl Runtime {
    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Exact, case-sensitive match against the language or any alias
    pub fn answers_to(&self, name: &str) -> bool {
        self.language == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Raw TOML file
#[derive(Debug, Deserialize)]
struct RawRuntimeFile {
    #[serde(default)]
    runtime: Vec<RawRuntime>,
}

#[derive(Debug, Deserialize)]
struct RawRuntime {
    language: String,
    version: String,
    #[serde(default)]
    aliases: Vec<String>,
    runtime: Option<String>,
    compile_command: Option<String>,
    run_command: String,
    mount: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    limits: RawLimitOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimitOverrides {
    compile_timeout: Option<i64>,
    run_timeout: Option<i64>,
    compile_cpu_time: Option<i64>,
    run_cpu_time: Option<i64>,
    compile_memory_limit: Option<i64>,
    run_memory_limit: Option<i64>,
    output_max_size: Option<usize>,
    max_process_count: Option<u32>,
    max_open_files: Option<u32>,
    max_file_size: Option<u64>,
}

/// Parse runtime definitions, filling unset limits from the global defaults.
/// A relative `mount` is resolved against `base_dir`; when a definition has no
/// mount at all, `default_mount` is used.
pub fn parse_runtimes(
    content: &str,
    config: &AppConfig,
    base_dir: Option<&Path>,
    default_mount: Option<&Path>,
) -> Result<Vec<Runtime>> {
    let raw: RawRuntimeFile = toml::from_str(content).context("Invalid runtime definitions")?;

    raw.runtime
        .into_iter()
        .map(|raw| {
            let version = Version::parse(&raw.version).with_context(|| {
                format!("Invalid version {:?} for {}", raw.version, raw.language)
            })?;

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}-{}", raw.language, version);
            }

            let o = raw.limits;
            let d = &config.limits;
            let limits = Limits {
                compile: StageLimits {
                    timeout_ms: o.compile_timeout.unwrap_or(d.compile.timeout_ms),
                    cpu_time_ms: o.compile_cpu_time.unwrap_or(d.compile.cpu_time_ms),
                    memory_bytes: o.compile_memory_limit.unwrap_or(d.compile.memory_bytes),
                },
                run: StageLimits {
                    timeout_ms: o.run_timeout.unwrap_or(d.run.timeout_ms),
                    cpu_time_ms: o.run_cpu_time.unwrap_or(d.run.cpu_time_ms),
                    memory_bytes: o.run_memory_limit.unwrap_or(d.run.memory_bytes),
                },
            };
            let caps = ResourceCaps {
                output_max_size: o.output_max_size.unwrap_or(config.caps.output_max_size),
                max_process_count: o.max_process_count.unwrap_or(config.caps.max_process_count),
                max_open_files: o.max_open_files.unwrap_or(config.caps.max_open_files),
                max_file_size: o.max_file_size.unwrap_or(config.caps.max_file_size),
            };

            let mount = match (raw.mount, base_dir) {
                (Some(m), Some(base)) if m.is_relative() => Some(base.join(m)),
                (Some(m), _) => Some(m),
                (None, _) => default_mount.map(Path::to_path_buf),
            };

            Ok(Runtime {
                language: raw.language,
                version,
                aliases: raw.aliases,
                runtime: raw.runtime,
                compile_command: raw
                    .compile_command
                    .map(|c| into_command(&c))
                    .filter(|c| !c.is_empty()),
                run_command,
                env: raw.env.into_iter().collect(),
                mount,
                limits,
                caps,
            })
        })
        .collect()
}

/// Immutable table of every runtime this process can execute
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    runtimes: Vec<Arc<Runtime>>,
}

impl RuntimeRegistry {
    pub fn new(runtimes: Vec<Runtime>) -> Self {
        let mut kept: Vec<Arc<Runtime>> = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            if kept
                .iter()
                .any(|r| r.language == runtime.language && r.version == runtime.version)
            {
                warn!(
                    "Duplicate runtime {}-{} ignored (first definition wins)",
                    runtime.language, runtime.version
                );
                continue;
            }
            kept.push(Arc::new(runtime));
        }
        Self { runtimes: kept }
    }

    /// Load the runtimes file, then every installed package that ships a
    /// `runtime.toml`. Packages without the install sentinel are skipped.
    pub fn load(config: &AppConfig) -> Result<Self> {
        let mut runtimes = Vec::new();

        if config.runtimes_config.exists() {
            let content = fs::read_to_string(&config.runtimes_config).with_context(|| {
                format!("Failed to read {}", config.runtimes_config.display())
            })?;
            let base_dir = config.runtimes_config.parent();
            runtimes.extend(parse_runtimes(&content, config, base_dir, None)?);
        } else {
            warn!(
                "Runtime config {} not found; relying on installed packages",
                config.runtimes_config.display()
            );
        }

        for package_dir in installed_package_dirs(&config.packages_dir())? {
            let path = package_dir.join(PACKAGE_RUNTIME_FILE);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            match parse_runtimes(&content, config, Some(&package_dir), Some(&package_dir)) {
                Ok(found) => runtimes.extend(found),
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }

        let registry = Self::new(runtimes);
        info!("Loaded {} runtimes", registry.runtimes.len());
        Ok(registry)
    }

    /// Highest-version runtime whose language or alias equals `language` and
    /// whose version satisfies `range`
    pub fn resolve(&self, language: &str, range: &str) -> Option<Arc<Runtime>> {
        let range = VersionRange::parse(range)?;
        pick_latest(
            self.runtimes.iter().filter(|r| r.answers_to(language)),
            &range,
            |r| &r.version,
        )
        .cloned()
    }

    pub fn list(&self) -> &[Arc<Runtime>] {
        &self.runtimes
    }
}

/// `<packages>/<language>/<version>` directories carrying the install sentinel
fn installed_package_dirs(packages_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let languages = match fs::read_dir(packages_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(dirs),
    };

    for language in languages {
        let language = language?;
        if !language.file_type()?.is_dir() {
            continue;
        }
        for version in fs::read_dir(language.path())? {
            let version = version?;
            let path = version.path();
            if path.is_dir() && path.join(INSTALLED_SENTINEL).exists() {
                dirs.push(path);
            }
        }
    }

    dirs.sort();
    Ok(dirs)
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
