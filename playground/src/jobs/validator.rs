//! Request validation
//!
//! Turns a raw `/execute` body into a [`Job`]. Checks run in a fixed order and
//! the first failure is reported; nothing here touches the filesystem.

use serde_json::Value;
use uuid::Uuid;

use super::{FileEncoding, Job, JobFile};
use crate::core::runtimes::{RuntimeRegistry, Stage, StageLimits};
use crate::core::utils::is_safe_relative_path;
use crate::error::ValidationError;

/// Runtimes of this language execute a binary file as-is
const FILE_RUNTIME: &str = "file";

/// Client-overridable constraints, in validation order
#[derive(Debug, Clone, Copy)]
enum Constraint {
    MemoryLimit,
    Timeout,
    CpuTime,
}

impl Constraint {
    const ALL: [Constraint; 3] = [Constraint::MemoryLimit, Constraint::Timeout, Constraint::CpuTime];

    fn as_str(&self) -> &'static str {
        match self {
            Constraint::MemoryLimit => "memory_limit",
            Constraint::Timeout => "timeout",
            Constraint::CpuTime => "cpu_time",
        }
    }

    fn get(&self, limits: &StageLimits) -> i64 {
        match self {
            Constraint::MemoryLimit => limits.memory_bytes,
            Constraint::Timeout => limits.timeout_ms,
            Constraint::CpuTime => limits.cpu_time_ms,
        }
    }

    fn set(&self, limits: &mut StageLimits, value: i64) {
        match self {
            Constraint::MemoryLimit => limits.memory_bytes = value,
            Constraint::Timeout => limits.timeout_ms = value,
            Constraint::CpuTime => limits.cpu_time_ms = value,
        }
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ValidationError> {
    Err(ValidationError::new(message))
}

/// Validate `body` and build a job against `registry`
pub fn build_job(body: &Value, registry: &RuntimeRegistry) -> Result<Job, ValidationError> {
    let Some(language) = body.get("language").and_then(Value::as_str) else {
        return invalid("language is required as a string");
    };
    let Some(version) = body.get("version").and_then(Value::as_str) else {
        return invalid("version is required as a string");
    };

    let Some(raw_files) = body.get("files").and_then(Value::as_array) else {
        return invalid("files is required as an array");
    };

    let mut files = Vec::with_capacity(raw_files.len());
    let mut has_utf8 = false;
    for (i, raw) in raw_files.iter().enumerate() {
        let Some(content) = raw.get("content").and_then(Value::as_str) else {
            return invalid(format!("files[{}].content is required as a string", i));
        };

        let name = match raw.get("name") {
            None | Some(Value::Null) => format!("file{}.code", i),
            Some(Value::String(name)) if name.is_empty() => format!("file{}.code", i),
            Some(Value::String(name)) if is_safe_relative_path(name) => name.clone(),
            Some(Value::String(_)) => {
                return invalid(format!(
                    "files[{}].name must be a relative path inside the working directory",
                    i
                ))
            }
            Some(_) => return invalid(format!("files[{}].name must be a string", i)),
        };

        let encoding = match raw.get("encoding") {
            None | Some(Value::Null) => None,
            Some(Value::String(encoding)) => Some(encoding.as_str()),
            Some(_) => return invalid(format!("files[{}].encoding must be a string", i)),
        };
        has_utf8 |= matches!(encoding, None | Some("utf8"));

        files.push(JobFile {
            name,
            content: content.to_string(),
            encoding: FileEncoding::from_field(encoding),
        });
    }

    let Some(runtime) = registry.resolve(language, version) else {
        return invalid(format!("{}-{} runtime is unknown", language, version));
    };

    if runtime.language != FILE_RUNTIME && !has_utf8 {
        return invalid("files must include at least one utf8 encoded file");
    }

    let mut limits = runtime.limits;
    for constraint in Constraint::ALL {
        for stage in Stage::ALL {
            let name = format!("{}_{}", stage.as_str(), constraint.as_str());
            let value = match body.get(&name) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let Some(requested) = value.as_f64() else {
                return invalid(format!("If specified, {} must be a number", name));
            };

            if requested < 0.0 {
                return invalid(format!("{} must be non-negative", name));
            }
            let ceiling = constraint.get(runtime.limits.stage(stage));
            if ceiling > 0 && requested > ceiling as f64 {
                return invalid(format!(
                    "{} cannot exceed the configured limit of {}",
                    name, ceiling
                ));
            }

            // A zero here would read as "unbounded" downstream; a configured
            // ceiling always stays in force
            let requested = requested.ceil() as i64;
            let effective = if ceiling > 0 && requested == 0 {
                ceiling
            } else {
                requested
            };
            constraint.set(limits.stage_mut(stage), effective);
        }
    }

    let args = match body.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|a| a.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ValidationError::new("args must be an array of strings"))?,
        Some(_) => return invalid("args must be an array of strings"),
    };

    let stdin = match body.get("stdin") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(stdin)) => stdin.clone(),
        Some(_) => return invalid("stdin must be a string"),
    };

    Ok(Job {
        id: Uuid::new_v4(),
        runtime,
        files,
        args,
        stdin,
        limits,
    })
}
