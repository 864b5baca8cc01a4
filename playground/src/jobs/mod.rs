//! Execution jobs
//!
//! A [`Job`] is a validated request: a resolved runtime, the files to stage,
//! and the effective limits for both stages.

pub mod validator;

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use uuid::Uuid;

use crate::core::runtimes::{Limits, Runtime, Stage};
use crate::engine::sandbox::StageRequest;

/// How a file's `content` is encoded in the request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

impl FileEncoding {
    /// Unrecognised encodings are treated as plain text
    pub fn from_field(raw: Option<&str>) -> Self {
        match raw {
            Some("base64") => FileEncoding::Base64,
            Some("hex") => FileEncoding::Hex,
            _ => FileEncoding::Utf8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobFile {
    /// Path relative to the box working directory
    pub name: String,
    pub content: String,
    pub encoding: FileEncoding,
}

impl JobFile {
    /// Bytes to write into the sandbox
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self.encoding {
            FileEncoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            FileEncoding::Base64 => general_purpose::STANDARD
                .decode(self.content.trim())
                .with_context(|| format!("{} is not valid base64", self.name)),
            FileEncoding::Hex => hex::decode(self.content.trim())
                .with_context(|| format!("{} is not valid hex", self.name)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub runtime: Arc<Runtime>,
    pub files: Vec<JobFile>,
    pub args: Vec<String>,
    pub stdin: String,
    /// Effective limits (client overrides applied)
    pub limits: Limits,
}

impl Job {
    /// Source files handed to the compiler
    pub fn code_files(&self) -> impl Iterator<Item = &JobFile> {
        self.files
            .iter()
            .filter(|f| f.encoding == FileEncoding::Utf8)
    }

    /// Entry point: first code file, or the first file for binary-only jobs
    pub fn main_file(&self) -> Option<&JobFile> {
        self.code_files().next().or_else(|| self.files.first())
    }

    /// Sandbox request for `stage`, or `None` when the runtime has no such stage
    pub fn stage_request(&self, stage: Stage) -> Option<StageRequest> {
        let command = match stage {
            Stage::Compile => {
                let mut command = self.runtime.compile_command.clone()?;
                command.extend(self.code_files().map(|f| f.name.clone()));
                command
            }
            Stage::Run => {
                let mut command = self.runtime.run_command.clone();
                command.extend(self.main_file().map(|f| f.name.clone()));
                command.extend(self.args.iter().cloned());
                command
            }
        };

        Some(StageRequest {
            stage,
            command,
            stdin: match stage {
                Stage::Compile => None,
                Stage::Run => Some(self.stdin.clone()),
            },
            limits: *self.limits.stage(stage),
            caps: self.runtime.caps,
            env: self.runtime.env.clone(),
            mount: self.runtime.mount.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::runtimes::parse_runtimes;

    fn job(runtime_toml: &str, files: Vec<JobFile>) -> Job {
        let config = AppConfig::default();
        let runtime = parse_runtimes(runtime_toml, &config, None, None)
            .unwrap()
            .remove(0);
        Job {
            id: Uuid::new_v4(),
            limits: runtime.limits,
            runtime: Arc::new(runtime),
            files,
            args: vec!["--flag".into()],
            stdin: "input".into(),
        }
    }

    fn file(name: &str, content: &str, encoding: FileEncoding) -> JobFile {
        JobFile {
            name: name.into(),
            content: content.into(),
            encoding,
        }
    }

    #[test]
    fn test_decode() {
        assert_eq!(file("a", "hi", FileEncoding::Utf8).decode().unwrap(), b"hi");
        assert_eq!(file("a", "aGk=", FileEncoding::Base64).decode().unwrap(), b"hi");
        assert_eq!(file("a", "6869", FileEncoding::Hex).decode().unwrap(), b"hi");
        assert!(file("a", "zz", FileEncoding::Hex).decode().is_err());
        assert_eq!(FileEncoding::from_field(Some("latin1")), FileEncoding::Utf8);
    }

    #[test]
    fn test_stage_commands() {
        let c = job(
            r#"
[[runtime]]
language = "c"
version = "10.2.0"
compile_command = "/usr/bin/gcc -o main"
run_command = "./main"
"#,
            vec![
                file("main.c", "int main(){}", FileEncoding::Utf8),
                file("data.bin", "AA==", FileEncoding::Base64),
                file("util.c", "", FileEncoding::Utf8),
            ],
        );

        let compile = c.stage_request(Stage::Compile).unwrap();
        assert_eq!(compile.command, ["/usr/bin/gcc", "-o", "main", "main.c", "util.c"]);
        assert_eq!(compile.stdin, None);

        let run = c.stage_request(Stage::Run).unwrap();
        assert_eq!(run.command, ["./main", "main.c", "--flag"]);
        assert_eq!(run.stdin.as_deref(), Some("input"));
        assert_eq!(run.limits, c.limits.run);
    }

    #[test]
    fn test_interpreted_has_no_compile_stage() {
        let py = job(
            r#"
[[runtime]]
language = "python"
version = "3.10.0"
run_command = "/usr/bin/python3"
"#,
            vec![file("main.py", "print(1)", FileEncoding::Utf8)],
        );
        assert!(py.stage_request(Stage::Compile).is_none());
    }
}
