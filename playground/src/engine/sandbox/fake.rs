//! In-memory backend for tests: boxes are temp directories and stages are
//! answered by a closure.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use super::{CapturedOutput, SandboxBackend, StageRequest, StageResult};
use crate::core::outcome::Outcome;

type Responder = Box<dyn Fn(&StageRequest, &Path) -> Result<StageResult> + Send + Sync>;

pub struct FakeBackend {
    root: TempDir,
    responder: Responder,
    requests: Mutex<Vec<StageRequest>>,
    inits: AtomicUsize,
    cleanups: AtomicUsize,
    fail_init: AtomicBool,
    fail_cleanup: AtomicBool,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(|_, _| Ok(exited(0, "")))
    }
}

impl FakeBackend {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&StageRequest, &Path) -> Result<StageResult> + Send + Sync + 'static,
    {
        Self {
            root: TempDir::new().expect("temp dir"),
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            inits: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            fail_init: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
        }
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn box_dir(&self, box_id: u32) -> PathBuf {
        self.root.path().join(box_id.to_string())
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn init(&self, box_id: u32) -> Result<PathBuf> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            anyhow::bail!("cannot create box {}", box_id);
        }
        let dir = self.box_dir(box_id);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn run(&self, box_id: u32, request: &StageRequest) -> Result<StageResult> {
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request, &self.box_dir(box_id))
    }

    async fn cleanup(&self, box_id: u32) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            anyhow::bail!("box {} is busy", box_id);
        }
        let _ = std::fs::remove_dir_all(self.box_dir(box_id));
        Ok(())
    }
}

/// Stage that exited with `code` after printing `stdout`
pub fn exited(code: i32, stdout: &str) -> StageResult {
    StageResult::new(
        Outcome::Exited(code),
        CapturedOutput {
            stdout: stdout.to_string(),
            output: stdout.to_string(),
            ..CapturedOutput::default()
        },
    )
}
