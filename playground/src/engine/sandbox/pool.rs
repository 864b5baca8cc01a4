//! Sandbox pool
//!
//! A fixed set of isolate box ids. A job leases one box at a time; releasing
//! the lease resets the box before its id goes back on the free list.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, warn};

use super::SandboxBackend;
use crate::error::EngineError;

pub struct SandboxPool {
    backend: Arc<dyn SandboxBackend>,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<u32>>,
    waiting: AtomicUsize,
    capacity: usize,
    max_queue_depth: Option<usize>,
}

/// Exclusive use of one box. Hand it back with [`SandboxPool::release`];
/// a lease that is merely dropped is reset in the background.
pub struct SandboxLease {
    box_id: u32,
    work_dir: PathBuf,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<SandboxPool>,
}

impl SandboxLease {
    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Host path of the box working directory (`/box` inside the sandbox)
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("box_id", &self.box_id)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let box_id = self.box_id;
        warn!("Lease for box {} dropped without release; resetting in background", box_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.backend.cleanup(box_id).await {
                        error!("Background cleanup of box {} failed: {:#}", box_id, e);
                    }
                    pool.return_slot(box_id);
                    drop(permit);
                });
            }
            // No runtime left; the next init cleans the residue
            Err(_) => {
                pool.return_slot(box_id);
                drop(permit);
            }
        }
    }
}

/// Keeps the waiter count honest when an acquire future is dropped
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SandboxPool {
    /// Pool over box ids `box_id_offset .. box_id_offset + capacity`
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        box_id_offset: u32,
        capacity: usize,
        max_queue_depth: Option<usize>,
    ) -> Arc<Self> {
        // Lowest id on top of the stack
        let free = (0..capacity as u32).rev().map(|i| box_id_offset + i).collect();
        Arc::new(Self {
            backend,
            permits: Arc::new(Semaphore::new(capacity)),
            free: Mutex::new(free),
            waiting: AtomicUsize::new(0),
            capacity,
            max_queue_depth,
        })
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Jobs currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for a free box and initialise it
    pub async fn acquire(self: &Arc<Self>) -> Result<SandboxLease, EngineError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(EngineError::Infrastructure(anyhow::anyhow!(
                    "sandbox pool is closed"
                )))
            }
            Err(TryAcquireError::NoPermits) => {
                let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
                let _guard = WaitGuard(&self.waiting);
                if self.max_queue_depth.is_some_and(|max| waiting >= max) {
                    return Err(EngineError::ResourceExhausted { waiting });
                }
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| {
                        EngineError::Infrastructure(anyhow::anyhow!("sandbox pool is closed"))
                    })?
            }
        };

        let box_id = self.take_slot().ok_or_else(|| {
            EngineError::Infrastructure(anyhow::anyhow!("no free box despite a pool permit"))
        })?;

        let mut lease = SandboxLease {
            box_id,
            work_dir: PathBuf::new(),
            permit: Some(permit),
            pool: Arc::clone(self),
        };

        match self.backend.init(box_id).await {
            Ok(work_dir) => {
                debug!("Leased box {}", box_id);
                lease.work_dir = work_dir;
                Ok(lease)
            }
            Err(e) => {
                let permit = lease.permit.take();
                self.return_slot(box_id);
                drop(permit);
                Err(EngineError::Infrastructure(
                    e.context(format!("Failed to initialize box {}", box_id)),
                ))
            }
        }
    }

    /// Reset the box and return it to the pool. The slot is returned even if
    /// the reset fails; the next init cleans again before reuse.
    pub async fn release(&self, mut lease: SandboxLease) -> Result<(), EngineError> {
        let permit = lease.permit.take();
        let box_id = lease.box_id;
        drop(lease);

        let result = self.backend.cleanup(box_id).await;
        self.return_slot(box_id);
        drop(permit);

        debug!("Released box {}", box_id);
        result.map_err(|e| EngineError::Cleanup(e.context(format!("box {}", box_id))))
    }

    fn take_slot(&self) -> Option<u32> {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn return_slot(&self, box_id: u32) {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(box_id);
    }
}
