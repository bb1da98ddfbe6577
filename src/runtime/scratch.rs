use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;

use crate::backend::CommBackend;
use crate::config::LowerConfig;
use crate::error::{LowerError, Result};

/// The device scratch ("CCL") buffer of one communication group: an input
/// region and an output region of `bytes` each.
#[derive(Debug)]
pub struct CclBuffer {
    input: u64,
    output: u64,
    bytes: usize,
}

impl CclBuffer {
    pub fn input(&self) -> u64 {
        self.input
    }

    pub fn output(&self) -> u64 {
        self.output
    }

    /// Capacity of each region in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Lazily allocated scratch buffers, one per group.
///
/// A group's buffer is allocated on first checkout and reused for the life
/// of the pool. Only one call may hold it at a time; a second checkout
/// fails with `ScratchBusy` instead of sharing.
pub struct ScratchPool {
    backend: Arc<dyn CommBackend>,
    config: LowerConfig,
    groups: Mutex<HashMap<String, Arc<ArrayQueue<CclBuffer>>>>,
}

impl ScratchPool {
    pub fn new(backend: Arc<dyn CommBackend>, config: LowerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LowerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CommBackend> {
        &self.backend
    }

    /// Take exclusive use of `group`'s buffer until the guard drops.
    pub fn checkout(&self, group: &str) -> Result<ScratchGuard<'_>> {
        let slot = {
            let mut groups = self
                .groups
                .lock()
                .map_err(|_| LowerError::LockPoisoned("scratch pool"))?;
            match groups.get(group) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(ArrayQueue::new(1));
                    let _ = slot.push(self.allocate(group)?);
                    groups.insert(group.to_string(), Arc::clone(&slot));
                    slot
                }
            }
        };

        match slot.pop() {
            Some(buf) => Ok(ScratchGuard {
                buf: Some(buf),
                slot,
                _pool: self,
            }),
            None => {
                tracing::warn!(group, "scratch buffer already checked out");
                Err(LowerError::ScratchBusy {
                    group: group.to_string(),
                })
            }
        }
    }

    fn allocate(&self, group: &str) -> Result<CclBuffer> {
        let bytes = self.config.scratch_bytes;
        let input = self.backend.alloc(bytes)?;
        let output = match self.backend.alloc(bytes) {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe {
                    let _ = self.backend.free(input);
                }
                return Err(e);
            }
        };
        tracing::debug!(group, bytes, "allocated scratch buffer");
        Ok(CclBuffer {
            input,
            output,
            bytes,
        })
    }
}

impl Drop for ScratchPool {
    fn drop(&mut self) {
        let Ok(groups) = self.groups.get_mut() else {
            return;
        };
        for (group, slot) in groups.drain() {
            while let Some(buf) = slot.pop() {
                // SAFETY: both regions came from `alloc` and no guard outlives the pool.
                unsafe {
                    if let Err(e) = self.backend.free(buf.input) {
                        tracing::warn!(%group, "failed to free scratch input: {e}");
                    }
                    if let Err(e) = self.backend.free(buf.output) {
                        tracing::warn!(%group, "failed to free scratch output: {e}");
                    }
                }
            }
        }
    }
}

/// Exclusive handle on a group's scratch buffer. Returns it on drop.
pub struct ScratchGuard<'p> {
    buf: Option<CclBuffer>,
    slot: Arc<ArrayQueue<CclBuffer>>,
    _pool: &'p ScratchPool,
}

impl std::ops::Deref for ScratchGuard<'_> {
    type Target = CclBuffer;

    fn deref(&self) -> &CclBuffer {
        // `buf` is `Some` from construction until `Drop`.
        self.buf.as_ref().expect("ScratchGuard used after drop")
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let _ = self.slot.push(buf);
        }
    }
}
