use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::video::{FrameBuffer, FrameShape, MemoryDomain};

struct Slot {
    index: usize,
    refs: AtomicUsize,
    buffer: Mutex<FrameBuffer>,
}

/// Fixed set of reusable frame buffers owned by the stage that produces into them.
///
/// Buffers are handed out as reference-counted [`FrameHandle`]s. A slot becomes free
/// again when its last handle is released.
pub struct FrameBufferPool {
    label: String,
    layout: Option<(FrameShape, MemoryDomain)>,
    slots: Vec<Arc<Slot>>,
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("label", &self.label)
            .field("layout", &self.layout)
            .field("capacity", &self.slots.len())
            .field("available", &self.available())
            .finish()
    }
}

impl FrameBufferPool {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            layout: None,
            slots: Vec::new(),
        }
    }

    pub fn allocate(&mut self, count: usize, shape: FrameShape, domain: MemoryDomain) -> Result<()> {
        if self.layout.is_some() {
            return Err(PipelineError::Allocation(format!(
                "pool '{}' is already sized; reset it before reallocating",
                self.label
            )));
        }
        if count == 0 {
            return Err(PipelineError::Allocation(format!(
                "pool '{}' requested with zero buffers",
                self.label
            )));
        }
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(Arc::new(Slot {
                index,
                refs: AtomicUsize::new(0),
                buffer: Mutex::new(FrameBuffer::allocate(shape, domain)?),
            }));
        }
        debug!(pool = %self.label, count, %shape, %domain, "Frame pool allocated");
        self.slots = slots;
        self.layout = Some((shape, domain));
        Ok(())
    }

    /// Drops all buffers. Fails while any buffer is still checked out.
    pub fn reset(&mut self) -> Result<()> {
        let busy = self.in_use();
        if busy > 0 {
            return Err(PipelineError::Allocation(format!(
                "pool '{}' cannot be reset with {busy} buffer(s) in use",
                self.label
            )));
        }
        self.slots.clear();
        self.layout = None;
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_allocated(&self) -> bool {
        self.layout.is_some()
    }

    pub fn shape(&self) -> Option<FrameShape> {
        self.layout.map(|(shape, _)| shape)
    }

    pub fn domain(&self) -> Option<MemoryDomain> {
        self.layout.map(|(_, domain)| domain)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.refs.load(Ordering::Acquire) == 0)
            .count()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Takes a free buffer, or `None` when every slot is referenced.
    pub fn checkout(&self) -> Option<FrameHandle> {
        self.slots.iter().find_map(|slot| {
            slot.refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| FrameHandle {
                    slot: slot.clone(),
                    held: true,
                })
        })
    }
}

/// Counted reference to one pooled buffer.
pub struct FrameHandle {
    slot: Arc<Slot>,
    held: bool,
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("slot", &self.slot.index)
            .field("refs", &self.ref_count())
            .field("held", &self.held)
            .finish()
    }
}

impl FrameHandle {
    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }

    /// Another reference to the same buffer.
    pub fn share(&self) -> FrameHandle {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        FrameHandle {
            slot: self.slot.clone(),
            held: true,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        self.slot.buffer.lock()
    }

    pub fn shape(&self) -> FrameShape {
        *self.lock().shape()
    }

    /// Gives up this reference. Calling it again, or on a slot already back at zero,
    /// changes nothing.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let _ = self
            .slot
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                refs.checked_sub(1)
            });
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.release();
    }
}
