//! Frame-in-flight token.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Binary token bounding the pipeline to one frame in flight.
///
/// Acquiring hands out a [`FrameSlotGuard`]; the slot is free again once the
/// guard is dropped, from whichever thread holds it at that point.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<SlotState>,
}

#[derive(Default)]
struct SlotState {
    busy: Mutex<bool>,
    released: Condvar,
}

impl SlotState {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token, waiting at most `timeout` for the current holder.
    /// A zero timeout never blocks.
    pub fn try_acquire(&self, timeout: Duration) -> Option<FrameSlotGuard> {
        let busy = self.inner.lock();
        let (mut busy, _) = self
            .inner
            .released
            .wait_timeout_while(busy, timeout, |busy| *busy)
            .unwrap_or_else(|e| e.into_inner());
        if *busy {
            return None;
        }
        *busy = true;
        Some(FrameSlotGuard { inner: Arc::clone(&self.inner) })
    }

    pub fn is_busy(&self) -> bool {
        *self.inner.lock()
    }

    /// Wait until nothing is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let busy = self.inner.lock();
        let (busy, _) = self
            .inner
            .released
            .wait_timeout_while(busy, timeout, |busy| *busy)
            .unwrap_or_else(|e| e.into_inner());
        !*busy
    }
}

/// Proof of holding the token. Dropping it releases the slot.
pub struct FrameSlotGuard {
    inner: Arc<SlotState>,
}

impl Drop for FrameSlotGuard {
    fn drop(&mut self) {
        *self.inner.lock() = false;
        self.inner.released.notify_all();
    }
}
