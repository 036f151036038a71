//! The request seam between the connection core and command serialization.

use crate::headers::ResponseHeader;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A request as the connection core sees it: an opaque wire encoding plus a
/// response-handling capability. Command semantics (set/get/delete payloads)
/// live with the caller.
///
/// A request is attempted on at most one transport at a time; replica
/// fan-out wires an independent request object per candidate node. Whatever
/// completion mechanism an implementation carries must fire exactly once
/// across the request's lifetime; [`CompletionSlot`] enforces that shape.
pub trait CacheRequest: Send + Sync {
    /// Full wire frame for this request, header included.
    fn wire_bytes(&self) -> Vec<u8>;

    /// Called by the receive loop with the correlated response. Zero-length
    /// extra and message segments arrive as empty slices.
    fn handle_response(&self, header: &ResponseHeader, extra: &[u8], message: &[u8]);

    /// Called when the transport carrying this request dies before a
    /// response arrives, so the caller is never left waiting.
    fn handle_failure(&self);
}

/// One-shot completion cell: the first `set` wins, later setters are told so.
pub struct CompletionSlot<T> {
    inner: Arc<SlotInner<T>>,
}

struct SlotInner<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Clone for CompletionSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for CompletionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                value: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Stores the value unless one is already present. Returns false when
    /// the slot has fired before.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.inner.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.inner.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<T: Clone> CompletionSlot<T> {
    /// Blocks until the slot fires. The caller must be on a different thread
    /// than whoever resolves the slot.
    pub fn wait(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.cond.wait(&mut slot);
        }
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.as_ref().cloned();
            }
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().as_ref().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_set_wins() {
        let slot = CompletionSlot::new();
        assert!(slot.set(1));
        assert!(!slot.set(2));
        assert_eq!(slot.wait(), 1);
    }

    #[test]
    fn wait_for_times_out_on_empty_slot() {
        let slot: CompletionSlot<u8> = CompletionSlot::new();
        assert_eq!(slot.wait_for(Duration::from_millis(20)), None);
        assert!(!slot.is_set());
    }

    #[test]
    fn wakes_blocked_waiter() {
        let slot = CompletionSlot::new();
        let waiter = slot.clone();
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        assert!(slot.set(7u32));
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn racing_setters_fire_exactly_once() {
        let slot = CompletionSlot::new();
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let setter = slot.clone();
            handles.push(thread::spawn(move || setter.set(i)));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert!(slot.try_get().is_some());
    }
}
