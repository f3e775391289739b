//! Single-producer / single-consumer result channel
//!
//! A [`Completer`] is handed to the worker thread that produces a result; the
//! matching [`Completion`] stays with the caller, who may block on it. An
//! optional callback runs on the producing thread when the result is set.

use crate::http::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback invoked with the outcome of an asynchronous operation
pub type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Slot<T> {
    result: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Create a connected completer / completion pair
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    completion_with_callback(None)
}

/// Create a pair whose completer also runs `callback` on completion
pub fn completion_with_callback<T>(callback: Option<Callback<T>>) -> (Completer<T>, Completion<T>) {
    let slot = Arc::new(Slot {
        result: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Completer {
            slot: Some(slot.clone()),
            callback,
        },
        Completion { slot },
    )
}

/// Producing half; completes at most once
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
    callback: Option<Callback<T>>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: Result<T>) {
        self.set(result);
    }

    pub fn fail(self, cause: Error) {
        self.complete(Err(cause));
    }

    /// Whether the consuming half has been dropped
    pub fn is_abandoned(&self) -> bool {
        self.slot
            .as_ref()
            .map_or(true, |slot| Arc::strong_count(slot) == 1)
    }

    fn set(&mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
        if let Some(slot) = self.slot.take() {
            *slot.result.lock() = Some(result);
            slot.ready.notify_all();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.set(Err(Error::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.slot.is_none())
            .finish()
    }
}

/// Consuming half
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completion<T> {
    pub fn is_done(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Take the result if it is already available
    pub fn try_take(&self) -> Option<Result<T>> {
        self.slot.result.lock().take()
    }

    /// Block until the result is available
    pub fn get(self) -> Result<T> {
        let mut result = self.slot.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.slot.ready.wait(&mut result);
        }
    }

    /// Block until the result is available or `timeout` elapses
    pub fn wait(self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut result = self.slot.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            if self.slot.ready.wait_until(&mut result, deadline).timed_out() {
                return result.take().unwrap_or(Err(Error::Timeout));
            }
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}
