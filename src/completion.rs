//! One-shot completion handles.
//!
//! # Responsibilities
//! - Hold a single-assignment result
//! - Invoke registered continuations exactly once, in registration order
//! - Let async callers await the result
//!
//! # Design Decisions
//! - Continuations run on whichever thread completes the handle, outside
//!   the internal lock, so they may freely register further continuations
//! - A continuation registered while earlier ones are still running is
//!   queued behind them and run by the completing thread
//! - Cloning a handle shares the same cell; `ptr_eq` tells handles apart

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::Outcome;

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct State<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
    /// The completing thread is still running continuations.
    draining: bool,
}

/// A shareable, single-assignment result cell with ordered continuations.
pub struct Completion<T> {
    inner: Arc<Mutex<State<T>>>,
}

/// Completion of a transport write.
pub type WriteFuture = Completion<Outcome>;

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Create a pending handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                value: None,
                listeners: Vec::new(),
                draining: false,
            })),
        }
    }

    /// Create a handle that is already satisfied.
    pub fn completed(value: T) -> Self {
        let handle = Self::new();
        handle.complete(value);
        handle
    }

    /// Satisfy the handle. Returns false if it was already satisfied.
    pub fn complete(&self, value: T) -> bool {
        let mut listeners = {
            let mut state = self.inner.lock().expect("completion mutex poisoned");
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            state.draining = true;
            std::mem::take(&mut state.listeners)
        };
        loop {
            for listener in listeners {
                listener(&value);
            }
            let mut state = self.inner.lock().expect("completion mutex poisoned");
            if state.listeners.is_empty() {
                state.draining = false;
                return true;
            }
            listeners = std::mem::take(&mut state.listeners);
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .lock()
            .expect("completion mutex poisoned")
            .value
            .is_some()
    }

    /// The result, if satisfied.
    pub fn value(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("completion mutex poisoned")
            .value
            .clone()
    }

    /// Register a continuation. It runs immediately if the handle is
    /// satisfied and no earlier continuation is still running.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let ready = {
            let mut state = self.inner.lock().expect("completion mutex poisoned");
            match &state.value {
                Some(value) if !state.draining => value.clone(),
                _ => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&ready);
    }

    /// Forward this handle's result into another handle.
    pub fn chain(&self, target: Completion<T>) {
        self.on_complete(move |value| {
            target.complete(value.clone());
        });
    }

    /// Await the result from async code.
    pub async fn wait(&self) -> T {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |value| {
            let _ = tx.send(value.clone());
        });
        match rx.await {
            Ok(value) => value,
            // The sender is only dropped after sending.
            Err(_) => unreachable!("completion dropped without a value"),
        }
    }

    /// True when both handles share the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self
            .inner
            .lock()
            .map(|state| state.value.is_some())
            .unwrap_or(false);
        f.debug_struct("Completion").field("done", &done).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completes_once() {
        let handle: Completion<u32> = Completion::new();
        assert!(handle.complete(1));
        assert!(!handle.complete(2));
        assert_eq!(handle.value(), Some(1));
    }

    #[test]
    fn listeners_run_in_order() {
        let handle: Completion<()> = Completion::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            handle.on_complete(move |_| seen.lock().unwrap().push(i));
        }
        handle.complete(());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let handle = Completion::completed(7u8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle.on_complete(move |v| {
            assert_eq!(*v, 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_waits_for_running_ones() {
        let handle: Completion<u32> = Completion::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let first = seen.clone();
        handle.on_complete(move |_| {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            first.lock().unwrap().push("first");
        });

        let completer = handle.clone();
        let thread = std::thread::spawn(move || completer.complete(1));
        entered_rx.recv().unwrap();
        assert!(handle.is_done());

        let late = seen.clone();
        handle.on_complete(move |_| late.lock().unwrap().push("late"));
        assert!(seen.lock().unwrap().is_empty());

        release_tx.send(()).unwrap();
        assert!(thread.join().unwrap());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "late"]);
    }

    #[test]
    fn listener_may_register_another() {
        let handle: Completion<()> = Completion::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_handle = handle.clone();
        let h = hits.clone();
        handle.on_complete(move |_| {
            let h = h.clone();
            inner_handle.on_complete(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        });
        handle.complete(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_resolves_from_other_task() {
        let handle: Completion<&'static str> = Completion::new();
        let remote = handle.clone();
        tokio::spawn(async move {
            remote.complete("done");
        });
        assert_eq!(handle.wait().await, "done");
    }
}
