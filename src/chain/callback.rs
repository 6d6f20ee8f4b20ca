//! Completion callbacks and cancellation handles.
//!
//! Every chain invocation started with [`spawn`] reports through exactly one
//! of `completed`, `failed` or `cancelled`. Cancellation is a terminal state,
//! not an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Body;
use axum::http::{Request, Response};
use tokio::task::AbortHandle;

use crate::chain::ExecChain;
use crate::error::ChainError;
use crate::exchange::{HttpHost, RequestContext};

/// Receiver of a single asynchronous result.
pub trait FutureCallback<T>: Send {
    fn completed(self: Box<Self>, value: T);
    fn failed(self: Box<Self>, error: ChainError);
    fn cancelled(self: Box<Self>);
}

/// Terminal state delivered to a callback.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Failed(ChainError),
    Cancelled,
}

/// Adapts a closure over [`Outcome`] into a [`FutureCallback`].
pub struct FnCallback<F>(F);

/// Build a callback from a closure.
pub fn callback_fn<T, F>(f: F) -> Box<dyn FutureCallback<T>>
where
    T: 'static,
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    Box::new(FnCallback(f))
}

impl<T, F> FutureCallback<T> for FnCallback<F>
where
    F: FnOnce(Outcome<T>) + Send,
{
    fn completed(self: Box<Self>, value: T) {
        (self.0)(Outcome::Completed(value))
    }

    fn failed(self: Box<Self>, error: ChainError) {
        (self.0)(Outcome::Failed(error))
    }

    fn cancelled(self: Box<Self>) {
        (self.0)(Outcome::Cancelled)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    done: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
    hooks: Mutex<Vec<Hook>>,
}

/// Handle to a running operation that can be cancelled.
#[derive(Clone, Default)]
pub struct Cancellable {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation. Returns true only for the call that actually
    /// cancelled it; false if it already finished or was cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.done.load(Ordering::Acquire) {
            return false;
        }
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = self
            .inner
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        let hooks = std::mem::take(
            &mut *self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Mark the operation finished; later `cancel` calls are no-ops.
    pub fn mark_done(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run `hook` on cancellation, or now if already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Abort this task when cancelled.
    pub fn set_abort_handle(&self, handle: AbortHandle) {
        if self.is_cancelled() {
            handle.abort();
            return;
        }
        *self
            .inner
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// A callback that several completion paths race to take.
pub(crate) type SharedCallback<T> = Arc<Mutex<Option<Box<dyn FutureCallback<T>>>>>;

pub(crate) fn take_callback<T>(slot: &SharedCallback<T>) -> Option<Box<dyn FutureCallback<T>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Run `chain` on the runtime and report the result through `callback`.
///
/// Exactly one callback method is invoked. Cancelling the returned handle
/// aborts the task and reports `cancelled` unless a result was already
/// delivered.
pub fn spawn<C>(
    chain: Arc<C>,
    target: HttpHost,
    request: Request<Body>,
    ctx: RequestContext,
    callback: Box<dyn FutureCallback<Response<Body>>>,
) -> Cancellable
where
    C: ExecChain + ?Sized + 'static,
{
    let handle = Cancellable::new();
    let slot: SharedCallback<Response<Body>> = Arc::new(Mutex::new(Some(callback)));

    {
        let slot = slot.clone();
        handle.on_cancel(move || {
            if let Some(callback) = take_callback(&slot) {
                callback.cancelled();
            }
        });
    }

    let task_handle = handle.clone();
    let task = tokio::spawn(async move {
        let mut ctx = ctx;
        let result = chain.execute(&target, request, &mut ctx).await;
        task_handle.mark_done();
        let Some(callback) = take_callback(&slot) else {
            return;
        };
        match result {
            Ok(response) => callback.completed(response),
            Err(ChainError::Cancelled) => callback.cancelled(),
            Err(error) => callback.failed(error),
        }
    });
    handle.set_abort_handle(task.abort_handle());
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_fires_hooks_once() {
        let handle = Cancellable::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        handle.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Registered after cancellation: runs immediately.
        let c = count.clone();
        handle.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_after_done_is_noop() {
        let handle = Cancellable::new();
        handle.mark_done();
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_closure_callback_receives_outcome() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let cb = callback_fn(move |outcome: Outcome<u32>| {
            *sink.lock().unwrap() = Some(matches!(outcome, Outcome::Completed(7)));
        });
        cb.completed(7);
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
