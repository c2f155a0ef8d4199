//! Cancelable, listenable completion handle.

use crate::{error::ExecutionError, job::Cancelable};
use core::time::Duration;
use derive_more::Debug;
use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Instant};

type Listener<T> = Box<dyn FnOnce(&Result<T, ExecutionError>) + Send>;
/// Stops the underlying work. Returns `false` if the work had already
/// finished on its own, in which case cancellation is refused.
type CancelHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Completion handle of a graph execution.
///
/// Completes exactly once, either with a value, an error, or by
/// cancellation. Clones share the same completion.
#[must_use]
#[derive(Debug)]
pub struct ExecutionFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ExecutionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

#[derive(Debug)]
struct State<T> {
    outcome: Option<Result<T, ExecutionError>>,
    #[debug(skip)]
    listener: Option<Listener<T>>,
    #[debug(skip)]
    on_cancel: Option<CancelHook>,
}

impl<T: Clone + Send + 'static> ExecutionFuture<T> {
    pub(crate) fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    listener: None,
                    on_cancel: None,
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// A handle that is already complete.
    pub fn ready(outcome: Result<T, ExecutionError>) -> Self {
        let future = Self::pending();
        future.complete(outcome);
        future
    }

    /// Installs what `cancel` does to the underlying work. Runs outside the
    /// handle's lock and decides whether the cancellation takes effect.
    pub(crate) fn on_cancel(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        self.shared.state.lock().on_cancel = Some(Arc::new(hook));
    }

    /// First completion wins; later ones are ignored and return `false`.
    pub(crate) fn complete(&self, outcome: Result<T, ExecutionError>) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        state.on_cancel = None;
        let listener = state.listener.take();
        let outcome = listener.as_ref().and(state.outcome.clone());
        drop(state);
        self.shared.completed.notify_all();
        if let (Some(listener), Some(outcome)) = (listener, outcome) {
            listener(&outcome);
        }
        true
    }

    /// Cancels the execution. Returns `false` if it had already completed,
    /// or is completing, on its own.
    pub fn cancel(&self) -> bool {
        let state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        let hook = state.on_cancel.clone();
        drop(state);
        if hook.is_some_and(|hook| !hook()) {
            return false;
        }
        self.complete(Err(ExecutionError::Cancelled))
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().outcome,
            Some(Err(ExecutionError::Cancelled))
        )
    }

    /// Registers the completion listener, replacing any previous one. If the
    /// handle has already completed the listener runs immediately on the
    /// calling thread.
    pub fn set_listener(&self, listener: impl FnOnce(&Result<T, ExecutionError>) + Send + 'static) {
        let mut state = self.shared.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                listener(&outcome);
            }
            None => state.listener = Some(Box::new(listener)),
        }
    }

    /// Blocks until completion.
    ///
    /// # Errors
    /// The execution's failure, or [`ExecutionError::Cancelled`].
    pub fn wait(&self) -> Result<T, ExecutionError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.completed.wait(&mut state);
        }
    }

    /// Blocks until completion or until `timeout` elapses. Timing out leaves
    /// the execution running.
    ///
    /// # Errors
    /// [`ExecutionError::TimedOut`], the execution's failure, or
    /// [`ExecutionError::Cancelled`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, ExecutionError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if self
                .shared
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &state.outcome {
                    Some(outcome) => outcome.clone(),
                    None => Err(ExecutionError::TimedOut(timeout)),
                };
            }
        }
    }
}

impl<T: Clone + Send + 'static> Cancelable for ExecutionFuture<T> {
    fn cancel(&self, _may_interrupt: bool) -> bool {
        ExecutionFuture::cancel(self)
    }
}
