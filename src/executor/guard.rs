use crate::sync::{AtomicIsize, Ordering};

/// Parked far below zero once the run has completed, so late `enter`/`exit`
/// pairs can never bring the counter back to zero.
const COMPLETED: isize = isize::MIN / 2;

/// Decides which of many concurrently finishing callbacks completes a run.
///
/// Every callback that may observe the end of a run brackets its work with
/// [`enter`](Self::enter) and [`exit`](Self::exit). The last one to leave while
/// the run is finished wins; any number of threads may race here and exactly
/// one of them gets `true`.
///
/// The submitting thread also holds the guard while it dispatches the initial
/// fragments, so a run whose jobs complete synchronously inside `dispatch`
/// cannot be completed before every initial fragment has been submitted.
#[derive(Debug)]
pub struct CompletionGuard {
    active: AtomicIsize,
}

impl Default for CompletionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicIsize::new(0),
        }
    }

    #[inline]
    pub fn enter(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Leaves the guard. Returns `true` to exactly one caller: the last to
    /// leave, provided `is_finished` holds at that point.
    ///
    /// `is_finished` must be monotone: once true it stays true.
    #[inline]
    pub fn exit(&self, is_finished: impl FnOnce() -> bool) -> bool {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return false;
        }
        is_finished()
            && self
                .active
                .compare_exchange(0, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.active.load(Ordering::SeqCst) < 0
    }
}
