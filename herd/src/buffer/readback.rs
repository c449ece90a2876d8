use std::sync::Arc;

use parking_lot::Mutex;

use crate::ReadbackError;

/// Lifecycle of a single asynchronous readback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReadbackState {
    Pending,
    Completed,
    /// The buffer was released; whatever arrives is discarded.
    Invalidated,
}

/// Shared view of an in-flight readback. Every request that joined the
/// readback gets a clone pointing at the same state.
#[derive(Debug, Clone)]
pub struct ReadbackHandle {
    state: Arc<Mutex<ReadbackState>>,
}

impl ReadbackHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReadbackState::Pending)),
        }
    }

    pub fn state(&self) -> ReadbackState {
        *self.state.lock()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == ReadbackState::Pending
    }

    pub fn is_invalidated(&self) -> bool {
        self.state() == ReadbackState::Invalidated
    }

    /// Moves a pending readback to completed. Returns false if it was invalidated first.
    pub(crate) fn complete(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ReadbackState::Pending | ReadbackState::Completed => {
                *state = ReadbackState::Completed;
                true
            }
            ReadbackState::Invalidated => false,
        }
    }

    /// Idempotent.
    pub fn invalidate(&self) {
        *self.state.lock() = ReadbackState::Invalidated;
    }

    /// True if both handles refer to the same readback.
    pub fn same_request(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Receives the readback's data, or why there is none.
pub type ReadbackCallback<T> = Box<dyn FnOnce(Result<&[T], ReadbackError>) + Send>;

#[cfg(test)]
mod test {
    use super::{ReadbackHandle, ReadbackState};

    #[test]
    fn invalidation_is_final_and_idempotent() {
        let handle = ReadbackHandle::new();
        let joined = handle.clone();
        assert!(handle.same_request(&joined));
        assert_eq!(joined.state(), ReadbackState::Pending);

        handle.invalidate();
        handle.invalidate();
        assert!(joined.is_invalidated());
        assert!(!joined.complete());
        assert_eq!(handle.state(), ReadbackState::Invalidated);
    }

    #[test]
    fn completed_results_can_still_be_invalidated() {
        let handle = ReadbackHandle::new();
        assert!(handle.complete());
        assert_eq!(handle.state(), ReadbackState::Completed);
        handle.invalidate();
        assert_eq!(handle.state(), ReadbackState::Invalidated);
    }
}
