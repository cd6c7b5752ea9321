use crate::errors::{
    ClassifiedError,
    ErrorKind,
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};

/// Whether the ledger we are connected to is the configured chain.
/// Starts unverified; `connect` settles it.
#[derive(Clone, Debug)]
pub struct NetworkGuard {
    state: Arc<Mutex<Result<(), ClassifiedError>>>,
}

impl Default for NetworkGuard {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(Err(ClassifiedError::new(
                ErrorKind::NetworkUnavailable,
                "Not connected yet.",
                "connect has not completed",
            )))),
        }
    }
}

impl NetworkGuard {
    pub fn check(&self) -> Result<(), ClassifiedError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_ok(&self) -> bool {
        self.check().is_ok()
    }

    pub fn set(&self, state: Result<(), ClassifiedError>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn verified() -> Self {
        let guard = Self::default();
        guard.set(Ok(()));
        guard
    }
}
