use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{error::ShoalError, types::ShoalResult};

/// Cooperative cancellation signal shared between an operation and its
/// caller (and between the store and its background actors).
///
/// Cancellation is checked at page boundaries: in-flight I/O always runs to
/// completion so on-disk invariants hold, then the operation returns
/// `Cancelled` instead of fetching further pages.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Early-out helper for loops: `token.check()?;`
    pub fn check(&self) -> ShoalResult<()> {
        if self.is_cancelled() {
            return Err(ShoalError::Cancelled);
        }
        Ok(())
    }
}
