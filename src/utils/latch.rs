use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Latch access for the reader-writer locks guarding pages and shared
/// maps.
///
/// Poisoning is not a recoverable condition here: a holder that panicked
/// mid-write may have left a half-encoded page behind, so continuing past
/// it would trade a crash for corruption. Acquiring through these methods
/// makes that policy explicit at every latch site.
pub trait Latched<T: ?Sized> {
    fn latch_read(&self) -> RwLockReadGuard<'_, T>;
    fn latch_write(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T: ?Sized> Latched<T> for RwLock<T> {
    fn latch_read(&self) -> RwLockReadGuard<'_, T> {
        match self.read() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("read latch poisoned: {}", poisoned),
        }
    }

    fn latch_write(&self) -> RwLockWriteGuard<'_, T> {
        match self.write() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("write latch poisoned: {}", poisoned),
        }
    }
}
