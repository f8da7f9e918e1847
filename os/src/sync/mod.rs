//! Synchronization and core-local primitives

use core::sync::atomic::{AtomicUsize, Ordering};

/// The core a kernel thread runs on.
///
/// `push_off`/`pop_off` nest; while at least one `push_off` is outstanding
/// the caller can be neither preempted nor migrated, so `id` stays stable.
pub trait Hart: Send + Sync {
    /// id of the current core
    fn id(&self) -> usize;
    /// disable interrupts on the current core
    fn push_off(&self);
    /// undo one `push_off`
    fn pop_off(&self);
}

/// Keeps the caller on its core while alive
pub struct NoMigrate<'a> {
    hart: &'a dyn Hart,
}

impl<'a> NoMigrate<'a> {
    pub fn new(hart: &'a dyn Hart) -> Self {
        hart.push_off();
        Self { hart }
    }
    /// The core we are pinned to
    pub fn cpu(&self) -> usize {
        self.hart.id()
    }
}

impl Drop for NoMigrate<'_> {
    fn drop(&mut self) {
        self.hart.pop_off();
    }
}

/// A uniprocessor: always core 0
#[derive(Default)]
pub struct UniHart {
    noff: AtomicUsize,
}

impl UniHart {
    pub const fn new() -> Self {
        Self {
            noff: AtomicUsize::new(0),
        }
    }
    /// Depth of outstanding `push_off` calls
    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::SeqCst)
    }
}

impl Hart for UniHart {
    fn id(&self) -> usize {
        0
    }
    fn push_off(&self) {
        self.noff.fetch_add(1, Ordering::SeqCst);
    }
    fn pop_off(&self) {
        let prev = self.noff.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "pop_off");
    }
}
