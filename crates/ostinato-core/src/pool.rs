//! Allocation-free lifecycle for drive movements.
//!
//! The step interrupt cannot tolerate allocator latency, so all
//! [`DriveMovement`] instances live in a freelist that only ever grows:
//! created at boot (or lazily, off the hot path) and recycled forever.
//! A movement is owned either by the pool or by exactly one active move;
//! handing it out moves the value, so the type system enforces the
//! single-owner rule.

use crate::drive::{DmState, DriveMovement};

#[derive(Debug, Default)]
pub struct DmPool {
    free: Vec<DriveMovement>,
    num_created: usize,
}

impl DmPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create instances at boot so the motion path never allocates.
    pub fn initial_allocate(&mut self, num: usize) {
        while self.num_created < num {
            self.free.push(DriveMovement::new(0));
            self.num_created += 1;
        }
    }

    /// Take a movement for `drive`, creating one only if the pool is dry.
    pub fn allocate(&mut self, drive: usize, state: DmState) -> DriveMovement {
        let mut dm = self.free.pop().unwrap_or_else(|| {
            self.num_created += 1;
            DriveMovement::new(drive)
        });
        dm.reset(drive, state);
        dm
    }

    /// Return a movement once its move has finished.
    pub fn release(&mut self, dm: DriveMovement) {
        self.free.push(dm);
    }

    /// Total instances ever created; only grows.
    pub fn num_created(&self) -> usize {
        self.num_created
    }

    /// Instances currently on the freelist.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_allocation_fills_the_freelist() {
        let mut pool = DmPool::new();
        pool.initial_allocate(4);
        assert_eq!(pool.num_created(), 4);
        assert_eq!(pool.available(), 4);
        // Idempotent for smaller requests.
        pool.initial_allocate(2);
        assert_eq!(pool.num_created(), 4);
    }

    #[test]
    fn allocate_recycles_before_creating() {
        let mut pool = DmPool::new();
        pool.initial_allocate(2);

        let a = pool.allocate(0, DmState::Idle);
        let b = pool.allocate(1, DmState::Idle);
        assert_eq!(pool.available(), 0);
        assert_eq!(a.drive(), 0);
        assert_eq!(b.drive(), 1);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let c = pool.allocate(2, DmState::Idle);
        assert_eq!(c.drive(), 2);
        assert_eq!(pool.num_created(), 2, "recycled, not created");

        // Pool dry again: the next allocate grows it.
        let _d = pool.allocate(3, DmState::Idle);
        assert_eq!(pool.num_created(), 3);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), 2);
    }
}
