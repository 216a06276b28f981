//! Bounded free-list of per-call scratch objects.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Scratch objects are cleared before going back to the pool.
pub(crate) trait Reset {
    fn reset(&mut self);
}

pub(crate) struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Default + Reset> Pool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Pool { free: Mutex::new(Vec::new()), capacity }
    }

    /// Take an idle entry or a fresh one. The guard returns it on drop, unwinding included.
    pub(crate) fn get(&self) -> Pooled<'_, T> {
        let item = self.free.lock().pop().unwrap_or_default();
        Pooled { pool: self, item }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut item: T) {
        item.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(item);
        }
    }
}

pub(crate) struct Pooled<'a, T: Default + Reset> {
    pool: &'a Pool<T>,
    item: T,
}

impl<T: Default + Reset> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Default + Reset> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Default + Reset> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buf(Vec<u8>);

    impl Reset for Buf {
        fn reset(&mut self) {
            self.0.clear();
        }
    }

    #[test]
    fn entries_come_back_cleared() {
        let pool: Pool<Buf> = Pool::new(4);
        {
            let mut b = pool.get();
            b.0.extend_from_slice(b"abc");
        }
        assert_eq!(pool.idle(), 1);
        let b = pool.get();
        assert!(b.0.is_empty());
        assert!(b.0.capacity() >= 3);
    }

    #[test]
    fn idle_entries_are_bounded() {
        let pool: Pool<Buf> = Pool::new(1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn entries_return_on_panic() {
        let pool: Pool<Buf> = Pool::new(2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut b = pool.get();
            b.0.push(1);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
