//! Reusable byte buffers in three size classes.
//!
//! Encode paths grab a buffer, fill it and hand it back instead of allocating
//! per operation. Each class keeps a bounded free list; returning a buffer to
//! a full class just drops it.

use std::sync::Mutex;

pub const SMALL_BUFFER: usize = 4 * 1024;
pub const MEDIUM_BUFFER: usize = 64 * 1024;
pub const LARGE_BUFFER: usize = 4 * 1024 * 1024;

const MAX_POOLED_PER_CLASS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn for_len(len: usize) -> Self {
        if len <= SMALL_BUFFER {
            SizeClass::Small
        } else if len <= MEDIUM_BUFFER {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    fn capacity(&self) -> usize {
        match self {
            SizeClass::Small => SMALL_BUFFER,
            SizeClass::Medium => MEDIUM_BUFFER,
            SizeClass::Large => LARGE_BUFFER,
        }
    }
}

#[derive(Default)]
pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn shelf(&self, class: SizeClass) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
        }
    }

    /// An empty buffer with at least `hint` bytes of capacity.
    pub fn get(&self, hint: usize) -> Vec<u8> {
        let class = SizeClass::for_len(hint);

        let mut shelf = self.shelf(class).lock().unwrap_or_else(|e| e.into_inner());

        match shelf.pop() {
            Some(mut buf) => {
                buf.clear();
                if buf.capacity() < hint {
                    buf.reserve(hint - buf.capacity());
                }
                buf
            }
            None => Vec::with_capacity(hint.max(class.capacity())),
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }

        let class = SizeClass::for_len(buf.capacity());
        let mut shelf = self.shelf(class).lock().unwrap_or_else(|e| e.into_inner());

        if shelf.len() < MAX_POOLED_PER_CLASS {
            shelf.push(buf);
        }
    }

    pub fn pooled(&self, class: SizeClass) -> usize {
        self.shelf(class)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection_by_size() {
        assert_eq!(SizeClass::for_len(100), SizeClass::Small);
        assert_eq!(SizeClass::for_len(SMALL_BUFFER), SizeClass::Small);
        assert_eq!(SizeClass::for_len(SMALL_BUFFER + 1), SizeClass::Medium);
        assert_eq!(SizeClass::for_len(MEDIUM_BUFFER + 1), SizeClass::Large);
        assert_eq!(SizeClass::for_len(100 * 1024 * 1024), SizeClass::Large);
    }

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new();

        let mut buf = pool.get(1024);
        buf.extend_from_slice(b"scratch");
        let cap = buf.capacity();
        pool.put(buf);

        assert_eq!(pool.pooled(SizeClass::Small), 1);

        let again = pool.get(1024);
        assert!(again.is_empty());
        assert_eq!(again.capacity(), cap);
        assert_eq!(pool.pooled(SizeClass::Small), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = BufferPool::new();

        for _ in 0..(MAX_POOLED_PER_CLASS + 10) {
            pool.put(Vec::with_capacity(64));
        }

        assert_eq!(pool.pooled(SizeClass::Small), MAX_POOLED_PER_CLASS);
    }
}
