//! Bucket membership lists.
//!
//! Buffers and bucket heads share one arena of link slots: slots
//! `0..nbuf` are buffers, slots `nbuf..nbuf + nbuckets` are the sentinel
//! heads. Each bucket is a circular doubly-linked list threaded through
//! `prev`/`next`, most recently released first.
//!
//! The link words of a slot are only written while the lock of the bucket
//! that slot belongs to is held. Every mutating method takes the bucket's
//! `&mut Bucket` (reachable only through its lock guard) as the witness.
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// State guarded by one bucket lock.
pub(crate) struct Bucket {
    /// sentinel slot of this bucket
    head: usize,
    /// number of buffers on the list
    len: usize,
}

impl Bucket {
    pub(crate) fn new(head: usize) -> Self {
        Self { head, len: 0 }
    }
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Link arena for all buckets
pub(crate) struct Links {
    prev: Vec<AtomicUsize>,
    next: Vec<AtomicUsize>,
}

impl Links {
    /// Every slot starts out as an empty circular list pointing at itself.
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            prev: (0..slots).map(AtomicUsize::new).collect(),
            next: (0..slots).map(AtomicUsize::new).collect(),
        }
    }
    fn prev(&self, slot: usize) -> usize {
        self.prev[slot].load(Ordering::Relaxed)
    }
    fn next(&self, slot: usize) -> usize {
        self.next[slot].load(Ordering::Relaxed)
    }
    /// Insert `id` right after the head, i.e. at the most-recently-used end.
    pub(crate) fn push_front(&self, bucket: &mut Bucket, id: usize) {
        let head = bucket.head;
        let first = self.next(head);
        self.next[id].store(first, Ordering::Relaxed);
        self.prev[id].store(head, Ordering::Relaxed);
        self.prev[first].store(id, Ordering::Relaxed);
        self.next[head].store(id, Ordering::Relaxed);
        bucket.len += 1;
    }
    /// Take `id` off the list of `bucket`.
    pub(crate) fn unlink(&self, bucket: &mut Bucket, id: usize) {
        debug_assert_ne!(id, bucket.head);
        let (prev, next) = (self.prev(id), self.next(id));
        self.next[prev].store(next, Ordering::Relaxed);
        self.prev[next].store(prev, Ordering::Relaxed);
        self.next[id].store(id, Ordering::Relaxed);
        self.prev[id].store(id, Ordering::Relaxed);
        bucket.len -= 1;
    }
    /// Move `id`, already on `bucket`, to the most-recently-used end.
    pub(crate) fn move_to_front(&self, bucket: &mut Bucket, id: usize) {
        self.unlink(bucket, id);
        self.push_front(bucket, id);
    }
    /// Walk from the most-recently-used end.
    pub(crate) fn iter_mru<'a>(&'a self, bucket: &'a Bucket) -> Walk<'a> {
        Walk {
            links: self,
            head: bucket.head,
            cur: self.next(bucket.head),
            forward: true,
        }
    }
    /// Walk from the least-recently-used end.
    pub(crate) fn iter_lru<'a>(&'a self, bucket: &'a Bucket) -> Walk<'a> {
        Walk {
            links: self,
            head: bucket.head,
            cur: self.prev(bucket.head),
            forward: false,
        }
    }
}

/// Iterator over the buffer slots of one bucket
pub(crate) struct Walk<'a> {
    links: &'a Links,
    head: usize,
    cur: usize,
    forward: bool,
}

impl Iterator for Walk<'_> {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.cur == self.head {
            return None;
        }
        let id = self.cur;
        self.cur = if self.forward {
            self.links.next(id)
        } else {
            self.links.prev(id)
        };
        Some(id)
    }
}
