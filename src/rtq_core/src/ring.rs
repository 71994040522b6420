//! Fixed-capacity item storage
use alloc::{boxed::Box, vec};

/// Contiguous storage for `capacity` items of `item_size` bytes each.
///
/// The buffer doesn't know how many items it holds; the owning queue keeps
/// the count and decides whether an operation is permitted.
///
/// Cursors are slot indices. `write` is the slot the next item sent to the
/// back goes to. `read` is the slot that was read last, so the next item to
/// be read is in the slot after it, and an item sent to the front goes to
/// `read` itself.
pub(super) struct RingBuffer {
    storage: Box<[u8]>,
    item_size: usize,
    capacity: usize,
    write: usize,
    read: usize,
}

impl RingBuffer {
    /// Allocate storage for `capacity` items.
    ///
    /// Panics if `capacity` is zero or the storage size overflows `usize`.
    pub(super) fn new(capacity: usize, item_size: usize) -> Self {
        assert_ne!(capacity, 0, "a queue must be able to hold at least one item");
        let Some(len) = capacity.checked_mul(item_size) else {
            panic!("queue storage of {capacity} × {item_size} bytes is too large");
        };

        Self {
            storage: vec![0u8; len].into_boxed_slice(),
            item_size,
            capacity,
            write: 0,
            read: capacity - 1,
        }
    }

    /// Rewind both cursors. The contents are left as they are.
    pub(super) fn reset(&mut self) {
        self.write = 0;
        self.read = self.capacity - 1;
    }

    #[inline]
    fn next(&self, i: usize) -> usize {
        (i + 1) % self.capacity
    }

    #[inline]
    fn prev(&self, i: usize) -> usize {
        (i + self.capacity - 1) % self.capacity
    }

    #[inline]
    fn slot(&self, i: usize) -> &[u8] {
        let start = i * self.item_size;
        &self.storage[start..start + self.item_size]
    }

    #[inline]
    fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.item_size;
        &mut self.storage[start..start + self.item_size]
    }

    /// Store `item` after the last item.
    pub(super) fn push_back(&mut self, item: &[u8]) {
        let i = self.write;
        self.slot_mut(i).copy_from_slice(item);
        self.write = self.next(i);
    }

    /// Store `item` before the first item.
    pub(super) fn push_front(&mut self, item: &[u8]) {
        let i = self.read;
        self.slot_mut(i).copy_from_slice(item);
        self.read = self.prev(i);
    }

    /// Remove the first item, copying it to `out`.
    pub(super) fn pop_front(&mut self, out: &mut [u8]) {
        self.read = self.next(self.read);
        out.copy_from_slice(self.slot(self.read));
    }

    /// Copy the first item to `out` without removing it.
    pub(super) fn peek_front(&self, out: &mut [u8]) {
        out.copy_from_slice(self.slot(self.next(self.read)));
    }
}
