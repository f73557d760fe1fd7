//! Range handles: a consumer's slice of an aggregate.
//!
//! A [`BufferRange`] is strongly owned by the consumer that requested it
//! (the primitive or drawable). The owning aggregate only tracks ranges
//! weakly, so dropping the last strong reference makes the range eligible
//! for reclamation on the next prune or garbage-collection pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::aggregate::BufferAggregate;

/// Sentinel for a range that has not been placed by reallocation yet.
const INVALID_OFFSET: usize = usize::MAX;

/// A consumer-facing handle to a sub-range of an aggregate's backing
/// storage.
///
/// The handle reports its requested extent in elements and, once a
/// reallocation has placed it, its element offset within the aggregate's
/// resources. It holds its aggregate weakly; the aggregate holds it weakly
/// in return, so neither keeps the other alive.
pub struct BufferRange {
    num_elements: AtomicUsize,
    element_offset: AtomicUsize,
    capacity: AtomicUsize,
    aggregate: Mutex<Weak<BufferAggregate>>,
}

impl BufferRange {
    /// Create an unbound range requesting `num_elements` elements.
    pub fn new(num_elements: usize) -> Arc<Self> {
        Arc::new(Self {
            num_elements: AtomicUsize::new(num_elements),
            element_offset: AtomicUsize::new(INVALID_OFFSET),
            capacity: AtomicUsize::new(0),
            aggregate: Mutex::new(Weak::new()),
        })
    }

    /// Requested extent in elements.
    pub fn num_elements(&self) -> usize {
        self.num_elements.load(Ordering::Relaxed)
    }

    /// Extent in elements actually placed at
    /// [`element_offset`](Self::element_offset) by the last reallocation or
    /// compaction. Zero until placed; trails
    /// [`num_elements`](Self::num_elements) after a resize until the next
    /// reallocation.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Element offset assigned by the owning aggregate, or `None` if the
    /// range has not been placed yet.
    pub fn element_offset(&self) -> Option<usize> {
        match self.element_offset.load(Ordering::Relaxed) {
            INVALID_OFFSET => None,
            offset => Some(offset),
        }
    }

    /// The aggregate this range is currently assigned to, if any.
    pub fn aggregate(&self) -> Option<Arc<BufferAggregate>> {
        self.aggregate.lock().upgrade()
    }

    /// Whether the range is currently assigned to an aggregate.
    pub fn is_assigned(&self) -> bool {
        self.aggregate().is_some()
    }

    /// Change the requested extent.
    ///
    /// Growing or shrinking an assigned range invalidates its aggregate's
    /// layout: the aggregate is flagged for reallocation and its version
    /// bumped. The range keeps its old placement until the next
    /// reallocation actually moves it.
    pub fn resize(&self, num_elements: usize) {
        let old = self.num_elements.swap(num_elements, Ordering::Relaxed);
        if old == num_elements {
            return;
        }
        if let Some(aggregate) = self.aggregate() {
            aggregate.mark_needs_reallocation();
            aggregate.increment_version();
            log::trace!(
                "range resized {old} -> {num_elements} elements, aggregate `{}` flagged",
                aggregate.role()
            );
        }
    }

    /// Bind this range to an aggregate (called under the aggregate's range
    /// list lock during admission, or during reallocation migration).
    pub(crate) fn bind(&self, aggregate: Weak<BufferAggregate>) {
        *self.aggregate.lock() = aggregate;
    }

    /// Whether this range is bound to the given aggregate.
    pub(crate) fn is_bound_to(&self, aggregate: &Weak<BufferAggregate>) -> bool {
        self.aggregate.lock().ptr_eq(aggregate)
    }

    /// Record the placement assigned by a reallocation or compaction.
    pub(crate) fn set_placement(&self, offset: usize, capacity: usize) {
        debug_assert_ne!(offset, INVALID_OFFSET);
        self.element_offset.store(offset, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BufferRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRange")
            .field("num_elements", &self.num_elements())
            .field("element_offset", &self.element_offset())
            .field("assigned", &self.is_assigned())
            .finish()
    }
}

static_assertions::assert_impl_all!(BufferRange: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_range_is_unbound() {
        let range = BufferRange::new(16);
        assert_eq!(range.num_elements(), 16);
        assert_eq!(range.element_offset(), None);
        assert!(!range.is_assigned());
        assert!(range.aggregate().is_none());
    }

    #[test]
    fn test_resize_unbound() {
        let range = BufferRange::new(16);
        range.resize(32);
        assert_eq!(range.num_elements(), 32);
    }

    #[test]
    fn test_set_placement() {
        let range = BufferRange::new(4);
        assert_eq!(range.capacity(), 0);
        range.set_placement(12, 4);
        assert_eq!(range.element_offset(), Some(12));
        assert_eq!(range.capacity(), 4);
    }
}
