//! The buffer aggregate: bookkeeping core of the allocator.
//!
//! A [`BufferAggregate`] bundles several coherent buffer resources and hands
//! out sub-ranges of them to independent consumers. It can be shared across
//! many primitives in the context of buffer aggregation: the aggregation
//! manager admits ranges into existing aggregates, creates new ones when all
//! reject, prunes and garbage-collects on a cadence, and reallocates any
//! aggregate that reports it needs rebuilding.
//!
//! Layout decisions (how specs map to resource slots, how ranges are packed,
//! how data moves on reallocation) are delegated to an
//! [`AggregationStrategy`], a small closed set of layout policies rather
//! than an inheritance hierarchy.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::AggregationResult;
use crate::range::BufferRange;
use crate::resource::{BufferResource, ByteStore};
use crate::types::{BufferSpec, BufferUsage, ElementFormat};

/// Layout policy of a [`BufferAggregate`].
///
/// One strategy instance is owned by one aggregate. The aggregate serializes
/// `reallocate` and resource registration externally (they are invoked from
/// the single coordinating phase of the surrounding pipeline), while
/// `garbage_collect` may run concurrently with admission on the same
/// aggregate and must take the range list lock through the aggregate's
/// pruning helpers.
pub trait AggregationStrategy: Send + Sync {
    /// Capacity ceiling on admitted ranges, fixed at construction.
    fn max_num_ranges(&self) -> usize;

    /// Register this strategy's resource slots on a freshly constructed
    /// aggregate. Called exactly once, from [`BufferAggregate::new`].
    fn register_resources(&self, aggregate: &BufferAggregate);

    /// Prune dead ranges and compact the backing layout, preserving the
    /// relative order of survivors and updating their offsets. Returns true
    /// if the aggregate is now empty and eligible for destruction.
    ///
    /// A strategy that realizes the compacted layout in place leaves
    /// `needs_reallocation` as it found it; one that cannot shift in place
    /// sets it so the manager schedules a reallocation.
    fn garbage_collect(&self, aggregate: &BufferAggregate) -> bool;

    /// Rebuild the backing layout so it holds exactly `ranges`, in order,
    /// migrating each already-placed range's bytes from `cur_range_owner`
    /// (which may be the aggregate itself). On success every supplied range
    /// is bound to `aggregate`, `needs_reallocation` is cleared, and the
    /// version is bumped. On error the aggregate still needs reallocation.
    fn reallocate(
        &self,
        aggregate: &BufferAggregate,
        ranges: &[Arc<BufferRange>],
        cur_range_owner: &Arc<BufferAggregate>,
    ) -> AggregationResult<()>;

    /// Total element capacity of the current layout.
    fn max_num_elements(&self, aggregate: &BufferAggregate) -> usize;

    /// Human-readable dump of the aggregate's layout. Not a stable format.
    fn debug_dump(&self, aggregate: &BufferAggregate, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

/// A bundle of coherent buffer resources shared by many consumers.
pub struct BufferAggregate {
    role: String,
    gc_perf_token: String,

    version: AtomicU64,
    needs_reallocation: AtomicBool,
    max_num_ranges: usize,

    // Ranges are appended under the lock from many threads during scene
    // population, then pruned and re-packed by GC/reallocation. The atomic
    // count is an advisory snapshot for lock-free size queries; the locked
    // list is authoritative for admission.
    range_list: Mutex<Vec<Weak<BufferRange>>>,
    range_count: AtomicUsize,

    // Structural mutation only at construction and inside reallocate, both
    // serialized by the surrounding pipeline.
    resources: RwLock<Vec<(String, Arc<BufferResource>)>>,

    self_weak: Weak<BufferAggregate>,
    strategy: Box<dyn AggregationStrategy>,
}

impl BufferAggregate {
    /// Create an aggregate with the given role, GC attribution token, and
    /// layout strategy. The strategy registers its resource slots before
    /// the aggregate is returned.
    pub fn new(
        role: impl Into<String>,
        gc_perf_token: impl Into<String>,
        strategy: Box<dyn AggregationStrategy>,
    ) -> Arc<Self> {
        let max_num_ranges = strategy.max_num_ranges();
        let aggregate = Arc::new_cyclic(|self_weak| Self {
            role: role.into(),
            gc_perf_token: gc_perf_token.into(),
            version: AtomicU64::new(0),
            needs_reallocation: AtomicBool::new(false),
            max_num_ranges,
            range_list: Mutex::new(Vec::new()),
            range_count: AtomicUsize::new(0),
            resources: RwLock::new(Vec::new()),
            self_weak: self_weak.clone(),
            strategy,
        });
        aggregate.strategy.register_resources(&aggregate);
        aggregate
    }

    /// Classification tag of the data this aggregate holds. The aggregation
    /// manager only groups ranges into aggregates of the same role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Tag attributing garbage-collection cost to a bucket.
    pub fn gc_perf_token(&self) -> &str {
        &self.gc_perf_token
    }

    /// Current version of this aggregate. Consumers (e.g. indirect
    /// draw-dispatch buffers) cache this to detect a stale view of the
    /// layout.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Bump the version. Invoked whenever the shape of the aggregate
    /// changes: range admitted, range removed, layout recompacted,
    /// reallocated.
    pub fn increment_version(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether [`reallocate`](Self::reallocate) must run before the layout
    /// can satisfy the assigned ranges again.
    pub fn needs_reallocation(&self) -> bool {
        self.needs_reallocation.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_needs_reallocation(&self) {
        self.needs_reallocation.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_needs_reallocation(&self) {
        self.needs_reallocation.store(false, Ordering::Relaxed);
    }

    /// Capacity ceiling on admitted ranges.
    pub fn max_num_ranges(&self) -> usize {
        self.max_num_ranges
    }

    /// Attempt to assign a range to this aggregate.
    ///
    /// Multiple threads may try to assign to the same aggregate
    /// concurrently; the check-and-append runs under the range list lock so
    /// two admissions can never both succeed past the capacity ceiling.
    /// Returns false, without side effects, if the aggregate has no room
    /// left, so the caller can try another aggregate or create a new one.
    pub fn try_assign_range(&self, range: &Arc<BufferRange>) -> bool {
        debug_assert!(
            !range.is_assigned(),
            "candidate range is already bound to an aggregate"
        );
        {
            let mut list = self.range_list.lock();
            if self.range_count.load(Ordering::Relaxed) >= self.max_num_ranges {
                return false;
            }
            list.push(Arc::downgrade(range));
            range.bind(self.self_weak.clone());
            self.range_count.fetch_add(1, Ordering::Relaxed);
            self.needs_reallocation.store(true, Ordering::Relaxed);
        }
        self.increment_version();
        log::trace!(
            "aggregate `{}`: admitted range of {} elements",
            self.role,
            range.num_elements()
        );
        true
    }

    /// Number of ranges attached to this aggregate.
    ///
    /// Lock-free advisory snapshot; may be momentarily stale by one pending
    /// mutation. Never used as the admission gate.
    pub fn range_count(&self) -> usize {
        self.range_count.load(Ordering::Relaxed)
    }

    /// The attached range at `idx`, or `None` if out of bounds. The weak
    /// reference may expire between enumeration and use; callers must
    /// upgrade and check.
    pub fn range(&self, idx: usize) -> Option<Weak<BufferRange>> {
        self.range_list.lock().get(idx).cloned()
    }

    /// Drop range list entries whose consumers released them, or whose
    /// range has been migrated to another aggregate, and update the
    /// advisory count. Bumps the version if anything was removed.
    /// Bookkeeping only: backing storage is compacted by
    /// [`garbage_collect`](Self::garbage_collect), not here. Returns the
    /// number of ranges after clean-up.
    pub fn remove_unused_ranges(&self) -> usize {
        self.prune_ranges().len()
    }

    /// Prune expired and migrated-away entries and return strong references
    /// to the survivors in list order. Single pass under the range list
    /// lock, shared by `remove_unused_ranges` and the strategies' garbage
    /// collection.
    pub(crate) fn prune_ranges(&self) -> Vec<Arc<BufferRange>> {
        let removed;
        let live = {
            let mut list = self.range_list.lock();
            let before = list.len();
            let mut live = Vec::with_capacity(before);
            list.retain(|weak| match weak.upgrade() {
                Some(range) if range.is_bound_to(&self.self_weak) => {
                    live.push(range);
                    true
                }
                _ => false,
            });
            removed = before - list.len();
            self.range_count.store(list.len(), Ordering::Relaxed);
            live
        };
        if removed > 0 {
            self.increment_version();
            log::trace!(
                "aggregate `{}`: pruned {removed} expired ranges, {} remain",
                self.role,
                live.len()
            );
        }
        live
    }

    /// Replace the range list wholesale (reallocation and compaction).
    /// Does not bump the version; callers account for the shape change
    /// themselves.
    pub(crate) fn set_range_list(&self, ranges: &[Arc<BufferRange>]) {
        let mut list = self.range_list.lock();
        *list = ranges.iter().map(Arc::downgrade).collect();
        self.range_count.store(ranges.len(), Ordering::Relaxed);
    }

    pub(crate) fn self_weak(&self) -> Weak<BufferAggregate> {
        self.self_weak.clone()
    }

    /// The sole resource slot of this aggregate.
    ///
    /// Returns `None` on an aggregate with no resources.
    ///
    /// # Panics
    ///
    /// Panics if the aggregate has more than one slot: callers know
    /// statically whether their aggregate is single- or multi-resource, so
    /// an ambiguous lookup is a caller bug, not a runtime condition. Use
    /// [`resource_named`](Self::resource_named) on multi-resource
    /// aggregates.
    pub fn resource(&self) -> Option<Arc<BufferResource>> {
        let resources = self.resources.read();
        assert!(
            resources.len() <= 1,
            "resource() called on aggregate `{}` with {} resource slots; use resource_named()",
            self.role,
            resources.len()
        );
        resources.first().map(|(_, res)| Arc::clone(res))
    }

    /// The first resource slot registered under `name`, or `None`.
    ///
    /// Debug builds and the `strict-validation` feature additionally verify
    /// that no second slot shares the name, and panic if one does.
    pub fn resource_named(&self, name: &str) -> Option<Arc<BufferResource>> {
        let resources = self.resources.read();
        if cfg!(debug_assertions) || cfg!(feature = "strict-validation") {
            let matches = resources.iter().filter(|(n, _)| n == name).count();
            assert!(
                matches <= 1,
                "aggregate `{}` has {matches} resource slots named `{name}`",
                self.role
            );
        }
        resources
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, res)| Arc::clone(res))
    }

    /// Snapshot of the full ordered named-resource list.
    pub fn resources(&self) -> Vec<(String, Arc<BufferResource>)> {
        self.resources.read().clone()
    }

    /// Reconstruct the buffer specs this aggregate serves, one per resource
    /// slot in registration order. Used by the aggregation manager when
    /// splitting buffers.
    pub fn buffer_specs(&self) -> Vec<BufferSpec> {
        self.resources
            .read()
            .iter()
            .map(|(name, res)| BufferSpec {
                name: name.clone(),
                format: res.format(),
                array_size: res.array_size(),
            })
            .collect()
    }

    /// Register a named resource slot and return it. Construction-time
    /// only; not safe to call concurrently with resource reads.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_resource(
        &self,
        name: &str,
        format: ElementFormat,
        array_size: usize,
        usage: BufferUsage,
        offset: usize,
        stride: usize,
        store: ByteStore,
    ) -> Arc<BufferResource> {
        let mut resources = self.resources.write();
        if cfg!(debug_assertions) || cfg!(feature = "strict-validation") {
            assert!(
                !resources.iter().any(|(n, _)| n == name),
                "aggregate `{}` already has a resource slot named `{name}`",
                self.role
            );
        }
        let resource = Arc::new(BufferResource::new(
            format, array_size, usage, offset, stride, store,
        ));
        resources.push((name.to_string(), Arc::clone(&resource)));
        resource
    }

    /// Prune dead ranges and compact the backing layout. Returns true if
    /// the aggregate is now empty and the manager should destroy it.
    pub fn garbage_collect(&self) -> bool {
        self.strategy.garbage_collect(self)
    }

    /// Rebuild the layout so it holds exactly `ranges`, migrating placed
    /// ranges' data from `cur_range_owner`. The only operation permitted to
    /// grow resource capacities.
    pub fn reallocate(
        &self,
        ranges: &[Arc<BufferRange>],
        cur_range_owner: &Arc<BufferAggregate>,
    ) -> AggregationResult<()> {
        self.strategy.reallocate(self, ranges, cur_range_owner)
    }

    /// Total element capacity of the current layout.
    pub fn max_num_elements(&self) -> usize {
        self.strategy.max_num_elements(self)
    }
}

impl fmt::Display for BufferAggregate {
    /// Debug dump, delegated to the strategy. Not a stable format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.strategy.debug_dump(self, f)
    }
}

impl fmt::Debug for BufferAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAggregate")
            .field("role", &self.role)
            .field("gc_perf_token", &self.gc_perf_token)
            .field("version", &self.version())
            .field("needs_reallocation", &self.needs_reallocation())
            .field("range_count", &self.range_count())
            .field("max_num_ranges", &self.max_num_ranges)
            .field("resources", &self.resources.read().len())
            .finish()
    }
}

static_assertions::assert_impl_all!(BufferAggregate: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SeparateAggregation;
    use crate::types::{BufferSpec, BufferUsage, ElementFormat};

    fn two_slot_aggregate(max_ranges: usize) -> Arc<BufferAggregate> {
        SeparateAggregation::new_aggregate(
            "vertex",
            "meshGc",
            vec![
                BufferSpec::new("points", ElementFormat::Float3),
                BufferSpec::new("normals", ElementFormat::Float3),
            ],
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            max_ranges,
        )
    }

    #[test]
    fn test_admission_up_to_capacity() {
        let aggregate = two_slot_aggregate(2);
        assert_eq!(aggregate.version(), 0);
        assert!(!aggregate.needs_reallocation());

        let a = BufferRange::new(10);
        let b = BufferRange::new(20);
        let c = BufferRange::new(5);

        assert!(aggregate.try_assign_range(&a));
        assert_eq!(aggregate.version(), 1);
        assert!(aggregate.needs_reallocation());

        assert!(aggregate.try_assign_range(&b));
        assert_eq!(aggregate.version(), 2);
        assert_eq!(aggregate.range_count(), 2);

        // Full: rejection has no side effects.
        assert!(!aggregate.try_assign_range(&c));
        assert_eq!(aggregate.version(), 2);
        assert_eq!(aggregate.range_count(), 2);
        assert!(!c.is_assigned());
    }

    #[test]
    fn test_admission_binds_range() {
        let aggregate = two_slot_aggregate(4);
        let range = BufferRange::new(8);
        assert!(aggregate.try_assign_range(&range));
        let owner = range.aggregate().expect("range should be bound");
        assert!(Arc::ptr_eq(&owner, &aggregate));
    }

    #[test]
    fn test_remove_unused_ranges_keeps_order() {
        let aggregate = two_slot_aggregate(8);
        let a = BufferRange::new(1);
        let b = BufferRange::new(2);
        let c = BufferRange::new(3);
        for range in [&a, &b, &c] {
            assert!(aggregate.try_assign_range(range));
        }
        let version_before = aggregate.version();

        drop(b);
        assert_eq!(aggregate.remove_unused_ranges(), 2);
        assert_eq!(aggregate.range_count(), 2);
        assert!(aggregate.version() > version_before);

        // Survivors keep their relative order.
        let first = aggregate.range(0).unwrap().upgrade().unwrap();
        let second = aggregate.range(1).unwrap().upgrade().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &c));
        assert!(aggregate.range(2).is_none());
    }

    #[test]
    fn test_prune_nothing_leaves_version() {
        let aggregate = two_slot_aggregate(4);
        let a = BufferRange::new(1);
        assert!(aggregate.try_assign_range(&a));
        let version = aggregate.version();
        assert_eq!(aggregate.remove_unused_ranges(), 1);
        assert_eq!(aggregate.version(), version);
    }

    #[test]
    #[should_panic(expected = "resource()")]
    fn test_sole_resource_on_multi_slot_aggregate() {
        let aggregate = two_slot_aggregate(1);
        let _ = aggregate.resource();
    }

    #[test]
    fn test_sole_resource_single_and_empty() {
        let single = SeparateAggregation::new_aggregate(
            "index",
            "meshGc",
            vec![BufferSpec::new("indices", ElementFormat::Uint)],
            BufferUsage::INDEX,
            4,
        );
        let res = single.resource().expect("sole resource");
        assert_eq!(res.format(), ElementFormat::Uint);

        let empty = SeparateAggregation::new_aggregate(
            "empty",
            "meshGc",
            vec![],
            BufferUsage::empty(),
            4,
        );
        assert!(empty.resource().is_none());
    }

    #[test]
    fn test_named_resource_lookup() {
        let aggregate = two_slot_aggregate(1);
        assert!(aggregate.resource_named("normals").is_some());
        assert!(aggregate.resource_named("colors").is_none());
    }

    #[test]
    fn test_buffer_specs_roundtrip() {
        let specs = vec![
            BufferSpec::new("points", ElementFormat::Float3),
            BufferSpec::new("normals", ElementFormat::Float3),
        ];
        let aggregate = SeparateAggregation::new_aggregate(
            "vertex",
            "meshGc",
            specs.clone(),
            BufferUsage::VERTEX,
            4,
        );
        assert_eq!(aggregate.buffer_specs(), specs);
    }

    #[test]
    fn test_debug_dump_mentions_role() {
        let aggregate = two_slot_aggregate(2);
        let dump = format!("{aggregate}");
        assert!(dump.contains("vertex"));
        assert!(dump.contains("meshGc"));
    }
}
