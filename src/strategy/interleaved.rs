//! Interleaved layout: all slots aliasing one backing store.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregate::{AggregationStrategy, BufferAggregate};
use crate::error::{AggregationError, AggregationResult};
use crate::range::BufferRange;
use crate::resource::ByteStore;
use crate::types::{BufferSpec, BufferUsage};

use super::{assign_offsets, copy_elements, dump_ranges};

/// Layout strategy packing all specs into one array-of-structs store:
/// element `i` is one packed struct holding every spec's value. One slot
/// per spec is registered, all aliasing the same store, with stride = the
/// packed struct size and offset = the field offset within the struct.
///
/// Migration between aggregates assumes the source uses the same spec set
/// (the aggregation manager only groups ranges by role, and role implies
/// the spec set), so ranges move as whole packed structs.
pub struct InterleavedAggregation {
    specs: Vec<BufferSpec>,
    usage: BufferUsage,
    stride: usize,
    max_num_ranges: usize,
    capacity: AtomicUsize,
    store: ByteStore,
}

impl InterleavedAggregation {
    /// Create the strategy. The struct stride is the packed sum of the
    /// spec element sizes, in spec order.
    pub fn new(specs: Vec<BufferSpec>, usage: BufferUsage, max_num_ranges: usize) -> Self {
        debug_assert!(specs.iter().all(|s| s.array_size > 0));
        let stride = specs.iter().map(|s| s.size_bytes()).sum();
        Self {
            specs,
            usage,
            stride,
            max_num_ranges,
            capacity: AtomicUsize::new(0),
            store: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Build an aggregate using this strategy.
    pub fn new_aggregate(
        role: impl Into<String>,
        gc_perf_token: impl Into<String>,
        specs: Vec<BufferSpec>,
        usage: BufferUsage,
        max_num_ranges: usize,
    ) -> Arc<BufferAggregate> {
        BufferAggregate::new(
            role,
            gc_perf_token,
            Box::new(Self::new(specs, usage, max_num_ranges)),
        )
    }

    /// Byte stride of one packed element.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl AggregationStrategy for InterleavedAggregation {
    fn max_num_ranges(&self) -> usize {
        self.max_num_ranges
    }

    fn register_resources(&self, aggregate: &BufferAggregate) {
        let mut offset = 0;
        for spec in &self.specs {
            aggregate.add_resource(
                &spec.name,
                spec.format,
                spec.array_size,
                self.usage,
                offset,
                self.stride,
                Arc::clone(&self.store),
            );
            offset += spec.size_bytes();
        }
    }

    fn garbage_collect(&self, aggregate: &BufferAggregate) -> bool {
        let live = aggregate.prune_ranges();
        if live.is_empty() {
            self.store.write().clear();
            self.capacity.store(0, Ordering::Relaxed);
            log::debug!(
                "gc[{}] aggregate `{}` is empty",
                aggregate.gc_perf_token(),
                aggregate.role()
            );
            return true;
        }

        let (offsets, total) = assign_offsets(&live);
        let shifted = live
            .iter()
            .zip(&offsets)
            .any(|(range, &offset)| range.element_offset() != Some(offset));
        let shrunk = total < self.capacity.load(Ordering::Relaxed);
        if !shifted && !shrunk {
            return false;
        }

        let mut new_store = vec![0u8; total * self.stride];
        {
            let src = self.store.read();
            for (range, &new_offset) in live.iter().zip(&offsets) {
                if let Some(old_offset) = range.element_offset() {
                    let copy_n = range.num_elements().min(range.capacity());
                    copy_elements(&src, old_offset, &mut new_store, new_offset, copy_n, self.stride);
                }
            }
        }
        *self.store.write() = new_store;

        for (range, &offset) in live.iter().zip(&offsets) {
            range.set_placement(offset, range.num_elements());
        }
        aggregate.set_range_list(&live);
        self.capacity.store(total, Ordering::Relaxed);
        if shifted {
            aggregate.increment_version();
        }
        log::debug!(
            "gc[{}] aggregate `{}`: compacted {} ranges into {} elements",
            aggregate.gc_perf_token(),
            aggregate.role(),
            live.len(),
            total
        );
        false
    }

    fn reallocate(
        &self,
        aggregate: &BufferAggregate,
        ranges: &[Arc<BufferRange>],
        cur_range_owner: &Arc<BufferAggregate>,
    ) -> AggregationResult<()> {
        let (offsets, total) = assign_offsets(ranges);
        total
            .checked_mul(self.stride)
            .ok_or(AggregationError::CapacityOverflow {
                elements: total,
                stride: self.stride,
            })?;

        // All of the owner's slots alias one store; any of them reaches it.
        let src_res = cur_range_owner
            .resources()
            .into_iter()
            .next()
            .map(|(_, res)| res);
        let any_placed = ranges.iter().any(|range| range.element_offset().is_some());
        if any_placed && self.stride > 0 && src_res.is_none() {
            let name = self.specs.first().map(|s| s.name.clone()).unwrap_or_default();
            return Err(AggregationError::ResourceNotFound(name));
        }

        let mut new_store = vec![0u8; total * self.stride];
        if let Some(src_res) = src_res {
            debug_assert_eq!(
                src_res.stride(),
                self.stride,
                "interleaved migration requires matching layouts"
            );
            let src = src_res.store().read();
            for (range, &new_offset) in ranges.iter().zip(&offsets) {
                if let Some(old_offset) = range.element_offset() {
                    let copy_n = range.num_elements().min(range.capacity());
                    copy_elements(&src, old_offset, &mut new_store, new_offset, copy_n, self.stride);
                }
            }
        }
        *self.store.write() = new_store;

        for (range, &offset) in ranges.iter().zip(&offsets) {
            range.set_placement(offset, range.num_elements());
            range.bind(aggregate.self_weak());
        }
        aggregate.set_range_list(ranges);
        self.capacity.store(total, Ordering::Relaxed);
        aggregate.clear_needs_reallocation();
        aggregate.increment_version();
        log::debug!(
            "aggregate `{}`: reallocated {} ranges, {} elements, stride {}",
            aggregate.role(),
            ranges.len(),
            total,
            self.stride
        );
        Ok(())
    }

    fn max_num_elements(&self, _aggregate: &BufferAggregate) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    fn debug_dump(&self, aggregate: &BufferAggregate, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "BufferAggregate role=`{}` gcToken=`{}` version={} needsReallocation={}",
            aggregate.role(),
            aggregate.gc_perf_token(),
            aggregate.version(),
            aggregate.needs_reallocation()
        )?;
        writeln!(
            f,
            "  strategy=interleaved stride={} maxRanges={} capacity={} elements store={} bytes",
            self.stride,
            self.max_num_ranges,
            self.capacity.load(Ordering::Relaxed),
            self.store.read().len()
        )?;
        dump_ranges(aggregate, f)?;
        for (name, res) in aggregate.resources() {
            writeln!(
                f,
                "  resource `{name}`: {:?}[{}] offset={} stride={}",
                res.format(),
                res.array_size(),
                res.offset(),
                res.stride()
            )?;
        }
        Ok(())
    }
}
