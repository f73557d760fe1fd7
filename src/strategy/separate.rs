//! Split layout: one backing store per slot.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregate::{AggregationStrategy, BufferAggregate};
use crate::error::{AggregationError, AggregationResult};
use crate::range::BufferRange;
use crate::types::{BufferSpec, BufferUsage};

use super::{assign_offsets, copy_elements, dump_ranges};

/// Layout strategy giving every spec its own tightly packed backing store
/// (offset 0, stride = element size), the way split vertex buffers keep one
/// buffer per attribute class.
///
/// Ranges occupy the same element span `[offset, offset + num_elements)` in
/// every store, so a single element offset addresses all of a primitive's
/// attributes.
pub struct SeparateAggregation {
    specs: Vec<BufferSpec>,
    usage: BufferUsage,
    max_num_ranges: usize,
    capacity: AtomicUsize,
}

impl SeparateAggregation {
    /// Create the strategy. `max_num_ranges` is the admission ceiling of
    /// the aggregate built on top of it.
    pub fn new(specs: Vec<BufferSpec>, usage: BufferUsage, max_num_ranges: usize) -> Self {
        debug_assert!(specs.iter().all(|s| s.array_size > 0));
        Self {
            specs,
            usage,
            max_num_ranges,
            capacity: AtomicUsize::new(0),
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
}

impl AggregationStrategy for SeparateAggregation {
    fn max_num_ranges(&self) -> usize {
        self.max_num_ranges
    }

    fn register_resources(&self, aggregate: &BufferAggregate) {
        for spec in &self.specs {
            let store = Arc::new(RwLock::new(Vec::new()));
            aggregate.add_resource(
                &spec.name,
                spec.format,
                spec.array_size,
                self.usage,
                0,
                spec.size_bytes(),
                store,
            );
        }
    }

    fn garbage_collect(&self, aggregate: &BufferAggregate) -> bool {
        let live = aggregate.prune_ranges();
        if live.is_empty() {
            for (_, res) in aggregate.resources() {
                res.store().write().clear();
            }
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

        for (_, res) in aggregate.resources() {
            let stride = res.stride();
            let mut new_store = vec![0u8; total * stride];
            {
                let src = res.store().read();
                for (range, &new_offset) in live.iter().zip(&offsets) {
                    if let Some(old_offset) = range.element_offset() {
                        let copy_n = range.num_elements().min(range.capacity());
                        copy_elements(&src, old_offset, &mut new_store, new_offset, copy_n, stride);
                    }
                }
            }
            *res.store().write() = new_store;
        }

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
        let resources = aggregate.resources();
        let any_placed = ranges.iter().any(|range| range.element_offset().is_some());

        // Fail before touching any store.
        for (name, res) in &resources {
            total
                .checked_mul(res.stride())
                .ok_or(AggregationError::CapacityOverflow {
                    elements: total,
                    stride: res.stride(),
                })?;
            if any_placed && cur_range_owner.resource_named(name).is_none() {
                return Err(AggregationError::ResourceNotFound(name.clone()));
            }
        }

        for (name, res) in &resources {
            let stride = res.stride();
            let mut new_store = vec![0u8; total * stride];
            if let Some(src_res) = cur_range_owner.resource_named(name) {
                let src = src_res.store().read();
                for (range, &new_offset) in ranges.iter().zip(&offsets) {
                    if let Some(old_offset) = range.element_offset() {
                        let copy_n = range.num_elements().min(range.capacity());
                        copy_elements(&src, old_offset, &mut new_store, new_offset, copy_n, stride);
                    }
                }
            }
            *res.store().write() = new_store;
        }

        for (range, &offset) in ranges.iter().zip(&offsets) {
            range.set_placement(offset, range.num_elements());
            range.bind(aggregate.self_weak());
        }
        aggregate.set_range_list(ranges);
        self.capacity.store(total, Ordering::Relaxed);
        aggregate.clear_needs_reallocation();
        aggregate.increment_version();
        log::debug!(
            "aggregate `{}`: reallocated {} ranges, {} elements across {} stores",
            aggregate.role(),
            ranges.len(),
            total,
            resources.len()
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
            "  strategy=separate maxRanges={} capacity={} elements",
            self.max_num_ranges,
            self.capacity.load(Ordering::Relaxed)
        )?;
        dump_ranges(aggregate, f)?;
        for (name, res) in aggregate.resources() {
            writeln!(
                f,
                "  resource `{name}`: {:?}[{}] offset={} stride={} store={} bytes",
                res.format(),
                res.array_size(),
                res.offset(),
                res.stride(),
                res.store_len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementFormat;

    fn point_normal_aggregate(max_ranges: usize) -> Arc<BufferAggregate> {
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

    fn admitted(aggregate: &Arc<BufferAggregate>, num_elements: usize) -> Arc<BufferRange> {
        let range = BufferRange::new(num_elements);
        assert!(aggregate.try_assign_range(&range));
        range
    }

    #[test]
    fn test_reallocate_places_ranges() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 10);
        let b = admitted(&aggregate, 20);
        assert!(aggregate.needs_reallocation());

        aggregate
            .reallocate(&[Arc::clone(&a), Arc::clone(&b)], &aggregate)
            .unwrap();

        assert!(!aggregate.needs_reallocation());
        assert_eq!(a.element_offset(), Some(0));
        assert_eq!(b.element_offset(), Some(10));
        assert_eq!(a.capacity(), 10);
        assert_eq!(aggregate.max_num_elements(), 30);
        for (_, res) in aggregate.resources() {
            assert_eq!(res.store_len(), 30 * 12);
        }
    }

    #[test]
    fn test_reallocate_preserves_data_in_place() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 2);
        aggregate.reallocate(&[Arc::clone(&a)], &aggregate).unwrap();

        let points = aggregate.resource_named("points").unwrap();
        points
            .write_slice(a.element_offset().unwrap(), &[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]])
            .unwrap();

        // Admitting another range forces a grow; data must survive.
        let b = admitted(&aggregate, 3);
        aggregate
            .reallocate(&[Arc::clone(&a), Arc::clone(&b)], &aggregate)
            .unwrap();

        let points = aggregate.resource_named("points").unwrap();
        assert_eq!(
            points.read_bytes(a.element_offset().unwrap(), 2).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).to_vec()
        );
    }

    #[test]
    fn test_reallocate_migrates_between_aggregates() {
        let src_aggregate = point_normal_aggregate(4);
        let a = admitted(&src_aggregate, 2);
        let b = admitted(&src_aggregate, 2);
        src_aggregate
            .reallocate(&[Arc::clone(&a), Arc::clone(&b)], &src_aggregate)
            .unwrap();
        let normals = src_aggregate.resource_named("normals").unwrap();
        normals
            .write_slice(b.element_offset().unwrap(), &[[0.0f32, 1.0, 0.0], [1.0, 0.0, 0.0]])
            .unwrap();

        // Migrate only `b` into a fresh aggregate.
        let dst_aggregate = point_normal_aggregate(4);
        dst_aggregate
            .reallocate(&[Arc::clone(&b)], &src_aggregate)
            .unwrap();

        assert!(Arc::ptr_eq(&b.aggregate().unwrap(), &dst_aggregate));
        assert_eq!(b.element_offset(), Some(0));
        let migrated = dst_aggregate.resource_named("normals").unwrap();
        assert_eq!(
            migrated.read_bytes(0, 2).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[0.0, 1.0, 0.0, 1.0, 0.0, 0.0]).to_vec()
        );
    }

    #[test]
    fn test_reallocate_after_grow_keeps_prefix() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 2);
        aggregate.reallocate(&[Arc::clone(&a)], &aggregate).unwrap();
        let points = aggregate.resource_named("points").unwrap();
        points.write_slice(0, &[[1.0f32; 3], [2.0; 3]]).unwrap();

        a.resize(4);
        assert!(aggregate.needs_reallocation());
        aggregate.reallocate(&[Arc::clone(&a)], &aggregate).unwrap();

        let points = aggregate.resource_named("points").unwrap();
        let bytes = points.read_bytes(0, 4).unwrap();
        assert_eq!(
            &bytes[..24],
            bytemuck::cast_slice::<f32, u8>(&[1.0f32, 1.0, 1.0, 2.0, 2.0, 2.0])
        );
        assert_eq!(&bytes[24..], &[0u8; 24]);
    }

    #[test]
    fn test_reallocate_missing_source_slot() {
        let src_aggregate = point_normal_aggregate(4);
        let a = admitted(&src_aggregate, 2);
        src_aggregate.reallocate(&[Arc::clone(&a)], &src_aggregate).unwrap();

        let dst_aggregate = SeparateAggregation::new_aggregate(
            "vertex",
            "meshGc",
            vec![BufferSpec::new("colors", ElementFormat::Unorm8x4)],
            BufferUsage::VERTEX,
            4,
        );
        let err = dst_aggregate
            .reallocate(&[Arc::clone(&a)], &src_aggregate)
            .unwrap_err();
        assert_eq!(err, AggregationError::ResourceNotFound("colors".to_string()));
        // Failed reallocation changes nothing: the range stays with its
        // current owner at its old placement.
        assert!(Arc::ptr_eq(&a.aggregate().unwrap(), &src_aggregate));
        assert_eq!(a.element_offset(), Some(0));
    }

    #[test]
    fn test_gc_compacts_survivors() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 2);
        let b = admitted(&aggregate, 2);
        let c = admitted(&aggregate, 2);
        aggregate
            .reallocate(
                &[Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)],
                &aggregate,
            )
            .unwrap();

        let points = aggregate.resource_named("points").unwrap();
        points.write_slice(0, &[[1.0f32; 3]; 2]).unwrap();
        points.write_slice(2, &[[2.0f32; 3]; 2]).unwrap();
        points.write_slice(4, &[[3.0f32; 3]; 2]).unwrap();

        drop(b);
        let version_before = aggregate.version();
        assert!(!aggregate.garbage_collect());
        assert!(aggregate.version() > version_before);

        // Survivors packed in original relative order, data intact.
        assert_eq!(a.element_offset(), Some(0));
        assert_eq!(c.element_offset(), Some(2));
        assert_eq!(aggregate.max_num_elements(), 4);
        let points = aggregate.resource_named("points").unwrap();
        assert_eq!(points.store_len(), 4 * 12);
        assert_eq!(
            points.read_bytes(2, 2).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[3.0f32; 6]).to_vec()
        );
    }

    #[test]
    fn test_gc_empty_aggregate() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 2);
        aggregate.reallocate(&[Arc::clone(&a)], &aggregate).unwrap();

        drop(a);
        assert!(aggregate.garbage_collect());
        assert_eq!(aggregate.range_count(), 0);
        assert_eq!(aggregate.max_num_elements(), 0);
        for (_, res) in aggregate.resources() {
            assert_eq!(res.store_len(), 0);
        }
    }

    #[test]
    fn test_gc_noop_when_packed() {
        let aggregate = point_normal_aggregate(4);
        let a = admitted(&aggregate, 2);
        let b = admitted(&aggregate, 2);
        aggregate
            .reallocate(&[Arc::clone(&a), Arc::clone(&b)], &aggregate)
            .unwrap();

        let version = aggregate.version();
        assert!(!aggregate.garbage_collect());
        assert_eq!(aggregate.version(), version);
        assert_eq!(a.element_offset(), Some(0));
        assert_eq!(b.element_offset(), Some(2));
    }
}
