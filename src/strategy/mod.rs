//! Layout strategies for buffer aggregates.
//!
//! Each strategy is one layout policy implementing
//! [`AggregationStrategy`](crate::AggregationStrategy):
//!
//! - [`SeparateAggregation`]: one backing store per slot ("VBO split").
//! - [`InterleavedAggregation`]: all slots aliasing one backing store with
//!   a shared struct stride.

mod interleaved;
mod separate;

pub use interleaved::InterleavedAggregation;
pub use separate::SeparateAggregation;

use std::fmt;
use std::sync::Arc;

use crate::aggregate::BufferAggregate;
use crate::range::BufferRange;

/// Pack ranges back to back in list order. Returns the per-range element
/// offsets and the total element count.
pub(crate) fn assign_offsets(ranges: &[Arc<BufferRange>]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(ranges.len());
    let mut next = 0usize;
    for range in ranges {
        offsets.push(next);
        next += range.num_elements();
    }
    (offsets, next)
}

/// Copy `num_elements` whole elements between stores, clamped to what both
/// sides actually hold. A range whose source is shorter than requested (it
/// grew since placement) keeps its copied prefix; the tail stays zeroed.
pub(crate) fn copy_elements(
    src: &[u8],
    src_elem: usize,
    dst: &mut [u8],
    dst_elem: usize,
    num_elements: usize,
    stride: usize,
) {
    if stride == 0 || num_elements == 0 {
        return;
    }
    let src_start = src_elem * stride;
    let dst_start = dst_elem * stride;
    let len = (num_elements * stride)
        .min(src.len().saturating_sub(src_start))
        .min(dst.len().saturating_sub(dst_start));
    let len = len - len % stride;
    if len == 0 {
        return;
    }
    dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
}

/// Shared range dump for strategy `debug_dump` implementations.
pub(crate) fn dump_ranges(aggregate: &BufferAggregate, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut idx = 0;
    while let Some(weak) = aggregate.range(idx) {
        match weak.upgrade() {
            Some(range) => writeln!(
                f,
                "  range[{idx}]: offset={:?} numElements={} capacity={}",
                range.element_offset(),
                range.num_elements(),
                range.capacity()
            )?,
            None => writeln!(f, "  range[{idx}]: <expired>")?,
        }
        idx += 1;
    }
    Ok(())
}
