//! # Buffer Aggregation
//!
//! Aggregated GPU buffer allocator: bundles many small per-primitive
//! attribute buffers into fewer, larger backing allocations and hands out
//! sub-ranges of them to independent consumers.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`BufferAggregate`] - A bundle of coherent buffer resources shared
//!   across many primitives
//! - [`BufferRange`] - A consumer's handle to one slice of an aggregate
//! - [`AggregationStrategy`] - Trait for layout strategy implementations
//! - Two layout strategies: [`SeparateAggregation`] (one store per slot)
//!   and [`InterleavedAggregation`] (slots aliasing one store)
//!
//! ## Example
//!
//! ```
//! use buffer_aggregation::{
//!     BufferRange, BufferSpec, BufferUsage, ElementFormat, SeparateAggregation,
//! };
//!
//! let aggregate = SeparateAggregation::new_aggregate(
//!     "vertex",
//!     "meshGc",
//!     vec![BufferSpec::new("points", ElementFormat::Float3)],
//!     BufferUsage::VERTEX,
//!     16,
//! );
//!
//! let range = BufferRange::new(24);
//! assert!(aggregate.try_assign_range(&range));
//!
//! // The layout is dirty until the manager reallocates.
//! assert!(aggregate.needs_reallocation());
//! aggregate.reallocate(&[range.clone()], &aggregate).unwrap();
//! assert_eq!(range.element_offset(), Some(0));
//! ```

pub mod aggregate;
pub mod error;
pub mod range;
pub mod resource;
pub mod strategy;
pub mod types;

// Re-export main types for convenience
pub use aggregate::{AggregationStrategy, BufferAggregate};
pub use error::{AggregationError, AggregationResult};
pub use range::BufferRange;
pub use resource::BufferResource;
pub use strategy::{InterleavedAggregation, SeparateAggregation};
pub use types::{BufferSpec, BufferUsage, ElementFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the aggregation subsystem.
///
/// Optional; only emits a startup log line.
pub fn init() {
    log::info!("buffer-aggregation v{} initialized", VERSION);
}
