//! Aggregation error types.

use thiserror::Error;

/// Errors that can occur while reallocating or accessing aggregated buffers.
///
/// Admission failure (an aggregate out of range slots) is a negative result,
/// not an error; programmer-contract violations such as an ambiguous
/// sole-resource lookup panic instead of returning one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A named resource slot does not exist on the aggregate.
    #[error("resource slot `{0}` not found")]
    ResourceNotFound(String),
    /// Sizing a backing store overflowed the addressable byte range.
    #[error("byte size overflow sizing {elements} elements with stride {stride}")]
    CapacityOverflow {
        /// Requested total element count.
        elements: usize,
        /// Byte stride of the store being sized.
        stride: usize,
    },
}

/// Result alias for aggregation operations.
pub type AggregationResult<T> = Result<T, AggregationError>;
