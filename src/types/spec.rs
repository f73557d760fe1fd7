//! Buffer specs: what a consumer asks an aggregate to provide.

use super::ElementFormat;

/// Description of one logical buffer a consumer needs from an aggregate.
///
/// A spec names the slot, gives its element format, and an optional array
/// size for array-valued attributes (e.g. multiple texcoord sets stored as
/// one slot). The set of specs an aggregate was built from can be
/// reconstructed from a live aggregate via
/// [`BufferAggregate::buffer_specs`](crate::BufferAggregate::buffer_specs),
/// which the aggregation manager uses when splitting buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferSpec {
    /// Slot name, unique within one aggregate.
    pub name: String,
    /// Element format of the slot.
    pub format: ElementFormat,
    /// Number of format-sized entries per element.
    pub array_size: usize,
}

impl BufferSpec {
    /// Create a spec with an array size of 1.
    pub fn new(name: impl Into<String>, format: ElementFormat) -> Self {
        Self {
            name: name.into(),
            format,
            array_size: 1,
        }
    }

    /// Set the array size.
    pub fn with_array_size(mut self, array_size: usize) -> Self {
        self.array_size = array_size;
        self
    }

    /// Size in bytes of one element of this spec.
    pub fn size_bytes(&self) -> usize {
        self.format.size() * self.array_size
    }
}
