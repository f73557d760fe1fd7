//! Buffer usage flags.

use bitflags::bitflags;

bitflags! {
    /// Usage flags carried by each resource slot of an aggregate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Slot backs a vertex buffer.
        const VERTEX = 1 << 0;
        /// Slot backs an index buffer.
        const INDEX = 1 << 1;
        /// Slot backs a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Slot backs a storage buffer.
        const STORAGE = 1 << 3;
        /// Slot can be copied from.
        const COPY_SRC = 1 << 4;
        /// Slot can be copied to.
        const COPY_DST = 1 << 5;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}
