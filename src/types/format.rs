//! Element formats for aggregated buffer data.

/// Format of a single element stored in a buffer resource slot.
///
/// Covers the scalar and vector types commonly aggregated for per-primitive
/// attribute data (positions, normals, texcoords, packed colors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementFormat {
    /// Single 32-bit float.
    Float,
    /// Two 32-bit floats.
    Float2,
    /// Three 32-bit floats.
    Float3,
    /// Four 32-bit floats.
    Float4,
    /// Single 32-bit signed integer.
    Int,
    /// Two 32-bit signed integers.
    Int2,
    /// Three 32-bit signed integers.
    Int3,
    /// Four 32-bit signed integers.
    Int4,
    /// Single 32-bit unsigned integer.
    Uint,
    /// Two 32-bit unsigned integers.
    Uint2,
    /// Three 32-bit unsigned integers.
    Uint3,
    /// Four 32-bit unsigned integers.
    Uint4,
    /// Four 8-bit unsigned integers (normalized to 0.0-1.0).
    Unorm8x4,
    /// Four 8-bit signed integers (normalized to -1.0-1.0).
    Snorm8x4,
}

impl ElementFormat {
    /// Get the size in bytes of this format.
    pub fn size(&self) -> usize {
        match self {
            Self::Float => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
            Self::Int | Self::Uint => 4,
            Self::Int2 | Self::Uint2 => 8,
            Self::Int3 | Self::Uint3 => 12,
            Self::Int4 | Self::Uint4 => 16,
            Self::Unorm8x4 | Self::Snorm8x4 => 4,
        }
    }

    /// Get the number of components in this format.
    pub fn component_count(&self) -> usize {
        match self {
            Self::Float | Self::Int | Self::Uint => 1,
            Self::Float2 | Self::Int2 | Self::Uint2 => 2,
            Self::Float3 | Self::Int3 | Self::Uint3 => 3,
            Self::Float4 | Self::Int4 | Self::Uint4 => 4,
            Self::Unorm8x4 | Self::Snorm8x4 => 4,
        }
    }
}
