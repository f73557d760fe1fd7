//! Buffer resource slots.
//!
//! A [`BufferResource`] describes one named backing buffer of an aggregate:
//! element format, array size, usage flags, and where elements live inside
//! the backing store (byte offset and stride). The store itself is host-side
//! byte storage standing in for the device allocation, shared via `Arc` so
//! interleaved layouts can register several slots aliasing one store.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{AggregationError, AggregationResult};
use crate::types::{BufferUsage, ElementFormat};

/// Backing byte storage for one or more resource slots.
pub(crate) type ByteStore = Arc<RwLock<Vec<u8>>>;

/// One named backing-buffer slot owned by an aggregate.
///
/// Element `i` of this slot occupies `element_size()` bytes starting at
/// `i * stride + offset` within the backing store. Split layouts use
/// `offset == 0` and `stride == element_size()`; interleaved layouts share a
/// store between slots, with `stride` equal to the packed struct size and
/// `offset` the field offset within the struct.
pub struct BufferResource {
    format: ElementFormat,
    array_size: usize,
    usage: BufferUsage,
    offset: usize,
    stride: usize,
    store: ByteStore,
}

impl BufferResource {
    /// Create a new resource slot (called by an aggregate during
    /// construction).
    pub(crate) fn new(
        format: ElementFormat,
        array_size: usize,
        usage: BufferUsage,
        offset: usize,
        stride: usize,
        store: ByteStore,
    ) -> Self {
        debug_assert!(stride >= format.size() * array_size);
        Self {
            format,
            array_size,
            usage,
            offset,
            stride,
            store,
        }
    }

    /// Element format of this slot.
    pub fn format(&self) -> ElementFormat {
        self.format
    }

    /// Number of format-sized entries per element.
    pub fn array_size(&self) -> usize {
        self.array_size
    }

    /// Usage flags of this slot.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Byte offset of element data within one stride.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Byte stride between consecutive elements.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Size in bytes of one element of this slot.
    pub fn element_size(&self) -> usize {
        self.format.size() * self.array_size
    }

    /// Current size of the backing store in bytes.
    pub fn store_len(&self) -> usize {
        self.store.read().len()
    }

    /// The backing store, shared with aliasing slots.
    pub(crate) fn store(&self) -> &ByteStore {
        &self.store
    }

    /// Write consecutive elements starting at `element_index`.
    ///
    /// `data` must be a whole number of elements. Fails if the write would
    /// run past the backing store.
    pub fn write_bytes(&self, element_index: usize, data: &[u8]) -> AggregationResult<()> {
        let elem = self.element_size();
        if elem == 0 || data.len() % elem != 0 {
            return Err(AggregationError::InvalidParameter(format!(
                "write of {} bytes is not a whole number of {elem}-byte elements",
                data.len()
            )));
        }
        let count = data.len() / elem;
        let mut store = self.store.write();
        self.check_bounds(element_index, count, store.len())?;

        if self.offset == 0 && self.stride == elem {
            // Tightly packed slot, single copy.
            let start = element_index * elem;
            store[start..start + data.len()].copy_from_slice(data);
        } else {
            for (i, chunk) in data.chunks_exact(elem).enumerate() {
                let start = (element_index + i) * self.stride + self.offset;
                store[start..start + elem].copy_from_slice(chunk);
            }
        }
        Ok(())
    }

    /// Write consecutive typed elements starting at `element_index`.
    ///
    /// `T` must match the slot's element size exactly.
    pub fn write_slice<T: bytemuck::Pod>(
        &self,
        element_index: usize,
        data: &[T],
    ) -> AggregationResult<()> {
        if std::mem::size_of::<T>() != self.element_size() {
            return Err(AggregationError::InvalidParameter(format!(
                "type of {} bytes does not match element size of {} bytes",
                std::mem::size_of::<T>(),
                self.element_size()
            )));
        }
        self.write_bytes(element_index, bytemuck::cast_slice(data))
    }

    /// Read `num_elements` consecutive elements starting at `element_index`.
    pub fn read_bytes(
        &self,
        element_index: usize,
        num_elements: usize,
    ) -> AggregationResult<Vec<u8>> {
        let elem = self.element_size();
        let store = self.store.read();
        self.check_bounds(element_index, num_elements, store.len())?;

        if self.offset == 0 && self.stride == elem {
            let start = element_index * elem;
            return Ok(store[start..start + num_elements * elem].to_vec());
        }
        let mut out = Vec::with_capacity(num_elements * elem);
        for i in 0..num_elements {
            let start = (element_index + i) * self.stride + self.offset;
            out.extend_from_slice(&store[start..start + elem]);
        }
        Ok(out)
    }

    fn check_bounds(
        &self,
        element_index: usize,
        num_elements: usize,
        store_len: usize,
    ) -> AggregationResult<()> {
        if num_elements == 0 {
            return Ok(());
        }
        let last = element_index
            .checked_add(num_elements - 1)
            .and_then(|i| i.checked_mul(self.stride))
            .and_then(|b| b.checked_add(self.offset))
            .and_then(|b| b.checked_add(self.element_size()))
            .ok_or(AggregationError::CapacityOverflow {
                elements: element_index.saturating_add(num_elements),
                stride: self.stride,
            })?;
        if last > store_len {
            return Err(AggregationError::InvalidParameter(format!(
                "access of elements {element_index}..{} runs past store of {store_len} bytes",
                element_index.saturating_add(num_elements)
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferResource")
            .field("format", &self.format)
            .field("array_size", &self.array_size)
            .field("usage", &self.usage)
            .field("offset", &self.offset)
            .field("stride", &self.stride)
            .field("store_len", &self.store_len())
            .finish()
    }
}

// Resource slots are shared across worker threads during scene population.
static_assertions::assert_impl_all!(BufferResource: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_slot(capacity_elements: usize) -> BufferResource {
        let store = Arc::new(RwLock::new(vec![0u8; capacity_elements * 12]));
        BufferResource::new(
            ElementFormat::Float3,
            1,
            BufferUsage::VERTEX,
            0,
            12,
            store,
        )
    }

    #[test]
    fn test_write_read_roundtrip() {
        let res = packed_slot(4);
        let data: Vec<u8> = (0..24).collect();
        res.write_bytes(1, &data).unwrap();
        assert_eq!(res.read_bytes(1, 2).unwrap(), data);
        // Untouched elements stay zeroed.
        assert_eq!(res.read_bytes(0, 1).unwrap(), vec![0u8; 12]);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let res = packed_slot(2);
        let err = res.write_bytes(1, &[0u8; 24]).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidParameter(_)));
    }

    #[test]
    fn test_write_partial_element() {
        let res = packed_slot(2);
        let err = res.write_bytes(0, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidParameter(_)));
    }

    #[test]
    fn test_interleaved_slot_addressing() {
        // Two slots aliasing one store: float2 at offset 0, float at offset 8,
        // stride 12.
        let store = Arc::new(RwLock::new(vec![0u8; 3 * 12]));
        let a = BufferResource::new(
            ElementFormat::Float2,
            1,
            BufferUsage::VERTEX,
            0,
            12,
            Arc::clone(&store),
        );
        let b = BufferResource::new(ElementFormat::Float, 1, BufferUsage::VERTEX, 8, 12, store);

        a.write_slice(0, &[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]])
            .unwrap();
        b.write_slice(0, &[7.0f32, 8.0, 9.0]).unwrap();

        assert_eq!(
            a.read_bytes(1, 1).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[3.0, 4.0]).to_vec()
        );
        assert_eq!(
            b.read_bytes(1, 1).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&[8.0]).to_vec()
        );
    }

    #[test]
    fn test_write_slice_size_mismatch() {
        let res = packed_slot(2);
        let err = res.write_slice(0, &[1.0f32]).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidParameter(_)));
    }
}
