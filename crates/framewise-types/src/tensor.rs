//! Tensor descriptors and buffers exchanged with inference backends.
//!
//! The core always writes and reads tensor buffers in channel-last (NHWC)
//! order; dims stay in logical (batch, channels, height, width) order and a
//! backend that prefers another memory layout reinterprets on its side.

use std::fmt;

use crate::{FilterError, FilterResult};

/// Marks a tensor dimension whose extent is fixed only at stream
/// configuration time.
pub const DYNAMIC_DIM: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    U8,
}

impl ElementType {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::F32 => "float32",
            ElementType::U8 => "uint8",
        }
    }

    pub fn size_of(self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::U8 => 1,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory order of the tensor buffer. The core only produces `Nhwc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nhwc,
    Nchw,
}

/// Shape and type of one model tensor. Dims are logical
/// (batch, channels, height, width); height and width may be
/// [`DYNAMIC_DIM`] until resolved against the negotiated frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDesc {
    element: ElementType,
    dims: [i64; 4],
    layout: TensorLayout,
}

impl TensorDesc {
    pub fn new(element: ElementType, dims: [i64; 4], layout: TensorLayout) -> Self {
        Self {
            element,
            dims,
            layout,
        }
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn dims(&self) -> [i64; 4] {
        self.dims
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn batch(&self) -> i64 {
        self.dims[0]
    }

    pub fn channels(&self) -> i64 {
        self.dims[1]
    }

    pub fn height(&self) -> i64 {
        self.dims[2]
    }

    pub fn width(&self) -> i64 {
        self.dims[3]
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims[2] < 0 || self.dims[3] < 0
    }

    pub fn with_batch(mut self, batch: i64) -> Self {
        self.dims[0] = batch;
        self
    }

    /// Fill dynamic height/width from the negotiated frame geometry.
    /// Fixed dims are kept as declared.
    pub fn resolved(mut self, height: i64, width: i64) -> Self {
        if self.dims[2] < 0 {
            self.dims[2] = height;
        }
        if self.dims[3] < 0 {
            self.dims[3] = width;
        }
        self
    }

    /// Elements in one batch item (channels x height x width).
    pub fn frame_elements(&self) -> FilterResult<usize> {
        if self.is_dynamic() {
            return Err(FilterError::configuration(
                "tensor shape still has dynamic dimensions",
            ));
        }
        let count = self.dims[1]
            .checked_mul(self.dims[2])
            .and_then(|v| v.checked_mul(self.dims[3]));
        match count {
            Some(value) if value > 0 => Ok(value as usize),
            _ => Err(FilterError::configuration(format!(
                "invalid tensor dims {:?}",
                self.dims
            ))),
        }
    }

    /// Total element count including the batch dimension.
    pub fn element_count(&self) -> FilterResult<usize> {
        let batch = self.dims[0];
        if batch <= 0 {
            return Err(FilterError::configuration(format!(
                "invalid tensor batch {batch}"
            )));
        }
        Ok(self.frame_elements()? * batch as usize)
    }
}

/// Backing storage of one tensor, typed by element.
#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn zeros(element: ElementType, len: usize) -> Self {
        match element {
            ElementType::F32 => TensorData::F32(vec![0.0; len]),
            ElementType::U8 => TensorData::U8(vec![0; len]),
        }
    }

    pub fn element(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::U8(_) => ElementType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::U8(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(values) => Some(values),
            TensorData::U8(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            TensorData::F32(values) => Some(values),
            TensorData::U8(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            TensorData::U8(values) => Some(values),
            TensorData::F32(_) => None,
        }
    }

    pub fn as_u8_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            TensorData::U8(values) => Some(values),
            TensorData::F32(_) => None,
        }
    }
}

/// A descriptor plus its backing buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    desc: TensorDesc,
    data: TensorData,
}

impl Tensor {
    pub fn new(desc: TensorDesc, data: TensorData) -> FilterResult<Self> {
        let expected = desc.element_count()?;
        if data.element() != desc.element() {
            return Err(FilterError::configuration(format!(
                "tensor data is {} but descriptor declares {}",
                data.element(),
                desc.element()
            )));
        }
        if data.len() != expected {
            return Err(FilterError::configuration(format!(
                "tensor data has {} elements, descriptor requires {expected}",
                data.len()
            )));
        }
        Ok(Self { desc, data })
    }

    /// Allocate a zero-filled tensor for a fully resolved descriptor.
    pub fn zeroed(desc: TensorDesc) -> FilterResult<Self> {
        let len = desc.element_count()?;
        Ok(Self {
            desc,
            data: TensorData::zeros(desc.element(), len),
        })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_fills_only_dynamic_dims() {
        let desc = TensorDesc::new(
            ElementType::F32,
            [1, 1, DYNAMIC_DIM, 320],
            TensorLayout::Nhwc,
        );
        let resolved = desc.resolved(240, 999);
        assert_eq!(resolved.dims(), [1, 1, 240, 320]);
        assert!(!resolved.is_dynamic());
    }

    #[test]
    fn element_count_includes_batch() {
        let desc = TensorDesc::new(ElementType::U8, [4, 3, 2, 5], TensorLayout::Nhwc);
        assert_eq!(desc.frame_elements().unwrap(), 30);
        assert_eq!(desc.element_count().unwrap(), 120);
    }

    #[test]
    fn dynamic_desc_refuses_allocation() {
        let desc = TensorDesc::new(
            ElementType::F32,
            [1, 1, DYNAMIC_DIM, DYNAMIC_DIM],
            TensorLayout::Nhwc,
        );
        assert!(Tensor::zeroed(desc).is_err());
    }

    #[test]
    fn tensor_new_checks_len_and_element() {
        let desc = TensorDesc::new(ElementType::U8, [1, 1, 2, 2], TensorLayout::Nhwc);
        assert!(Tensor::new(desc, TensorData::U8(vec![0; 4])).is_ok());
        assert!(Tensor::new(desc, TensorData::U8(vec![0; 3])).is_err());
        assert!(Tensor::new(desc, TensorData::F32(vec![0.0; 4])).is_err());
    }
}
