//! Dense tensors, as they flow through loading, tracing and serialization.
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::internal::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatumType {
    F32,
    I64,
}

impl DatumType {
    pub fn size_of(&self) -> usize {
        match self {
            DatumType::F32 => 4,
            DatumType::I64 => 8,
        }
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatumType::F32 => write!(f, "F32"),
            DatumType::I64 => write!(f, "I64"),
        }
    }
}

/// Element types a `Tensor` can hold.
pub trait Datum: Copy + Clone + Send + Sync + fmt::Debug + PartialEq + 'static {
    fn datum_type() -> DatumType;
    fn wrap(array: ArrayD<Self>) -> Tensor;
    fn view(tensor: &Tensor) -> Option<&ArrayD<Self>>;
    fn unwrap(tensor: Tensor) -> Option<ArrayD<Self>>;
}

impl Datum for f32 {
    fn datum_type() -> DatumType {
        DatumType::F32
    }

    fn wrap(array: ArrayD<f32>) -> Tensor {
        Tensor::F32(array)
    }

    fn view(tensor: &Tensor) -> Option<&ArrayD<f32>> {
        if let Tensor::F32(a) = tensor { Some(a) } else { None }
    }

    fn unwrap(tensor: Tensor) -> Option<ArrayD<f32>> {
        if let Tensor::F32(a) = tensor { Some(a) } else { None }
    }
}

impl Datum for i64 {
    fn datum_type() -> DatumType {
        DatumType::I64
    }

    fn wrap(array: ArrayD<i64>) -> Tensor {
        Tensor::I64(array)
    }

    fn view(tensor: &Tensor) -> Option<&ArrayD<i64>> {
        if let Tensor::I64(a) = tensor { Some(a) } else { None }
    }

    fn unwrap(tensor: Tensor) -> Option<ArrayD<i64>> {
        if let Tensor::I64(a) = tensor { Some(a) } else { None }
    }
}

/// A dense, row-major tensor.
///
/// Constructors always normalize the underlying array to standard layout, so
/// `as_slice` never fails on a tensor built through this API.
#[derive(Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl Tensor {
    pub fn from_shape<T: Datum>(shape: &[usize], data: Vec<T>) -> PortResult<Tensor> {
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data)
            .with_context(|| format!("Building a tensor of shape {shape:?} from {len} values"))?;
        Ok(T::wrap(array))
    }

    pub fn scalar<T: Datum>(value: T) -> Tensor {
        T::wrap(ndarray::arr0(value).into_dyn())
    }

    /// A rank-1 tensor.
    pub fn vector<T: Datum>(values: &[T]) -> Tensor {
        T::wrap(ndarray::Array1::from(values.to_vec()).into_dyn())
    }

    pub fn zero<T: Datum + Default>(shape: &[usize]) -> Tensor {
        T::wrap(ArrayD::from_elem(IxDyn(shape), T::default()))
    }

    pub fn datum_type(&self) -> DatumType {
        match self {
            Tensor::F32(_) => DatumType::F32,
            Tensor::I64(_) => DatumType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> TVec<usize> {
        let shape = self.shape();
        let mut strides: TVec<usize> = tvec!(1; shape.len());
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn to_array_view<T: Datum>(&self) -> PortResult<ArrayViewD<'_, T>> {
        T::view(self).map(|a| a.view()).ok_or_else(|| {
            format_err!("Tensor is {:?}, accessed as {:?}", self.datum_type(), T::datum_type())
        })
    }

    pub fn as_slice<T: Datum>(&self) -> PortResult<&[T]> {
        let array = T::view(self).ok_or_else(|| {
            format_err!("Tensor is {:?}, accessed as {:?}", self.datum_type(), T::datum_type())
        })?;
        array.as_slice().context("Tensor is not in standard layout")
    }

    pub fn into_array<T: Datum>(self) -> PortResult<ArrayD<T>> {
        let dt = self.datum_type();
        T::unwrap(self)
            .ok_or_else(|| format_err!("Tensor is {:?}, accessed as {:?}", dt, T::datum_type()))
    }

    /// The only element of a single-element tensor.
    pub fn to_scalar<T: Datum>(&self) -> PortResult<T> {
        let view = self.to_array_view::<T>()?;
        ensure!(view.len() == 1, "Expected a single element tensor, got shape {:?}", self.shape());
        view.iter().next().copied().context("Empty tensor")
    }

    pub fn cast_to(&self, dt: DatumType) -> Tensor {
        match (self, dt) {
            (Tensor::F32(a), DatumType::I64) => Tensor::I64(a.mapv(|x| x as i64)),
            (Tensor::I64(a), DatumType::F32) => Tensor::F32(a.mapv(|x| x as f32)),
            _ => self.clone(),
        }
    }

    /// Raw little-endian buffer, row-major.
    pub fn to_le_bytes(&self) -> PortResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.len() * self.datum_type().size_of()];
        match self {
            Tensor::F32(_) => LittleEndian::write_f32_into(self.as_slice::<f32>()?, &mut bytes),
            Tensor::I64(_) => LittleEndian::write_i64_into(self.as_slice::<i64>()?, &mut bytes),
        }
        Ok(bytes)
    }

    pub fn from_le_bytes(dt: DatumType, shape: &[usize], bytes: &[u8]) -> PortResult<Tensor> {
        let len: usize = shape.iter().product();
        ensure!(
            bytes.len() == len * dt.size_of(),
            "Expected {} bytes for a {:?} tensor of shape {:?}, got {}",
            len * dt.size_of(),
            dt,
            shape,
            bytes.len()
        );
        match dt {
            DatumType::F32 => {
                let mut data = vec![0f32; len];
                LittleEndian::read_f32_into(bytes, &mut data);
                Tensor::from_shape(shape, data)
            }
            DatumType::I64 => {
                let mut data = vec![0i64; len];
                LittleEndian::read_i64_into(bytes, &mut data);
                Tensor::from_shape(shape, data)
            }
        }
    }

    /// Largest absolute difference between two tensors of the same shape.
    pub fn max_abs_diff(&self, other: &Tensor) -> PortResult<f32> {
        ensure!(
            self.shape() == other.shape(),
            "Shape mismatch: {:?} vs {:?}",
            self.shape(),
            other.shape()
        );
        let a = self.cast_to(DatumType::F32);
        let b = other.cast_to(DatumType::F32);
        let diff = a
            .as_slice::<f32>()?
            .iter()
            .zip(b.as_slice::<f32>()?)
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        Ok(diff)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let shape = self.shape().iter().join(",");
        if self.len() <= 8 {
            match self {
                Tensor::F32(a) => write!(f, "{shape},F32 {:?}", a.iter().collect::<Vec<_>>()),
                Tensor::I64(a) => write!(f, "{shape},I64 {:?}", a.iter().collect::<Vec<_>>()),
            }
        } else {
            write!(f, "{},{:?}", shape, self.datum_type())
        }
    }
}

impl<T: Datum> From<ArrayD<T>> for Tensor {
    fn from(array: ArrayD<T>) -> Tensor {
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        T::wrap(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        let t = Tensor::zero::<f32>(&[2, 3, 4]);
        assert_eq!(&*t.strides(), &[12, 4, 1]);
        assert_eq!(&*Tensor::scalar(1f32).strides(), &[] as &[usize]);
    }

    #[test]
    fn le_bytes() {
        let t = Tensor::from_shape(&[2], vec![1i64, -2]).unwrap();
        let bytes = t.to_le_bytes().unwrap();
        assert_eq!(bytes, [1, 0, 0, 0, 0, 0, 0, 0, 254, 255, 255, 255, 255, 255, 255, 255]);
        assert_eq!(Tensor::from_le_bytes(DatumType::I64, &[2], &bytes).unwrap(), t);
    }

    #[test]
    fn from_transposed_array_is_standard() {
        let a = ndarray::Array2::from_shape_vec((2, 3), vec![0f32, 1., 2., 3., 4., 5.])
            .unwrap()
            .reversed_axes()
            .into_dyn();
        let t = Tensor::from(a);
        assert_eq!(t.as_slice::<f32>().unwrap(), &[0., 3., 1., 4., 2., 5.]);
    }

    #[test]
    fn wrong_type_access() {
        let t = Tensor::scalar(3i64);
        assert!(t.to_array_view::<f32>().is_err());
        assert_eq!(t.to_scalar::<i64>().unwrap(), 3);
    }
}
