use modelport_core::internal::*;

use crate::tfpb::tensorflow::tensor_shape_proto::Dim;
use crate::tfpb::tensorflow::{DataType, TensorProto, TensorShapeProto};

impl TryFrom<DataType> for DatumType {
    type Error = PortError;
    fn try_from(t: DataType) -> PortResult<DatumType> {
        match t {
            DataType::DtFloat => Ok(DatumType::F32),
            DataType::DtInt64 => Ok(DatumType::I64),
            _ => bail!("Unsupported DatumType {:?}", t),
        }
    }
}

pub fn data_type(dt: DatumType) -> DataType {
    match dt {
        DatumType::F32 => DataType::DtFloat,
        DatumType::I64 => DataType::DtInt64,
    }
}

/// A shape proto; `-1` marks an unknown dimension.
pub fn shape_proto(dims: &[i64]) -> TensorShapeProto {
    TensorShapeProto {
        dim: dims.iter().map(|&size| Dim { size, name: String::new() }).collect(),
        unknown_rank: false,
    }
}

fn tensor_from_repeated_field<T: Datum + Clone>(shape: &[usize], data: Vec<T>) -> PortResult<Tensor> {
    let len: usize = shape.iter().product();
    if data.len() == 1 && len != 1 {
        Tensor::from_shape(shape, vec![data[0].clone(); len])
    } else {
        Tensor::from_shape(shape, data)
    }
}

impl TryFrom<&TensorProto> for Tensor {
    type Error = PortError;
    fn try_from(t: &TensorProto) -> PortResult<Tensor> {
        let shape = t.tensor_shape.as_ref().context("Tensor without shape")?;
        ensure!(shape.dim.iter().all(|d| d.size >= 0), "Tensor with unknown dimensions {:?}", shape.dim);
        let dims: TVec<usize> = shape.dim.iter().map(|d| d.size as usize).collect();
        let dtype = DataType::from_i32(t.dtype).with_context(|| format!("Invalid DataType {}", t.dtype))?;
        let dt = DatumType::try_from(dtype)?;
        if !t.tensor_content.is_empty() {
            return Tensor::from_le_bytes(dt, &dims, &t.tensor_content);
        }
        match dt {
            DatumType::F32 => tensor_from_repeated_field(&dims, t.float_val.to_vec()),
            DatumType::I64 => tensor_from_repeated_field(&dims, t.int64_val.to_vec()),
        }
    }
}

/// Tensor content is stored raw, as TensorFlow does for anything but
/// scalars.
impl TryFrom<&Tensor> for TensorProto {
    type Error = PortError;
    fn try_from(from: &Tensor) -> PortResult<TensorProto> {
        let dims: Vec<i64> = from.shape().iter().map(|&d| d as i64).collect();
        Ok(TensorProto {
            dtype: data_type(from.datum_type()).into(),
            tensor_shape: Some(shape_proto(&dims)),
            tensor_content: from.to_le_bytes()?,
            ..TensorProto::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splat_repeated_field() {
        let proto = TensorProto {
            dtype: DataType::DtFloat.into(),
            tensor_shape: Some(shape_proto(&[2, 2])),
            float_val: vec![1.5],
            ..TensorProto::default()
        };
        assert_eq!(Tensor::try_from(&proto).unwrap(), Tensor::from_shape(&[2, 2], vec![1.5f32; 4]).unwrap());
    }

    #[test]
    fn raw_content() {
        let t = Tensor::from_shape(&[3], vec![1i64, -2, 3]).unwrap();
        let proto = TensorProto::try_from(&t).unwrap();
        assert_eq!(proto.tensor_content.len(), 24);
        assert_eq!(Tensor::try_from(&proto).unwrap(), t);
    }

    #[test]
    fn unknown_dims_are_not_tensors() {
        let proto = TensorProto {
            dtype: DataType::DtFloat.into(),
            tensor_shape: Some(shape_proto(&[-1])),
            ..TensorProto::default()
        };
        assert!(Tensor::try_from(&proto).is_err());
    }
}
