use crate::pb::tensor_proto::{DataLocation, DataType};
use crate::pb::tensor_shape_proto::{Dimension, dimension};
use crate::pb::*;
use modelport_core::internal::*;

impl TryFrom<DataType> for DatumType {
    type Error = PortError;
    fn try_from(t: DataType) -> PortResult<DatumType> {
        match t {
            DataType::Float => Ok(DatumType::F32),
            DataType::Int64 => Ok(DatumType::I64),
            _ => bail!("Unsupported DatumType {:?}", t),
        }
    }
}

pub fn data_type(dt: DatumType) -> DataType {
    match dt {
        DatumType::F32 => DataType::Float,
        DatumType::I64 => DataType::Int64,
    }
}

pub fn datum_type(elem_type: i32) -> PortResult<DatumType> {
    DataType::from_i32(elem_type).with_context(|| format!("Invalid data type {elem_type}"))?.try_into()
}

fn dims(t: &TensorProto) -> PortResult<Vec<usize>> {
    t.dims
        .iter()
        .map(|&d| {
            ensure!(d >= 0, "Tensor {} has negative dimension {d}", t.name);
            Ok(d as usize)
        })
        .collect()
}

impl TryFrom<&TensorProto> for Tensor {
    type Error = PortError;
    fn try_from(t: &TensorProto) -> PortResult<Tensor> {
        if t.data_location == Some(DataLocation::External as i32) {
            bail!("Tensor {} is stored as external data, which is not supported", t.name);
        }
        let dt = datum_type(t.data_type).with_context(|| format!("Reading tensor {}", t.name))?;
        let shape = dims(t)?;
        if !t.raw_data.is_empty() {
            return Tensor::from_le_bytes(dt, &shape, &t.raw_data);
        }
        match dt {
            DatumType::F32 if !t.double_data.is_empty() => {
                Tensor::from_shape(&shape, t.double_data.iter().map(|&x| x as f32).collect::<Vec<f32>>())
            }
            DatumType::F32 => Tensor::from_shape(&shape, t.float_data.clone()),
            DatumType::I64 if !t.int32_data.is_empty() => {
                Tensor::from_shape(&shape, t.int32_data.iter().map(|&x| x as i64).collect::<Vec<i64>>())
            }
            DatumType::I64 => Tensor::from_shape(&shape, t.int64_data.clone()),
        }
    }
}

/// An initializer holding `tensor`, little-endian in `raw_data`.
pub fn tensor_proto(name: &str, tensor: &Tensor) -> PortResult<TensorProto> {
    Ok(TensorProto {
        name: name.to_string(),
        dims: tensor.shape().iter().map(|&d| d as i64).collect(),
        data_type: data_type(tensor.datum_type()) as i32,
        raw_data: tensor.to_le_bytes()?,
        ..TensorProto::default()
    })
}

pub fn value_info(name: &str, dt: DatumType, shape: &[usize]) -> ValueInfoProto {
    let dim = shape
        .iter()
        .map(|&d| Dimension { value: Some(dimension::Value::DimValue(d as i64)), ..Dimension::default() })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: data_type(dt) as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..TypeProto::default()
        }),
        ..ValueInfoProto::default()
    }
}

pub fn tensor_type(vi: &ValueInfoProto) -> PortResult<&type_proto::Tensor> {
    match vi.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(t)) => Ok(t),
        None => bail!("Value {} has no tensor type", vi.name),
    }
}

/// Declared dimensions of a value, mutable.
pub fn dims_mut(vi: &mut ValueInfoProto) -> PortResult<&mut Vec<Dimension>> {
    let name = vi.name.clone();
    match vi.r#type.as_mut().and_then(|t| t.value.as_mut()) {
        Some(type_proto::Value::TensorType(t)) => {
            Ok(&mut t.shape.get_or_insert_with(TensorShapeProto::default).dim)
        }
        None => bail!("Value {name} has no tensor type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializer_bytes() {
        let t = Tensor::from_shape(&[2, 2], vec![1f32, 2., 3., 4.]).unwrap();
        let proto = tensor_proto("w", &t).unwrap();
        assert_eq!(proto.dims, vec![2, 2]);
        assert_eq!(proto.data_type, DataType::Float as i32);
        assert_eq!(proto.raw_data.len(), 16);
        assert_eq!(Tensor::try_from(&proto).unwrap(), t);
    }

    #[test]
    fn typed_fields() {
        let proto = TensorProto {
            dims: vec![3],
            data_type: DataType::Int64 as i32,
            int64_data: vec![4, 5, 6],
            ..TensorProto::default()
        };
        assert_eq!(Tensor::try_from(&proto).unwrap(), Tensor::vector(&[4i64, 5, 6]));
    }

    #[test]
    fn unsupported_type() {
        let proto = TensorProto { dims: vec![1], data_type: DataType::String as i32, ..TensorProto::default() };
        assert!(Tensor::try_from(&proto).is_err());
    }

    #[test]
    fn declared_shape() {
        let mut vi = value_info("x", DatumType::I64, &[1, 128]);
        assert_eq!(tensor_type(&vi).unwrap().elem_type, DataType::Int64 as i32);
        dims_mut(&mut vi).unwrap()[0].value = Some(dimension::Value::DimParam("batch_size".into()));
        let dims = &tensor_type(&vi).unwrap().shape.as_ref().unwrap().dim;
        assert_eq!(dims[0].value, Some(dimension::Value::DimParam("batch_size".into())));
        assert_eq!(dims[1].value, Some(dimension::Value::DimValue(128)));
    }
}
