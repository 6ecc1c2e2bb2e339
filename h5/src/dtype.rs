use crate::internal::*;

pub fn name(dt: DatumType) -> &'static str {
    match dt {
        DatumType::F32 => "float32",
        DatumType::I64 => "int64",
    }
}

pub fn parse(s: &str) -> PortResult<DatumType> {
    match s {
        "float32" => Ok(DatumType::F32),
        "int64" => Ok(DatumType::I64),
        _ => bail!("Unknown dtype {s:?}"),
    }
}

pub(crate) mod serde_name {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::*;

    pub fn serialize<S: Serializer>(dt: &DatumType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(name(*dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DatumType, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}
