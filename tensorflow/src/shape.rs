//! Shapes with symbolic dimensions, enough to follow a batch axis through
//! the graph.
use std::fmt;

use itertools::Itertools;
use modelport_core::internal::*;

/// A dimension: a positive integer times a product of symbols.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dim {
    coef: usize,
    /// Sorted.
    syms: TVec<String>,
}

impl Dim {
    pub fn known(v: usize) -> Dim {
        Dim { coef: v, syms: tvec!() }
    }

    pub fn sym(name: &str) -> Dim {
        Dim { coef: 1, syms: tvec!(name.to_string()) }
    }

    pub fn as_known(&self) -> Option<usize> {
        if self.syms.is_empty() { Some(self.coef) } else { None }
    }

    pub fn is_one(&self) -> bool {
        self.as_known() == Some(1)
    }

    pub fn mul(&self, other: &Dim) -> Dim {
        let mut syms: TVec<String> = self.syms.iter().chain(other.syms.iter()).cloned().collect();
        syms.sort();
        Dim { coef: self.coef * other.coef, syms }
    }

    /// Exact division, if there is one.
    pub fn div(&self, other: &Dim) -> Option<Dim> {
        if other.coef == 0 || self.coef % other.coef != 0 {
            return None;
        }
        let mut syms = self.syms.clone();
        for s in &other.syms {
            let ix = syms.iter().position(|x| x == s)?;
            syms.remove(ix);
        }
        Some(Dim { coef: self.coef / other.coef, syms })
    }

    /// The dimension as TensorFlow declares it: unknown is `-1`.
    pub fn to_tf(&self) -> i64 {
        self.as_known().map(|v| v as i64).unwrap_or(-1)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.syms.is_empty() {
            return write!(f, "{}", self.coef);
        }
        if self.coef != 1 {
            write!(f, "{}*", self.coef)?;
        }
        write!(f, "{}", self.syms.join("*"))
    }
}

pub fn product<'a>(dims: impl IntoIterator<Item = &'a Dim>) -> Dim {
    dims.into_iter().fold(Dim::known(1), |acc, d| acc.mul(d))
}

/// Datum type and shape of a value.
#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct ValueFact {
    pub datum_type: DatumType,
    pub shape: TVec<Dim>,
}

impl ValueFact {
    pub fn of_tensor(t: &Tensor) -> ValueFact {
        ValueFact::new(t.datum_type(), t.shape().iter().map(|&d| Dim::known(d)).collect())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn with_shape(&self, shape: TVec<Dim>) -> ValueFact {
        ValueFact::new(self.datum_type, shape)
    }

    pub fn tf_shape(&self) -> Vec<i64> {
        self.shape.iter().map(Dim::to_tf).collect()
    }
}

impl fmt::Display for ValueFact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{:?}", self.shape.iter().join(","), self.datum_type)
    }
}

/// Numpy-style broadcasting.
pub fn broadcast(a: &[Dim], b: &[Dim]) -> PortResult<TVec<Dim>> {
    let rank = a.len().max(b.len());
    let one = Dim::known(1);
    let mut shape = tvec!();
    for i in 0..rank {
        let da = if i + a.len() >= rank { &a[i + a.len() - rank] } else { &one };
        let db = if i + b.len() >= rank { &b[i + b.len() - rank] } else { &one };
        let d = if da == db || db.is_one() {
            da.clone()
        } else if da.is_one() {
            db.clone()
        } else {
            bail!("Can not broadcast {} against {}", fmt_shape(a), fmt_shape(b))
        };
        shape.push(d);
    }
    Ok(shape)
}

pub fn fmt_shape(shape: &[Dim]) -> String {
    format!("[{}]", shape.iter().join(","))
}

/// Output shape of an ONNX reshape: `0` copies the input dimension, `-1`
/// takes what is left.
pub fn reshape(input: &[Dim], target: &[i64]) -> PortResult<TVec<Dim>> {
    let mut output: TVec<Option<Dim>> = tvec!();
    for (ix, &t) in target.iter().enumerate() {
        output.push(match t {
            0 => Some(
                input
                    .get(ix)
                    .cloned()
                    .with_context(|| format!("Reshape target {target:?} copies a missing axis {ix}"))?,
            ),
            -1 => None,
            t if t > 0 => Some(Dim::known(t as usize)),
            t => bail!("Invalid reshape dimension {t} in {target:?}"),
        });
    }
    let inferred = output.iter().filter(|d| d.is_none()).count();
    ensure!(inferred <= 1, "Reshape target {target:?} has more than one -1");
    if inferred == 1 {
        let total = product(input);
        let known = product(output.iter().flatten());
        let rest = total.div(&known).with_context(|| {
            format!("Can not reshape {} into {target:?}", fmt_shape(input))
        })?;
        for d in output.iter_mut().filter(|d| d.is_none()) {
            *d = Some(rest.clone());
        }
    }
    let output: TVec<Dim> = output.into_iter().flatten().collect();
    ensure!(
        product(input) == product(&output),
        "Can not reshape {} into {}",
        fmt_shape(input),
        fmt_shape(&output)
    );
    Ok(output)
}

/// A TensorFlow `Reshape` target for `output`: at most one unknown dim.
pub fn tf_reshape_target(output: &[Dim]) -> PortResult<Vec<i64>> {
    let target: Vec<i64> = output.iter().map(Dim::to_tf).collect();
    ensure!(
        target.iter().filter(|&&d| d == -1).count() <= 1,
        "Reshape to {} needs more than one unknown dimension",
        fmt_shape(output)
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b() -> Dim {
        Dim::sym("batch_size")
    }

    fn k(v: usize) -> Dim {
        Dim::known(v)
    }

    #[test]
    fn monomials() {
        let d = b().mul(&k(128));
        assert_eq!(d.to_string(), "128*batch_size");
        assert_eq!(d.div(&k(64)), Some(b().mul(&k(2))));
        assert_eq!(d.div(&b()), Some(k(128)));
        assert_eq!(d.div(&Dim::sym("seq")), None);
        assert_eq!(d.to_tf(), -1);
    }

    #[test]
    fn reshape_copies_and_infers() {
        let input = [b(), k(128), k(32)];
        assert_eq!(reshape(&input, &[0, 0, 4, 8]).unwrap().as_slice(), &[b(), k(128), k(4), k(8)]);
        assert_eq!(reshape(&input, &[-1, 32]).unwrap().as_slice(), &[b().mul(&k(128)), k(32)]);
        assert_eq!(reshape(&input, &[0, -1]).unwrap().as_slice(), &[b(), k(4096)]);
        assert!(reshape(&input, &[-1, -1]).is_err());
        assert!(reshape(&input, &[0, 0, 5]).is_err());
    }

    #[test]
    fn tf_targets() {
        assert_eq!(tf_reshape_target(&[b(), k(128), k(4), k(8)]).unwrap(), vec![-1, 128, 4, 8]);
        assert!(tf_reshape_target(&[b(), Dim::sym("seq"), k(32)]).is_err());
    }

    #[test]
    fn broadcasting() {
        assert_eq!(broadcast(&[b(), k(128), k(32)], &[k(32)]).unwrap().as_slice(), &[b(), k(128), k(32)]);
        assert_eq!(broadcast(&[k(1), k(128), k(32)], &[b(), k(1), k(32)]).unwrap().as_slice(), &[
            b(),
            k(128),
            k(32)
        ]);
        assert!(broadcast(&[b()], &[Dim::sym("seq")]).is_err());
    }
}
