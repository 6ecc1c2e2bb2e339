//! N-way shape broadcast, numpy style.
use crate::internal::*;

/// Computes a shape, if any, to which all shapes can be broadcasted.
pub fn multi_broadcast(shapes: &[impl AsRef<[usize]>]) -> PortResult<TVec<usize>> {
    let Some(len) = shapes.iter().map(|shape| shape.as_ref().len()).max() else {
        return Ok(tvec!());
    };
    let mut shape: TVec<usize> = tvec!();
    for i in 0..len {
        let mut wanted_size = 1;
        for s in shapes {
            let s = s.as_ref();
            let dim = if i < s.len() { s[s.len() - i - 1] } else { 1 };
            wanted_size = match (wanted_size, dim) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                (a, b) => bail!("Can not broadcast {a} against {b} (shapes: {:?})", shapes.iter().map(|s| s.as_ref()).collect::<Vec<_>>()),
            };
        }
        shape.push(wanted_size)
    }
    shape.reverse();
    Ok(shape)
}
