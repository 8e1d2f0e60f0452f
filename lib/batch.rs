//! Reconciliation of independent batch axes.
//!
//! Every solver input (generator, jump operators, initial state) carries its
//! own batch shape, and the stochastic solver additionally runs a number of
//! trajectories. A [`BatchLayout`] maps these onto one flat *canonical* batch
//! axis over which the integrators loop, and records the user-facing batch
//! shape the results are restored to afterwards.
//!
//! Under [`Batching::Cartesian`] the canonical axis is the row-major flattening
//! of `(bH, by)`, `(bH, bL, by)`, or `(bH, bL, by, ntrajs)`. Under
//! [`Batching::Zip`] it is `(b)` or `(b, ntrajs)`, with `b` the unique
//! common size among the inputs holding more than one element. In both cases,
//! inputs holding a single element contribute no axis to the restored shape,
//! while the trajectory axis is always kept.

use ndarray as nd;
use crate::{
    config::Batching,
    error::ValidationError,
};

/// Named batch shape of a single solver argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchArg {
    pub name: String,
    pub shape: Vec<usize>,
}

impl BatchArg {
    pub fn new(name: &str, shape: &[usize]) -> Self {
        Self { name: name.to_string(), shape: shape.to_vec() }
    }

    /// Number of batch elements.
    pub fn size(&self) -> usize { self.shape.iter().product() }
}

/// Batch sizes of all solver arguments, along with the batching policy.
#[derive(Clone, Debug)]
pub struct BatchSpec {
    /// Generator.
    pub h: BatchArg,
    /// Jump operators, for the Lindblad and stochastic families.
    pub l: Option<BatchArg>,
    /// Initial state.
    pub y: BatchArg,
    /// Number of stochastic trajectories, for the stochastic family.
    pub ntrajs: Option<usize>,
    /// Batching policy.
    pub policy: Batching,
}

/// Canonical batch layout, along with per-argument index maps.
#[derive(Clone, Debug)]
pub struct BatchLayout {
    policy: Batching,
    sizes: Vec<usize>,
    out_shape: Vec<usize>,
    h_index: Vec<usize>,
    l_index: Vec<usize>,
    y_index: Vec<usize>,
}

// unravel a row-major flat index over `sizes`
fn unravel(mut idx: usize, sizes: &[usize]) -> Vec<usize> {
    let mut out = vec![0; sizes.len()];
    for (k, size) in sizes.iter().enumerate().rev() {
        out[k] = idx % size;
        idx /= size;
    }
    out
}

impl BatchLayout {
    /// Compute the canonical layout for a set of arguments.
    ///
    /// Fails under [`Batching::Zip`] if two arguments holding more than one
    /// element disagree in size.
    pub fn new(spec: &BatchSpec) -> Result<Self, ValidationError> {
        match spec.policy {
            Batching::Cartesian => Ok(Self::cartesian(spec)),
            Batching::Zip => Self::zip(spec),
        }
    }

    fn cartesian(spec: &BatchSpec) -> Self {
        let args: Vec<&BatchArg>
            = [Some(&spec.h), spec.l.as_ref(), Some(&spec.y)]
            .into_iter()
            .flatten()
            .collect();
        let mut sizes: Vec<usize> = args.iter().map(|arg| arg.size()).collect();
        let mut out_shape: Vec<usize>
            = args.iter()
            .filter(|arg| arg.size() != 1)
            .flat_map(|arg| arg.shape.iter().copied())
            .collect();
        if let Some(ntrajs) = spec.ntrajs {
            sizes.push(ntrajs);
            out_shape.push(ntrajs);
        }
        let total: usize = sizes.iter().product();
        let (mut h_index, mut l_index, mut y_index)
            = (Vec::with_capacity(total), Vec::with_capacity(total), Vec::with_capacity(total));
        let y_axis = if spec.l.is_some() { 2 } else { 1 };
        for c in 0..total {
            let idx = unravel(c, &sizes);
            h_index.push(idx[0]);
            l_index.push(if spec.l.is_some() { idx[1] } else { 0 });
            y_index.push(idx[y_axis]);
        }
        Self { policy: Batching::Cartesian, sizes, out_shape, h_index, l_index, y_index }
    }

    fn zip(spec: &BatchSpec) -> Result<Self, ValidationError> {
        let args: Vec<&BatchArg>
            = [Some(&spec.h), spec.l.as_ref(), Some(&spec.y)]
            .into_iter()
            .flatten()
            .collect();
        let nontrivial: Vec<&&BatchArg>
            = args.iter().filter(|arg| arg.size() != 1).collect();
        let b = nontrivial.first().map(|arg| arg.size()).unwrap_or(1);
        if nontrivial.iter().any(|arg| arg.size() != b) {
            let sizes: Vec<String>
                = args.iter()
                .map(|arg| format!("`{}` batch size {}", arg.name, arg.size()))
                .collect();
            return Err(ValidationError::BatchMismatch(sizes.join(", ")));
        }
        let mut sizes = vec![b];
        let mut out_shape: Vec<usize>
            = nontrivial.first().map(|arg| arg.shape.clone()).unwrap_or_default();
        let ntrajs = spec.ntrajs.unwrap_or(1);
        if let Some(ntrajs) = spec.ntrajs {
            sizes.push(ntrajs);
            out_shape.push(ntrajs);
        }
        let index = |size: usize| -> Vec<usize> {
            (0..b * ntrajs)
                .map(|c| if size == 1 { 0 } else { c / ntrajs })
                .collect()
        };
        let h_index = index(spec.h.size());
        let l_index = index(spec.l.as_ref().map(|l| l.size()).unwrap_or(1));
        let y_index = index(spec.y.size());
        Ok(Self { policy: Batching::Zip, sizes, out_shape, h_index, l_index, y_index })
    }

    pub fn policy(&self) -> Batching { self.policy }

    /// Sizes of the canonical axes before flattening.
    pub fn sizes(&self) -> &[usize] { &self.sizes }

    /// Batch shape of the returned results.
    pub fn out_shape(&self) -> &[usize] { &self.out_shape }

    /// Total number of canonical batch elements.
    pub fn len(&self) -> usize { self.h_index.len() }

    /// Return `true` if the layout holds no elements.
    pub fn is_empty(&self) -> bool { self.h_index.is_empty() }

    /// Generator batch element for each canonical element.
    pub fn h_index(&self) -> &[usize] { &self.h_index }

    /// Jump operator batch element for each canonical element.
    pub fn l_index(&self) -> &[usize] { &self.l_index }

    /// Initial state batch element for each canonical element.
    pub fn y_index(&self) -> &[usize] { &self.y_index }

    /// Gather the initial states of every canonical element from a batch of
    /// per-argument states `(by, n, m)`.
    pub fn gather<A>(&self, y: &nd::Array3<A>) -> nd::Array3<A>
    where A: Clone
    {
        y.select(nd::Axis(0), &self.y_index)
    }

    /// Restore the user-facing batch shape of an array whose leading axis is
    /// the canonical batch axis.
    ///
    /// *Panics if the leading axis does not have length [`Self::len`]*.
    pub fn restore<A>(&self, a: nd::ArrayD<A>) -> nd::ArrayD<A>
    where A: Clone
    {
        assert_eq!(a.shape()[0], self.len(), "leading axis must be the canonical batch");
        let shape: Vec<usize>
            = self.out_shape.iter()
            .chain(a.shape()[1..].iter())
            .copied()
            .collect();
        nd::ArrayD::from_shape_vec(shape, a.iter().cloned().collect())
            .expect("restored shape holds the same number of elements")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(h: &[usize], l: Option<&[usize]>, y: &[usize], ntrajs: Option<usize>, policy: Batching)
        -> BatchSpec
    {
        BatchSpec {
            h: BatchArg::new("H", h),
            l: l.map(|l| BatchArg::new("jump_ops", l)),
            y: BatchArg::new("rho0", y),
            ntrajs,
            policy,
        }
    }

    #[test]
    fn cartesian_unitary() {
        let layout = BatchLayout::new(&spec(&[2], None, &[3], None, Batching::Cartesian))
            .unwrap();
        assert_eq!(layout.out_shape(), &[2, 3]);
        assert_eq!(layout.len(), 6);
        assert_eq!(layout.h_index(), &[0, 0, 0, 1, 1, 1]);
        assert_eq!(layout.y_index(), &[0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn cartesian_squeezes_trivial_axes() {
        let layout = BatchLayout::new(
            &spec(&[], Some(&[]), &[2, 2], Some(5), Batching::Cartesian)).unwrap();
        assert_eq!(layout.sizes(), &[1, 1, 4, 5]);
        assert_eq!(layout.out_shape(), &[2, 2, 5]);
        assert_eq!(layout.y_index()[5], 1);
        let layout = BatchLayout::new(
            &spec(&[], Some(&[]), &[], Some(1), Batching::Cartesian)).unwrap();
        assert_eq!(layout.out_shape(), &[1]);
    }

    #[test]
    fn zip_matching() {
        let layout = BatchLayout::new(&spec(&[3], None, &[3], None, Batching::Zip))
            .unwrap();
        assert_eq!(layout.out_shape(), &[3]);
        assert_eq!(layout.h_index(), &[0, 1, 2]);
        let layout = BatchLayout::new(
            &spec(&[], Some(&[3]), &[3], Some(2), Batching::Zip)).unwrap();
        assert_eq!(layout.out_shape(), &[3, 2]);
        assert_eq!(layout.h_index(), &[0; 6]);
        assert_eq!(layout.l_index(), &[0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn zip_mismatch() {
        let err = BatchLayout::new(&spec(&[2], None, &[3], None, Batching::Zip))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("`H` batch size 2"));
        assert!(msg.contains("`rho0` batch size 3"));
    }

    #[test]
    fn restore_shape() {
        let layout = BatchLayout::new(&spec(&[2], None, &[3], None, Batching::Cartesian))
            .unwrap();
        let a = nd::ArrayD::from_shape_fn(vec![6, 4], |idx| idx[0] * 10 + idx[1]);
        let r = layout.restore(a);
        assert_eq!(r.shape(), &[2, 3, 4]);
        assert_eq!(r[[1, 2, 3]], 53);
    }
}
