//! Lazy, possibly batched, time-dependent square matrices.
//!
//! A [`TimeOperator`] evaluates to an array of shape `(..., n, n)` at any time
//! `t`, where the leading axes form the operator's *batch shape*. Internally
//! every evaluation is flattened to `(b, n, n)` with `b` the product of the
//! batch shape; see [`TimeOperator::evaluate`].
//!
//! Four forms are available:
//! - *Constant*: a fixed matrix.
//! - *Callable*: an arbitrary function of time.
//! - *Piecewise-constant*: `Σ_j v_j[k] B_j` for `t` in the `k`-th interval of
//!   a breakpoint sequence, plus a static residual.
//! - *Modulated*: `Σ_j f_j(t) B_j` for continuous scalar functions `f_j`, plus
//!   a static residual.
//!
//! Sums of two operators of the same form keep that form. Adding a constant to
//! any operator absorbs it into the static residual (or into the wrapped
//! function). All other mixed sums are promoted to the callable form.
//!
//! Two operators can be combined if their matrix dimensions agree and their
//! batch shapes are either equal or one of them holds a single element.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::atomic::{ AtomicU64, Ordering },
};
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    Matrices,
    config::Precision,
    error::OperatorError,
};

pub type OpResult<T> = Result<T, OperatorError>;

static OPERATOR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique per-instance identifier for a [`TimeOperator`].
///
/// Every constructor and every algebraic operation allocates a fresh ID;
/// clones (and reshapes) keep the ID of their source, since they evaluate to
/// the same values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(u64);

impl OperatorId {
    /// Allocate a fresh ID.
    pub fn next() -> Self {
        Self(OPERATOR_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Form of a [`TimeOperator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorKind {
    Constant,
    Callable,
    PiecewiseConstant,
    Modulated,
}

type ArrayFn = Box<dyn Fn(f64) -> nd::ArrayD<C64>>;

/// Raw description of a time-dependent operator, converted to a
/// [`TimeOperator`] by [`TimeOperator::new`].
pub enum OperatorInput {
    /// Fixed matrix of shape `(..., n, n)`.
    Constant(nd::ArrayD<C64>),
    /// Function returning a matrix of shape `(..., n, n)`; the shape returned
    /// at `t = 0` must hold for all times.
    Callable(ArrayFn),
    /// Function returning factors of shape `(...)` (a zero-dimensional array
    /// for a scalar factor) and a base matrix of shape `(..., n, n)`.
    Modulated(ArrayFn, nd::ArrayD<C64>),
    /// Breakpoints `t_0 < ... < t_m`, values of shape `(..., m)`, and a base
    /// matrix of shape `(..., n, n)`.
    PiecewiseConstant(Vec<f64>, nd::ArrayD<C64>, nd::ArrayD<C64>),
}

impl OperatorInput {
    /// Fixed matrix.
    pub fn constant<S, D>(a: &nd::ArrayBase<S, D>) -> Self
    where
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
    {
        Self::Constant(a.to_owned().into_dyn())
    }

    /// Arbitrary function of time.
    ///
    /// `f` is sampled at `t = 0` to fix the operator's shape, and must return
    /// that same shape at every later time.
    ///
    /// *Panics during evaluation if `f` returns a different shape at a later
    /// time*.
    pub fn callable<F>(f: F) -> Self
    where F: Fn(f64) -> nd::ArrayD<C64> + 'static
    {
        Self::Callable(Box::new(f))
    }

    /// Base matrix multiplied by a scalar function of time.
    pub fn modulated<F, S, D>(f: F, base: &nd::ArrayBase<S, D>) -> Self
    where
        F: Fn(f64) -> C64 + 'static,
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
    {
        Self::Modulated(
            Box::new(move |t| nd::arr0(f(t)).into_dyn()),
            base.to_owned().into_dyn(),
        )
    }

    /// Base matrix multiplied by a batch of functions of time.
    ///
    /// `f` is sampled at `t = 0` to fix the batch shape, and must return that
    /// same shape at every later time.
    pub fn modulated_batch<F, S, D>(f: F, base: &nd::ArrayBase<S, D>) -> Self
    where
        F: Fn(f64) -> nd::ArrayD<C64> + 'static,
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
    {
        Self::Modulated(Box::new(f), base.to_owned().into_dyn())
    }

    /// Base matrix multiplied by piecewise-constant values.
    pub fn pwc<S, D, T, E>(
        times: &[f64],
        values: &nd::ArrayBase<S, D>,
        base: &nd::ArrayBase<T, E>,
    ) -> Self
    where
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
        T: nd::Data<Elem = C64>,
        E: nd::Dimension,
    {
        Self::PiecewiseConstant(
            times.to_vec(),
            values.to_owned().into_dyn(),
            base.to_owned().into_dyn(),
        )
    }
}

impl From<nd::Array2<C64>> for OperatorInput {
    fn from(a: nd::Array2<C64>) -> Self { Self::Constant(a.into_dyn()) }
}

impl From<nd::Array3<C64>> for OperatorInput {
    fn from(a: nd::Array3<C64>) -> Self { Self::Constant(a.into_dyn()) }
}

impl From<nd::ArrayD<C64>> for OperatorInput {
    fn from(a: nd::ArrayD<C64>) -> Self { Self::Constant(a) }
}

type EvalFn = Rc<dyn Fn(f64) -> Matrices>;
type FactorFn = Rc<dyn Fn(f64) -> nd::Array1<C64>>;

// single-slot cache keyed by the exact bits of `t`
type TimeCache = Rc<RefCell<Option<(u64, Rc<Matrices>)>>>;

// keyed by interval index; `None` is outside the breakpoints
type IntervalCache = Rc<RefCell<HashMap<Option<usize>, Rc<Matrices>>>>;

// index into an axis of length 1 or `b`
fn bidx(len: usize, i: usize) -> usize { if len == 1 { 0 } else { i } }

// half-open interval of `times` containing `t`
fn interval(times: &[f64], t: f64) -> Option<usize> {
    let idx = times.partition_point(|tk| *tk <= t);
    (idx > 0 && idx < times.len()).then(|| idx - 1)
}

// sorted union of two strictly increasing sequences
fn merge_times(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut times: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    times.sort_by(|l, r| l.total_cmp(r));
    times.dedup();
    times
}

// broadcast a batch of matrices up to `b` elements
fn expand(a: &Matrices, b: usize) -> Matrices {
    let (ba, n, _) = a.dim();
    if ba == b {
        a.clone()
    } else {
        a.broadcast((b, n, n))
            .expect("batch of a single element always broadcasts")
            .to_owned()
    }
}

// conjugate transpose of every matrix in a batch
fn dagger_batch(a: &Matrices) -> Matrices {
    a.view().permuted_axes([0, 2, 1]).mapv(|z| z.conj())
}

// flatten all leading batch axes of `a` into one
fn flatten_batch(a: &nd::ArrayD<C64>, b: usize, n: usize) -> Matrices {
    nd::Array3::from_shape_vec((b, n, n), a.iter().copied().collect())
        .expect("operator shape changed after construction")
}

// split `(..., n, n)` into the batch shape and `n`
fn split_shape(shape: &[usize]) -> Option<(Vec<usize>, usize)> {
    let ndim = shape.len();
    (ndim >= 2 && shape[ndim - 1] == shape[ndim - 2])
        .then(|| (shape[..ndim - 2].to_vec(), shape[ndim - 1]))
}

// combined batch shape of two operands; shapes must be equal or one of them
// must hold a single element
fn broadcast_batch(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let pl: usize = lhs.iter().product();
    let pr: usize = rhs.iter().product();
    if lhs == rhs || pr == 1 {
        Some(lhs.to_vec())
    } else if pl == 1 {
        Some(rhs.to_vec())
    } else {
        None
    }
}

#[derive(Clone)]
struct PwcTerm {
    times: Rc<[f64]>,
    values: nd::Array2<C64>, // (1 or b, m)
    base: Matrices, // (1 or b, n, n)
}

impl PwcTerm {
    fn add_to(&self, t: f64, out: &mut Matrices) {
        let Some(k) = interval(&self.times, t) else { return; };
        let bv = self.values.nrows();
        let bb = self.base.shape()[0];
        for (i, mut outi) in out.outer_iter_mut().enumerate() {
            outi.scaled_add(
                self.values[[bidx(bv, i), k]],
                &self.base.index_axis(nd::Axis(0), bidx(bb, i)),
            );
        }
    }
}

#[derive(Clone)]
struct ModTerm {
    factor: FactorFn, // (1 or b)
    base: Matrices, // (1 or b, n, n)
}

impl ModTerm {
    fn add_to(&self, t: f64, out: &mut Matrices) {
        let f = (self.factor)(t);
        let bb = self.base.shape()[0];
        for (i, mut outi) in out.outer_iter_mut().enumerate() {
            outi.scaled_add(
                f[bidx(f.len(), i)],
                &self.base.index_axis(nd::Axis(0), bidx(bb, i)),
            );
        }
    }
}

#[derive(Clone)]
enum Repr {
    Constant(Rc<Matrices>),
    Callable {
        f: EvalFn,
        cache: TimeCache,
    },
    Pwc {
        terms: Vec<PwcTerm>,
        times: Rc<[f64]>,
        residual: Matrices,
        cache: IntervalCache,
    },
    Modulated {
        terms: Vec<ModTerm>,
        residual: Matrices,
        cache: TimeCache,
    },
}

impl Repr {
    fn callable<F>(f: F) -> Self
    where F: Fn(f64) -> Matrices + 'static
    {
        Self::Callable { f: Rc::new(f), cache: Rc::default() }
    }

    fn pwc(terms: Vec<PwcTerm>, times: Rc<[f64]>, residual: Matrices) -> Self {
        Self::Pwc { terms, times, residual, cache: Rc::default() }
    }

    fn modulated(terms: Vec<ModTerm>, residual: Matrices) -> Self {
        Self::Modulated { terms, residual, cache: Rc::default() }
    }

    fn kind(&self) -> OperatorKind {
        match self {
            Self::Constant(_) => OperatorKind::Constant,
            Self::Callable { .. } => OperatorKind::Callable,
            Self::Pwc { .. } => OperatorKind::PiecewiseConstant,
            Self::Modulated { .. } => OperatorKind::Modulated,
        }
    }

    // add the constant `c` (already broadcast to the full batch)
    fn absorb(&self, c: Matrices) -> Self {
        match self {
            Self::Constant(a) => Self::Constant(Rc::new(&**a + &c)),
            Self::Callable { f, .. } => {
                let f = Rc::clone(f);
                Self::callable(move |t| f(t) + &c)
            },
            Self::Pwc { terms, times, residual, .. } => {
                Self::pwc(terms.clone(), Rc::clone(times), residual + &c)
            },
            Self::Modulated { terms, residual, .. } => {
                Self::modulated(terms.clone(), residual + &c)
            },
        }
    }
}

fn cached<F>(cache: &TimeCache, t: f64, compute: F) -> Rc<Matrices>
where F: FnOnce() -> Matrices
{
    let key = t.to_bits();
    if let Some((tk, val)) = cache.borrow().as_ref() {
        if *tk == key { return Rc::clone(val); }
    }
    let val = Rc::new(compute());
    *cache.borrow_mut() = Some((key, Rc::clone(&val)));
    val
}

/// A lazy, possibly batched, time-dependent square matrix.
///
/// Cloning is cheap and shares evaluation caches.
#[derive(Clone)]
pub struct TimeOperator {
    id: OperatorId,
    name: String,
    precision: Precision,
    batch_shape: Vec<usize>,
    n: usize,
    repr: Repr,
}

impl fmt::Debug for TimeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeOperator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("precision", &self.precision)
            .field("batch_shape", &self.batch_shape)
            .field("n", &self.n)
            .finish()
    }
}

impl TimeOperator {
    /// Convert an [`OperatorInput`] into an operator named `name`.
    ///
    /// Callable and modulated inputs are evaluated once at `t = 0` to
    /// determine the operator's shape.
    pub fn new(name: &str, input: OperatorInput) -> OpResult<Self> {
        match input {
            OperatorInput::Constant(a) => Self::from_constant(name, a),
            OperatorInput::Callable(f) => Self::from_callable(name, f),
            OperatorInput::Modulated(f, base)
                => Self::from_modulated(name, f, base),
            OperatorInput::PiecewiseConstant(times, values, base)
                => Self::from_pwc(name, times, values, base),
        }
    }

    /// Constant operator.
    pub fn constant<S, D>(name: &str, a: &nd::ArrayBase<S, D>) -> OpResult<Self>
    where
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
    {
        Self::new(name, OperatorInput::constant(a))
    }

    fn build(name: &str, batch_shape: Vec<usize>, n: usize, repr: Repr) -> Self {
        Self {
            id: OperatorId::next(),
            name: name.to_string(),
            precision: Precision::default(),
            batch_shape,
            n,
            repr,
        }
    }

    fn from_constant(name: &str, a: nd::ArrayD<C64>) -> OpResult<Self> {
        let (batch_shape, n) = split_shape(a.shape())
            .ok_or_else(|| {
                OperatorError::NotSquare(name.to_string(), a.shape().to_vec())
            })?;
        let b: usize = batch_shape.iter().product();
        let a = flatten_batch(&a, b, n);
        Ok(Self::build(name, batch_shape, n, Repr::Constant(Rc::new(a))))
    }

    fn from_callable(name: &str, f: ArrayFn) -> OpResult<Self> {
        let a0 = f(0.0);
        let (batch_shape, n) = split_shape(a0.shape())
            .ok_or_else(|| {
                OperatorError::BadFactory {
                    name: name.to_string(),
                    expected: "(..., n, n)".to_string(),
                    got: a0.shape().to_vec(),
                }
            })?;
        let b: usize = batch_shape.iter().product();
        let repr = Repr::callable(move |t| flatten_batch(&f(t), b, n));
        Ok(Self::build(name, batch_shape, n, repr))
    }

    fn from_modulated(name: &str, f: ArrayFn, base: nd::ArrayD<C64>)
        -> OpResult<Self>
    {
        let (base_batch, n) = split_shape(base.shape())
            .ok_or_else(|| {
                OperatorError::NotSquare(name.to_string(), base.shape().to_vec())
            })?;
        let f0 = f(0.0);
        let batch_shape = broadcast_batch(f0.shape(), &base_batch)
            .ok_or_else(|| {
                OperatorError::BadFactory {
                    name: name.to_string(),
                    expected: format!("() or {:?}", base_batch),
                    got: f0.shape().to_vec(),
                }
            })?;
        let b: usize = batch_shape.iter().product();
        let bb: usize = base_batch.iter().product();
        let factor: FactorFn
            = Rc::new(move |t: f64| -> nd::Array1<C64> {
                f(t).iter().copied().collect()
            });
        let term = ModTerm { factor, base: flatten_batch(&base, bb, n) };
        let residual = nd::Array3::zeros((b, n, n));
        Ok(Self::build(name, batch_shape, n, Repr::modulated(vec![term], residual)))
    }

    fn from_pwc(
        name: &str,
        times: Vec<f64>,
        values: nd::ArrayD<C64>,
        base: nd::ArrayD<C64>,
    ) -> OpResult<Self>
    {
        let sorted
            = times.len() >= 2
            && times.iter().all(|tk| tk.is_finite())
            && times.iter().zip(times.iter().skip(1)).all(|(l, r)| r > l);
        sorted.then_some(())
            .ok_or_else(|| OperatorError::BadBreakpoints(name.to_string()))?;
        let m = times.len() - 1;
        let vshape = values.shape();
        let nv = vshape.last().copied().unwrap_or(0);
        (vshape.len() >= 1 && nv == m).then_some(())
            .ok_or_else(|| {
                OperatorError::ValuesLength {
                    name: name.to_string(),
                    breakpoints: times.len(),
                    values: nv,
                }
            })?;
        let (base_batch, n) = split_shape(base.shape())
            .ok_or_else(|| {
                OperatorError::NotSquare(name.to_string(), base.shape().to_vec())
            })?;
        let values_batch = &vshape[..vshape.len() - 1];
        let batch_shape = broadcast_batch(values_batch, &base_batch)
            .ok_or_else(|| {
                OperatorError::ShapeMismatch {
                    lhs: format!("{name} (values)"),
                    lhs_shape: vshape.to_vec(),
                    rhs: format!("{name} (base)"),
                    rhs_shape: base.shape().to_vec(),
                }
            })?;
        let b: usize = batch_shape.iter().product();
        let bv: usize = values_batch.iter().product();
        let bb: usize = base_batch.iter().product();
        let values: nd::Array2<C64>
            = nd::Array2::from_shape_vec((bv, m), values.iter().copied().collect())
            .expect("values shape checked above");
        let times: Rc<[f64]> = times.into();
        let term = PwcTerm {
            times: Rc::clone(&times),
            values,
            base: flatten_batch(&base, bb, n),
        };
        let residual = nd::Array3::zeros((b, n, n));
        Ok(Self::build(name, batch_shape, n, Repr::pwc(vec![term], times, residual)))
    }

    /// Return a copy of `self` under a different name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Return a copy of `self` declaring a different precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn id(&self) -> OperatorId { self.id }

    pub fn name(&self) -> &str { &self.name }

    pub fn kind(&self) -> OperatorKind { self.repr.kind() }

    pub fn precision(&self) -> Precision { self.precision }

    pub fn batch_shape(&self) -> &[usize] { &self.batch_shape }

    /// Number of batch elements, i.e. the product of the batch shape.
    pub fn batch_size(&self) -> usize { self.batch_shape.iter().product() }

    /// Matrix dimension.
    pub fn n(&self) -> usize { self.n }

    /// Full shape `(..., n, n)`.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = self.batch_shape.clone();
        shape.extend([self.n, self.n]);
        shape
    }

    /// Return `true` if `self` does not depend on time.
    pub fn is_constant(&self) -> bool { matches!(self.repr, Repr::Constant(_)) }

    /// Merged breakpoints of a piecewise-constant operator.
    pub fn breakpoints(&self) -> Option<&[f64]> {
        match &self.repr {
            Repr::Pwc { times, .. } => Some(&**times),
            _ => None,
        }
    }

    /// Evaluate at time `t`, returning an array of shape `(b, n, n)` where `b`
    /// is the [batch size][Self::batch_size].
    ///
    /// Repeated evaluation at the same `t` (callable and modulated forms), in
    /// the same interval (piecewise-constant form), or at any time (constant
    /// form) returns the same shared allocation.
    ///
    /// *Panics if a callable input changes the shape of its output after
    /// `t = 0`*.
    pub fn evaluate(&self, t: f64) -> Rc<Matrices> {
        match &self.repr {
            Repr::Constant(a) => Rc::clone(a),
            Repr::Callable { f, cache } => cached(cache, t, || f(t)),
            Repr::Modulated { terms, residual, cache } => {
                cached(cache, t, || {
                    let mut out = residual.clone();
                    terms.iter().for_each(|term| term.add_to(t, &mut out));
                    out
                })
            },
            Repr::Pwc { terms, times, residual, cache } => {
                let k = interval(times, t);
                let mut cache = cache.borrow_mut();
                let val = cache.entry(k)
                    .or_insert_with(|| {
                        let mut out = residual.clone();
                        if let Some(k) = k {
                            // every term is constant over a merged interval
                            let tk = times[k];
                            terms.iter().for_each(|term| term.add_to(tk, &mut out));
                        }
                        Rc::new(out)
                    });
                Rc::clone(val)
            },
        }
    }

    /// Evaluate at time `t`, returning an array of shape `(..., n, n)`.
    pub fn evaluate_full(&self, t: f64) -> nd::ArrayD<C64> {
        let a = self.evaluate(t);
        nd::ArrayD::from_shape_vec(self.shape(), a.iter().copied().collect())
            .expect("evaluation has the operator's shape")
    }

    fn derive(&self, name: String, batch_shape: Vec<usize>, repr: Repr) -> Self {
        Self {
            id: OperatorId::next(),
            name,
            precision: self.precision,
            batch_shape,
            n: self.n,
            repr,
        }
    }

    /// Multiply by a scalar.
    pub fn scale(&self, c: C64) -> Self {
        let repr = match &self.repr {
            Repr::Constant(a) => Repr::Constant(Rc::new(&**a * c)),
            Repr::Callable { f, .. } => {
                let f = Rc::clone(f);
                Repr::callable(move |t| f(t) * c)
            },
            Repr::Pwc { terms, times, residual, .. } => {
                let terms: Vec<PwcTerm>
                    = terms.iter()
                    .map(|term| PwcTerm { values: &term.values * c, ..term.clone() })
                    .collect();
                Repr::pwc(terms, Rc::clone(times), residual * c)
            },
            Repr::Modulated { terms, residual, .. } => {
                let terms: Vec<ModTerm>
                    = terms.iter()
                    .map(|term| ModTerm { base: &term.base * c, ..term.clone() })
                    .collect();
                Repr::modulated(terms, residual * c)
            },
        };
        self.derive(format!("{} * {}", c, self.name), self.batch_shape.clone(), repr)
    }

    /// Multiply by `-1`.
    pub fn negate(&self) -> Self {
        self.scale(-C64::from(1.0)).with_name(&format!("-{}", self.name))
    }

    /// Conjugate transpose.
    pub fn adjoint(&self) -> Self {
        let repr = match &self.repr {
            Repr::Constant(a) => Repr::Constant(Rc::new(dagger_batch(a))),
            Repr::Callable { f, .. } => {
                let f = Rc::clone(f);
                Repr::callable(move |t| dagger_batch(&f(t)))
            },
            Repr::Pwc { terms, times, residual, .. } => {
                let terms: Vec<PwcTerm>
                    = terms.iter()
                    .map(|term| {
                        PwcTerm {
                            times: Rc::clone(&term.times),
                            values: term.values.mapv(|z| z.conj()),
                            base: dagger_batch(&term.base),
                        }
                    })
                    .collect();
                Repr::pwc(terms, Rc::clone(times), dagger_batch(residual))
            },
            Repr::Modulated { terms, residual, .. } => {
                let terms: Vec<ModTerm>
                    = terms.iter()
                    .map(|term| {
                        let f = Rc::clone(&term.factor);
                        ModTerm {
                            factor: Rc::new(move |t| f(t).mapv(|z| z.conj())),
                            base: dagger_batch(&term.base),
                        }
                    })
                    .collect();
                Repr::modulated(terms, dagger_batch(residual))
            },
        };
        self.derive(format!("{}†", self.name), self.batch_shape.clone(), repr)
    }

    fn shape_mismatch(&self, other: &Self) -> OperatorError {
        OperatorError::ShapeMismatch {
            lhs: self.name.clone(),
            lhs_shape: self.shape(),
            rhs: other.name.clone(),
            rhs_shape: other.shape(),
        }
    }

    /// Add another operator.
    ///
    /// Fails if matrix dimensions differ, batch shapes are incompatible, or
    /// the declared precisions differ.
    pub fn add(&self, other: &Self) -> OpResult<Self> {
        (self.n == other.n).then_some(())
            .ok_or_else(|| self.shape_mismatch(other))?;
        let batch_shape
            = broadcast_batch(&self.batch_shape, &other.batch_shape)
            .ok_or_else(|| self.shape_mismatch(other))?;
        (self.precision == other.precision).then_some(())
            .ok_or_else(|| {
                OperatorError::PrecisionMismatch {
                    lhs: self.name.clone(),
                    lhs_precision: self.precision,
                    rhs: other.name.clone(),
                    rhs_precision: other.precision,
                }
            })?;
        let b: usize = batch_shape.iter().product();
        let repr = match (&self.repr, &other.repr) {
            (Repr::Constant(a), _) => other.repr.absorb(expand(a, b)),
            (_, Repr::Constant(c)) => self.repr.absorb(expand(c, b)),
            (
                Repr::Pwc { terms: terms_l, times: times_l, residual: res_l, .. },
                Repr::Pwc { terms: terms_r, times: times_r, residual: res_r, .. },
            ) => {
                let times: Rc<[f64]> = merge_times(times_l, times_r).into();
                let terms: Vec<PwcTerm>
                    = terms_l.iter().chain(terms_r.iter()).cloned().collect();
                Repr::pwc(terms, times, expand(res_l, b) + &expand(res_r, b))
            },
            (
                Repr::Modulated { terms: terms_l, residual: res_l, .. },
                Repr::Modulated { terms: terms_r, residual: res_r, .. },
            ) => {
                let terms: Vec<ModTerm>
                    = terms_l.iter().chain(terms_r.iter()).cloned().collect();
                Repr::modulated(terms, expand(res_l, b) + &expand(res_r, b))
            },
            _ => {
                let lhs = self.clone();
                let rhs = other.clone();
                Repr::callable(move |t| {
                    expand(&lhs.evaluate(t), b) + &expand(&rhs.evaluate(t), b)
                })
            },
        };
        let name = format!("{} + {}", self.name, other.name);
        Ok(self.derive(name, batch_shape, repr))
    }

    /// Add a constant matrix of shape `(..., n, n)`.
    pub fn add_matrix<S, D>(&self, a: &nd::ArrayBase<S, D>) -> OpResult<Self>
    where
        S: nd::Data<Elem = C64>,
        D: nd::Dimension,
    {
        let c = Self::constant("matrix", a)?.with_precision(self.precision);
        self.add(&c)
    }

    /// Subtract another operator.
    pub fn sub(&self, other: &Self) -> OpResult<Self> {
        self.add(&other.negate())
    }

    /// Change the batch shape without changing the number of batch elements.
    ///
    /// The result shares evaluation caches and identity with `self`.
    pub fn reshape(&self, batch_shape: &[usize]) -> OpResult<Self> {
        let size: usize = batch_shape.iter().product();
        (size == self.batch_size()).then_some(())
            .ok_or_else(|| {
                OperatorError::BadReshape {
                    name: self.name.clone(),
                    from: self.batch_shape.clone(),
                    to: batch_shape.to_vec(),
                }
            })?;
        let mut new = self.clone();
        new.batch_shape = batch_shape.to_vec();
        Ok(new)
    }
}
