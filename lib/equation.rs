//! Right-hand sides of the equations of motion.
//!
//! All three equations are written in terms of the non-Hermitian generator
//! ```text
//! Hnh = -i H - ½ Σ_k L_k† L_k
//! ```
//! so that
//! ```text
//! Schrödinger:  dψ/dt = Hnh ψ
//! Lindblad:     dρ/dt = Hnh ρ + ρ Hnh† + Σ_k L_k ρ L_k†
//! Heisenberg:   dX/ds = Hnh† X + X Hnh + Σ_k L_k† X L_k,  evaluated at t = T - s
//! ```
//! The Heisenberg (adjoint) equation is integrated forward in the reversed
//! time `s` from `X(s = 0) = E` and yields the operator `X(s = T)` satisfying
//! `tr(X(T) ρ(0)) = tr(E ρ(T))`.

use std::{ cell::{ Cell, RefCell }, rc::Rc };
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    Matrices,
    batch::BatchLayout,
    operator::{ OperatorId, TimeOperator },
    utils::{ spost, spre, sprepost },
};

/// Equation of motion.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EquationKind {
    Schrodinger,
    Lindblad,
    Heisenberg {
        /// Final time of the forward problem.
        t_final: f64,
    },
}

// non-Hermitian generator for every (H, L) batch pair, keyed by the identity of
// the H evaluation it was built from
struct Generator {
    h: Rc<Matrices>,
    hnh: Matrices,
    hnh_dag: Matrices,
}

/// Batched equation of motion over a canonical batch layout.
pub struct MasterEquation {
    kind: EquationKind,
    n: usize,
    h: TimeOperator,
    jump_ops: Vec<Matrices>,
    jump_ops_dag: Vec<Matrices>,
    half_ldl: Matrices,
    bl: usize,
    h_index: Vec<usize>,
    l_index: Vec<usize>,
    generator: RefCell<Option<Rc<Generator>>>,
    superop: RefCell<Option<(Rc<Matrices>, Rc<Matrices>)>>,
    nfev: Cell<usize>,
}

impl MasterEquation {
    /// Build an equation from a generator and a list of jump operators, each
    /// of shape `(bL, n, n)` with a common `bL`.
    pub fn new(
        kind: EquationKind,
        h: TimeOperator,
        jump_ops: Vec<Matrices>,
        layout: &BatchLayout,
    ) -> Self
    {
        let n = h.n();
        let bl = jump_ops.first().map(|l| l.shape()[0]).unwrap_or(1);
        let jump_ops_dag: Vec<Matrices>
            = jump_ops.iter()
            .map(|l| l.view().permuted_axes([0, 2, 1]).mapv(|z| z.conj()))
            .collect();
        let mut half_ldl: Matrices = nd::Array3::zeros((bl, n, n));
        for (l, ldag) in jump_ops.iter().zip(&jump_ops_dag) {
            nd::Zip::from(half_ldl.outer_iter_mut())
                .and(l.outer_iter())
                .and(ldag.outer_iter())
                .for_each(|mut acc, li, ldagi| {
                    acc.scaled_add(C64::from(0.5), &ldagi.dot(&li));
                });
        }
        Self {
            kind,
            n,
            h,
            jump_ops,
            jump_ops_dag,
            half_ldl,
            bl,
            h_index: layout.h_index().to_vec(),
            l_index: layout.l_index().to_vec(),
            generator: RefCell::new(None),
            superop: RefCell::new(None),
            nfev: Cell::new(0),
        }
    }

    pub fn kind(&self) -> EquationKind { self.kind }

    /// Hilbert space dimension.
    pub fn n(&self) -> usize { self.n }

    /// Number of canonical batch elements.
    pub fn len(&self) -> usize { self.h_index.len() }

    pub fn is_empty(&self) -> bool { self.h_index.is_empty() }

    /// ID of the underlying generator operator.
    pub fn h_id(&self) -> OperatorId { self.h.id() }

    /// Number of right-hand side evaluations so far.
    pub fn nfev(&self) -> usize { self.nfev.get() }

    pub fn jump_ops(&self) -> &[Matrices] { &self.jump_ops }

    pub fn jump_ops_dag(&self) -> &[Matrices] { &self.jump_ops_dag }

    /// Generator slot of canonical element `c`.
    pub fn slot(&self, c: usize) -> usize {
        self.h_index[c] * self.bl + self.l_index[c]
    }

    /// Jump operator batch element of canonical element `c`.
    pub fn l_slot(&self, c: usize) -> usize { self.l_index[c] }

    // physical time at which the generator is evaluated
    fn physical_time(&self, t: f64) -> f64 {
        match self.kind {
            EquationKind::Heisenberg { t_final } => t_final - t,
            _ => t,
        }
    }

    fn generator(&self, t: f64) -> Rc<Generator> {
        let h = self.h.evaluate(self.physical_time(t));
        if let Some(cached) = self.generator.borrow().as_ref() {
            if Rc::ptr_eq(&cached.h, &h) { return Rc::clone(cached); }
        }
        let bh = h.shape()[0];
        let n = self.n;
        let mut hnh: Matrices = nd::Array3::zeros((bh * self.bl, n, n));
        for (g, mut hnh_g) in hnh.outer_iter_mut().enumerate() {
            let (ih, il) = (g / self.bl, g % self.bl);
            nd::Zip::from(&mut hnh_g)
                .and(&h.index_axis(nd::Axis(0), ih))
                .and(&self.half_ldl.index_axis(nd::Axis(0), il))
                .for_each(|out, hk, lk| { *out = -C64::i() * hk - lk; });
        }
        let hnh_dag = hnh.view().permuted_axes([0, 2, 1]).mapv(|z| z.conj());
        let generator = Rc::new(Generator { h, hnh, hnh_dag });
        *self.generator.borrow_mut() = Some(Rc::clone(&generator));
        generator
    }

    /// Non-Hermitian generator `Hnh` at time `t`, for every generator slot.
    pub fn hnh(&self, t: f64) -> Matrices { self.generator(t).hnh.clone() }

    /// Evaluate the right-hand side for every canonical element of `y`, an
    /// array of shape `(b, n, m)`.
    pub fn rhs(&self, t: f64, y: &Matrices) -> Matrices {
        self.nfev.set(self.nfev.get() + 1);
        let generator = self.generator(t);
        let mut dy: Matrices = nd::Array3::zeros(y.raw_dim());
        let iter = dy.outer_iter_mut().zip(y.outer_iter()).enumerate();
        for (c, (mut dyc, yc)) in iter {
            let g = self.slot(c);
            let il = self.l_index[c];
            let hnh = generator.hnh.index_axis(nd::Axis(0), g);
            let hnh_dag = generator.hnh_dag.index_axis(nd::Axis(0), g);
            match self.kind {
                EquationKind::Schrodinger => {
                    dyc.assign(&hnh.dot(&yc));
                },
                EquationKind::Lindblad => {
                    dyc.assign(&(hnh.dot(&yc) + yc.dot(&hnh_dag)));
                    for (l, ldag) in self.jump_ops.iter().zip(&self.jump_ops_dag) {
                        let l = l.index_axis(nd::Axis(0), il);
                        let ldag = ldag.index_axis(nd::Axis(0), il);
                        dyc += &l.dot(&yc).dot(&ldag);
                    }
                },
                EquationKind::Heisenberg { .. } => {
                    dyc.assign(&(hnh_dag.dot(&yc) + yc.dot(&hnh)));
                    for (l, ldag) in self.jump_ops.iter().zip(&self.jump_ops_dag) {
                        let l = l.index_axis(nd::Axis(0), il);
                        let ldag = ldag.index_axis(nd::Axis(0), il);
                        dyc += &ldag.dot(&yc).dot(&l);
                    }
                },
            }
        }
        dy
    }

    /// Matrix form of the generator at time `t`, for every generator slot.
    ///
    /// For the Schrödinger equation this is `Hnh` itself (shape `(g, n, n)`);
    /// otherwise it is the superoperator acting on row-major vectorized
    /// matrices (shape `(g, n², n²)`). Repeated calls within a region where the
    /// generator evaluation is shared return the same allocation.
    pub fn superop(&self, t: f64) -> Rc<Matrices> {
        let generator = self.generator(t);
        if let Some((h, s)) = self.superop.borrow().as_ref() {
            if Rc::ptr_eq(h, &generator.h) { return Rc::clone(s); }
        }
        let s = match self.kind {
            EquationKind::Schrodinger => generator.hnh.clone(),
            EquationKind::Lindblad | EquationKind::Heisenberg { .. } => {
                let heisenberg = self.kind != EquationKind::Lindblad;
                let d = self.n * self.n;
                let nslots = generator.hnh.shape()[0];
                let mut s: Matrices = nd::Array3::zeros((nslots, d, d));
                for (g, mut sg) in s.outer_iter_mut().enumerate() {
                    let il = g % self.bl;
                    let hnh = generator.hnh.index_axis(nd::Axis(0), g);
                    let hnh_dag = generator.hnh_dag.index_axis(nd::Axis(0), g);
                    if heisenberg {
                        sg.assign(&(spre(&hnh_dag) + spost(&hnh)));
                    } else {
                        sg.assign(&(spre(&hnh) + spost(&hnh_dag)));
                    }
                    for (l, ldag) in self.jump_ops.iter().zip(&self.jump_ops_dag) {
                        let l = l.index_axis(nd::Axis(0), il);
                        let ldag = ldag.index_axis(nd::Axis(0), il);
                        if heisenberg {
                            sg += &sprepost(&ldag, &l);
                        } else {
                            sg += &sprepost(&l, &ldag);
                        }
                    }
                }
                s
            },
        };
        log::debug!("built {}x{} generator matrices for {} slot(s)",
            s.shape()[1], s.shape()[2], s.shape()[0]);
        let s = Rc::new(s);
        *self.superop.borrow_mut() = Some((Rc::clone(&generator.h), Rc::clone(&s)));
        s
    }

    /// Apply one generator-sized matrix `s` (see [`Self::superop`]) to the
    /// state of a single canonical element.
    pub fn apply<S, T>(&self, s: &nd::ArrayBase<S, nd::Ix2>, y: &nd::ArrayBase<T, nd::Ix2>)
        -> nd::Array2<C64>
    where
        S: nd::Data<Elem = C64>,
        T: nd::Data<Elem = C64>,
    {
        match self.kind {
            EquationKind::Schrodinger => s.dot(y),
            _ => {
                let n = self.n;
                let v: nd::Array1<C64> = y.iter().copied().collect();
                let w = s.dot(&v);
                nd::Array2::from_shape_fn((n, n), |(i, j)| w[i * n + j])
            },
        }
    }
}
