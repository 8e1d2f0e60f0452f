//! Theoretical background.
//!
//! # Contents
//! - [Background](#background)
//! - [Vectorization](#vectorization)
//! - [Stochastic evolution](#stochastic-evolution)
//! - [Adaptive stepping](#adaptive-stepping)
//! - [Gradients](#gradients)
//! - [Batching](#batching)
//!
//! # Background
//! The state of a closed quantum system with Hilbert space dimension *n* is a
//! ket |*ψ*⟩ evolving under the Schrödinger equation
//! ```text
//! d
//! -- |ψ(t)⟩ = -i H(t) |ψ(t)⟩
//! dt
//! ```
//! (with *ħ* = 1) for a Hermitian Hamiltonian *H*(*t*). An open system coupled
//! to a memoryless environment is described instead by a density matrix *ρ*
//! obeying the Lindblad master equation[^1]
//! ```text
//! dρ                    __
//! -- = -i [H, ρ]  +    \    ( L_k ρ L_k† - ½ {L_k† L_k, ρ} )
//! dt                   /_k
//! ```
//! where each *jump operator* *L*<sub>*k*</sub> describes one decay channel.
//! Both are conveniently written in terms of the non-Hermitian generator
//! ```text
//! Hnh = -i H - ½ Σ_k L_k† L_k
//! ```
//! such that the Schrödinger equation is *dψ*/*dt* = Hnh *ψ* (with no jump
//! operators) and the master equation is
//! ```text
//! dρ
//! -- = Hnh ρ + ρ Hnh† + Σ_k L_k ρ L_k†
//! dt
//! ```
//! The right-hand side preserves the trace and positivity of *ρ*, but a naive
//! discretization generally only preserves the trace. The first-order Rouchon
//! scheme[^2] instead writes one step as a Kraus map,
//! ```text
//! M₀ = I + Hnh dt
//! ρ(t + dt) ∝ M₀ ρ M₀† + Σ_k L_k ρ L_k† dt
//! ```
//! which is positive by construction and agrees with the master equation to
//! first order in *dt*; the small trace error is removed by normalization.
//!
//! # Vectorization
//! For a time-independent generator, the master equation is linear in *ρ*
//! and can be solved exactly by exponentiation. Flattening *ρ* row-major into
//! a vector of length *n*², left and right multiplication become
//! ```text
//! A ρ B  ->  (A ⊗ Bᵀ) vec(ρ)
//! ```
//! so that the generator becomes an *n*² × *n*² matrix 𝓛 and
//! ```text
//! vec(ρ(t + Δt)) = exp(𝓛 Δt) vec(ρ(t))
//! ```
//! The exponential is computed with the scaling-and-squaring Padé(13, 13)
//! approximant[^3]; since it depends only on Δ*t*, a uniform grid of save times
//! needs a single exponential. The same matrix form is used to solve the
//! linear system of the backward Euler scheme.
//!
//! # Stochastic evolution
//! If some channels are continuously monitored by a homodyne-type detector
//! with efficiency *η*<sub>*k*</sub> ∊ [0, 1], the state conditioned on the
//! measurement record obeys the diffusive stochastic master equation[^4]
//! ```text
//! dρ = 𝓛(ρ) dt + Σ_k √η_k (L_k ρ + ρ L_k† - tr((L_k + L_k†) ρ) ρ) dW_k
//! ```
//! where the *dW*<sub>*k*</sub> are independent Wiener increments with
//! variance *dt*. The detector signal is
//! ```text
//! dY_k = √η_k tr((L_k + L_k†) ρ) dt + dW_k
//! ```
//! and is white noise around the expectation value; only its time average
//! over a finite interval is meaningful. The measurement record returned by
//! the stochastic solver is therefore
//! ```text
//!              1        tmeas[j+1]
//! I_k[j] = ---------- ∫            dY_k
//!          tmeas[j+1]   tmeas[j]
//!          - tmeas[j]
//! ```
//! The Rouchon scheme extends naturally to this case by adding the measured
//! increments to the Kraus operator,
//! ```text
//! M = I + Hnh dt + Σ_k √η_k dY_k L_k
//! ρ(t + dt) ∝ M ρ M† + Σ_k (1 - η_k) L_k ρ L_k† dt
//! ```
//!
//! # Adaptive stepping
//! The Dormand-Prince method[^5] is a seven-stage explicit Runge-Kutta scheme
//! providing two solutions, of orders 5 and 4, from the same stages; their
//! difference estimates the local error. A step of size *h* is accepted if the
//! RMS error norm, scaled element-wise by *atol* + *rtol* max(|*y*|, |*y*'|),
//! is at most 1, and the next step size is
//! ```text
//! h' = h · clamp(safety · err^(-1/5), min_factor, max_factor)
//! ```
//! The last stage of an accepted step is the first stage of the next one
//! ("first same as last"), so each step costs six evaluations of the
//! right-hand side. States at save times falling inside a step are obtained
//! from the method's fourth-order continuous extension rather than by
//! shortening the step.
//!
//! # Gradients
//! Expectation values at the final time *T* are linear in the initial state:
//! ```text
//! ⟨E⟩(T) = tr(E ρ(T)) = tr(X ρ(0))
//! ```
//! where *X* evolves backward from *X*(*T*) = *E* under the adjoint
//! (Heisenberg-picture) equation
//! ```text
//! dX
//! -- = Hnh† X + X Hnh + Σ_k L_k† X L_k
//! ds
//! ```
//! with *s* = *T* - *t*. One backward sweep per observable therefore gives the
//! full gradient of ⟨*E*⟩(*T*) with respect to the initial state. For kets,
//! ⟨*E*⟩(*T*) = ⟨*ψ*(0)|*X*|*ψ*(0)⟩.
//!
//! # Batching
//! Every argument of a solver may carry leading batch axes. Under cartesian
//! batching all combinations are solved, so a Hamiltonian batch of shape (2)
//! and a state batch of shape (3) produce results with leading shape (2, 3).
//! Under zip batching, elements are paired up and all batched arguments must
//! agree in size. Arguments with a single element never contribute an axis.
//!
//! [^1]: G. Lindblad, "On the generators of quantum dynamical semigroups."
//! Communications in Mathematical Physics **48** 119-130 (1976).
//!
//! [^2]: P. Rouchon and J. F. Ralph, "Efficient quantum filtering for quantum
//! feedback control." Physical Review A **91** 012118 (2015).
//!
//! [^3]: N. J. Higham, "The scaling and squaring method for the matrix
//! exponential revisited." SIAM J. Matrix Anal. Appl. **26** 4 1179-1193
//! (2005).
//!
//! [^4]: H. M. Wiseman and G. J. Milburn, *Quantum Measurement and Control*.
//! Cambridge University Press (2009).
//!
//! [^5]: J. R. Dormand and P. J. Prince, "A family of embedded Runge-Kutta
//! formulae." J. Comp. Appl. Math. **6** 1 19-26 (1980).
