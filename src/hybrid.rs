//! Continuous/discrete hybrid models.
//!
//! A continuous system ([`OdeSystem`]) is embedded into the discrete event
//! loop by wrapping it in a [`Hybrid`] atomic. The wrapper integrates the
//! state vector with a fixed-step solver, locates state events by
//! shrinking the trial step until the first indicator crossing is pinned
//! to tolerance, and schedules time events through the ordinary
//! time-advance mechanism. Discrete transitions of the wrapper drive the
//! system's event handlers, which may edit the state vector
//! discontinuously.
//!
//! The state vector is augmented with one trailing coordinate that
//! integrates simulation time (`dq[time] = 1`), so event conditions may
//! depend on absolute time.

use delegate::delegate;
use serde::{Deserialize, Serialize};

use crate::error::TransitionResult;
use crate::model::{Atomic, Bag};

/// A failure of the continuous subsystem. Surfaced to the host through the
/// wrapper's transition results; engine state stays consistent.
#[derive(Debug, thiserror::Error)]
pub enum ContinuousError {
    /// Error control shrank the integration step below the useful range;
    /// the trajectory is diverging or the tolerance is unattainable.
    #[error("integration step size underflow (h = {h})")]
    StepUnderflow {
        /// The step width at which integration gave up.
        h: f64,
    },
}

/// A system of ordinary differential equations with state and time events.
///
/// All state slices have `num_state_variables() + 1` entries; the last is
/// the time coordinate maintained by the integrator.
pub trait OdeSystem<X>: Send {
    /// Number of continuous state variables, excluding the time
    /// coordinate.
    fn num_state_variables(&self) -> usize;

    /// Number of state event indicators watched by the event locator.
    fn num_event_indicators(&self) -> usize;

    /// Fills the initial state.
    fn init(&mut self, q: &mut [f64]);

    /// Computes the derivative `dq` at state `q`. The time coordinate's
    /// derivative is overwritten by the integrator.
    fn der_func(&self, q: &[f64], dq: &mut [f64]);

    /// Fills `z` with the event indicator values at `q`; an event occurs
    /// where an indicator changes sign.
    fn state_event_func(&self, q: &[f64], z: &mut [f64]);

    /// Time remaining until the next scheduled time event, or
    /// `f64::INFINITY` if none.
    fn time_event_func(&self, q: &[f64]) -> f64;

    /// Discrete action at a state or time event. `events[i]` is set for
    /// each indicator that crossed; a pure time event passes all-false
    /// flags.
    fn internal_event(&mut self, q: &mut [f64], events: &[bool]);

    /// Discrete action on input received between events.
    fn external_event(&mut self, q: &mut [f64], elapsed: f64, xs: &Bag<X>);

    /// Discrete action when an event and input coincide.
    fn confluent_event(&mut self, q: &mut [f64], events: &[bool], xs: &Bag<X>);

    /// Produces discrete output at an event instant.
    fn output_func(&mut self, q: &[f64], events: &[bool], ys: &mut Bag<X>);

    /// Called once after every committed integration step or discrete
    /// event; the attachment point for stateful co-simulation interfaces.
    fn completed_integration_step(&mut self, q: &[f64]) {
        let _ = q;
    }
}

/// Evaluates the derivative and pins the time coordinate's slope to one.
fn derivatives<X>(sys: &dyn OdeSystem<X>, q: &[f64], dq: &mut [f64]) {
    sys.der_func(q, dq);
    let time_idx = dq.len() - 1;
    dq[time_idx] = 1.0;
}

/// A numerical integrator advancing the augmented state vector.
pub trait OdeSolver<X>: Send {
    /// Takes one step of at most `h_lim`, writing the new state into `q`.
    /// Returns the step width actually taken.
    ///
    /// # Errors
    ///
    /// [`ContinuousError::StepUnderflow`] when error control cannot
    /// achieve its tolerance.
    fn integrate(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h_lim: f64,
    ) -> Result<f64, ContinuousError>;

    /// Advances `q` by exactly `h`, taking as many internal steps as
    /// needed.
    ///
    /// # Errors
    ///
    /// [`ContinuousError::StepUnderflow`] when error control cannot
    /// achieve its tolerance.
    fn advance(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h: f64,
    ) -> Result<(), ContinuousError>;
}

/// First-order predictor with a trapezoidal corrector; the difference
/// between the two estimates drives step-size control.
pub struct CorrectedEuler {
    err_tol: f64,
    h_max: f64,
    h_cur: f64,
    k1: Vec<f64>,
    k2: Vec<f64>,
    qe: Vec<f64>,
    qc: Vec<f64>,
}

impl CorrectedEuler {
    /// Creates a solver with the given per-step error tolerance and
    /// maximum step width.
    #[must_use]
    pub fn new(err_tol: f64, h_max: f64) -> Self {
        Self {
            err_tol,
            h_max,
            h_cur: h_max,
            k1: Vec::new(),
            k2: Vec::new(),
            qe: Vec::new(),
            qc: Vec::new(),
        }
    }

    fn ensure_scratch(&mut self, len: usize) {
        self.k1.resize(len, 0.0);
        self.k2.resize(len, 0.0);
        self.qe.resize(len, 0.0);
        self.qc.resize(len, 0.0);
    }

    /// One trial step of width `h`; leaves the corrected state in
    /// `self.qc` and returns the error estimate.
    fn attempt<X>(&mut self, sys: &dyn OdeSystem<X>, q: &[f64], h: f64) -> f64 {
        self.ensure_scratch(q.len());
        derivatives(sys, q, &mut self.k1);
        for i in 0..q.len() {
            self.qe[i] = q[i] + h * self.k1[i];
        }
        derivatives(sys, &self.qe, &mut self.k2);
        let mut err: f64 = 0.0;
        for i in 0..q.len() {
            self.qc[i] = q[i] + 0.5 * h * (self.k1[i] + self.k2[i]);
            err = err.max((self.qc[i] - self.qe[i]).abs());
        }
        err
    }
}

impl<X> OdeSolver<X> for CorrectedEuler {
    fn integrate(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h_lim: f64,
    ) -> Result<f64, ContinuousError> {
        let mut h = self.h_cur.min(h_lim);
        loop {
            let err = self.attempt(sys, q, h);
            if err <= self.err_tol {
                q.copy_from_slice(&self.qc);
                if h < h_lim {
                    // Adapt the working step from an unclipped acceptance.
                    self.h_cur = if err * 4.0 < self.err_tol {
                        (h * 2.0).min(self.h_max)
                    } else {
                        h
                    };
                }
                return Ok(h);
            }
            h *= 0.5;
            if h < self.h_max * 1e-14 {
                return Err(ContinuousError::StepUnderflow { h });
            }
        }
    }

    fn advance(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h: f64,
    ) -> Result<(), ContinuousError> {
        let mut remaining = h;
        while remaining > 0.0 {
            let step = self.integrate(sys, q, remaining)?;
            remaining -= step;
            if remaining <= h * 1e-12 {
                break;
            }
        }
        Ok(())
    }
}

/// The classic fourth-order Runge-Kutta method with a fixed nominal step.
pub struct Rk4 {
    h_max: f64,
    k: [Vec<f64>; 4],
    tmp: Vec<f64>,
}

impl Rk4 {
    /// Creates a solver with the given nominal step width.
    #[must_use]
    pub fn new(h_max: f64) -> Self {
        Self {
            h_max,
            k: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            tmp: Vec::new(),
        }
    }

    fn step<X>(&mut self, sys: &dyn OdeSystem<X>, q: &mut [f64], h: f64) {
        let n = q.len();
        for k in &mut self.k {
            k.resize(n, 0.0);
        }
        self.tmp.resize(n, 0.0);
        derivatives(sys, q, &mut self.k[0]);
        for i in 0..n {
            self.tmp[i] = q[i] + 0.5 * h * self.k[0][i];
        }
        derivatives(sys, &self.tmp, &mut self.k[1]);
        for i in 0..n {
            self.tmp[i] = q[i] + 0.5 * h * self.k[1][i];
        }
        derivatives(sys, &self.tmp, &mut self.k[2]);
        for i in 0..n {
            self.tmp[i] = q[i] + h * self.k[2][i];
        }
        derivatives(sys, &self.tmp, &mut self.k[3]);
        for i in 0..n {
            q[i] += h / 6.0 * (self.k[0][i] + 2.0 * self.k[1][i] + 2.0 * self.k[2][i] + self.k[3][i]);
        }
    }
}

impl<X> OdeSolver<X> for Rk4 {
    fn integrate(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h_lim: f64,
    ) -> Result<f64, ContinuousError> {
        let h = self.h_max.min(h_lim);
        self.step(sys, q, h);
        Ok(h)
    }

    fn advance(
        &mut self,
        sys: &dyn OdeSystem<X>,
        q: &mut [f64],
        h: f64,
    ) -> Result<(), ContinuousError> {
        let mut remaining = h;
        while remaining > 0.0 {
            let step = <Self as OdeSolver<X>>::integrate(self, sys, q, remaining)?;
            remaining -= step;
            if remaining <= h * 1e-12 {
                break;
            }
        }
        Ok(())
    }
}

/// Locates the earliest state event crossing within a trial step.
pub trait EventLocator<X>: Send {
    /// Tests the trial interval from `q_start` to `q_end` of width `h`.
    ///
    /// If an indicator crossed, shrinks the interval until the event time
    /// is pinned to tolerance, writes the state at the event into `q_end`,
    /// sets the flags of the crossing indicators, and returns the reduced
    /// step width. Returns `None` when no indicator crossed.
    ///
    /// # Errors
    ///
    /// Propagates solver failures from probing the interval.
    fn find_events(
        &mut self,
        sys: &dyn OdeSystem<X>,
        solver: &mut dyn OdeSolver<X>,
        events: &mut [bool],
        q_start: &[f64],
        q_end: &mut [f64],
        h: f64,
    ) -> Result<Option<f64>, ContinuousError>;
}

fn sign_change(a: f64, b: f64) -> bool {
    a * b < 0.0 || (a != 0.0 && b == 0.0)
}

fn indicators<X>(sys: &dyn OdeSystem<X>, q: &[f64], z: &mut Vec<f64>) {
    z.resize(sys.num_event_indicators(), 0.0);
    sys.state_event_func(q, z);
}

#[derive(Clone, Copy)]
enum Probe {
    Midpoint,
    Secant,
}

/// Shared shrink loop for the two locator flavors.
#[allow(clippy::too_many_arguments)]
fn locate<X>(
    probe: Probe,
    tol: f64,
    sys: &dyn OdeSystem<X>,
    solver: &mut dyn OdeSolver<X>,
    events: &mut [bool],
    q_start: &[f64],
    q_end: &mut [f64],
    h: f64,
) -> Result<Option<f64>, ContinuousError> {
    if events.is_empty() {
        return Ok(None);
    }
    let mut z_init = Vec::new();
    let mut z_hi = Vec::new();
    indicators(sys, q_start, &mut z_init);
    indicators(sys, q_end, &mut z_hi);
    if !z_init
        .iter()
        .zip(&z_hi)
        .any(|(&a, &b)| sign_change(a, b))
    {
        return Ok(None);
    }

    let mut lo = 0.0;
    let mut hi = h;
    let mut z_lo = z_init.clone();
    let mut q_hi = q_end.to_vec();
    let mut q_mid = Vec::new();
    let mut z_mid = Vec::new();
    while hi - lo > tol {
        let mid = match probe {
            Probe::Midpoint => 0.5 * (lo + hi),
            Probe::Secant => {
                // Interpolate the first crossing indicator linearly;
                // degenerate estimates fall back to the midpoint.
                let crossing = z_lo
                    .iter()
                    .zip(&z_hi)
                    .position(|(&a, &b)| sign_change(a, b))
                    .unwrap_or(0);
                let (za, zb) = (z_lo[crossing], z_hi[crossing]);
                let guess = if (za - zb).abs() > f64::EPSILON {
                    lo + (hi - lo) * za / (za - zb)
                } else {
                    0.5 * (lo + hi)
                };
                if guess <= lo || guess >= hi {
                    0.5 * (lo + hi)
                } else {
                    guess
                }
            }
        };
        q_mid.clear();
        q_mid.extend_from_slice(q_start);
        solver.advance(sys, &mut q_mid, mid)?;
        indicators(sys, &q_mid, &mut z_mid);
        if z_init
            .iter()
            .zip(&z_mid)
            .any(|(&a, &b)| sign_change(a, b))
        {
            hi = mid;
            q_hi.clone_from(&q_mid);
            z_hi.clone_from(&z_mid);
        } else {
            lo = mid;
            z_lo.clone_from(&z_mid);
        }
    }
    for (i, flag) in events.iter_mut().enumerate() {
        *flag = sign_change(z_init[i], z_hi[i]);
    }
    q_end.copy_from_slice(&q_hi);
    Ok(Some(hi))
}

/// Event locator that halves the trial interval.
pub struct BisectionEventLocator {
    tol: f64,
}

impl BisectionEventLocator {
    /// Creates a locator with the given time tolerance.
    #[must_use]
    pub fn new(tol: f64) -> Self {
        Self { tol }
    }
}

impl<X> EventLocator<X> for BisectionEventLocator {
    fn find_events(
        &mut self,
        sys: &dyn OdeSystem<X>,
        solver: &mut dyn OdeSolver<X>,
        events: &mut [bool],
        q_start: &[f64],
        q_end: &mut [f64],
        h: f64,
    ) -> Result<Option<f64>, ContinuousError> {
        locate(
            Probe::Midpoint,
            self.tol,
            sys,
            solver,
            events,
            q_start,
            q_end,
            h,
        )
    }
}

/// Event locator that interpolates the crossing linearly, falling back to
/// bisection on degenerate intervals.
pub struct LinearEventLocator {
    tol: f64,
}

impl LinearEventLocator {
    /// Creates a locator with the given time tolerance.
    #[must_use]
    pub fn new(tol: f64) -> Self {
        Self { tol }
    }
}

impl<X> EventLocator<X> for LinearEventLocator {
    fn find_events(
        &mut self,
        sys: &dyn OdeSystem<X>,
        solver: &mut dyn OdeSolver<X>,
        events: &mut [bool],
        q_start: &[f64],
        q_end: &mut [f64],
        h: f64,
    ) -> Result<Option<f64>, ContinuousError> {
        locate(
            Probe::Secant,
            self.tol,
            sys,
            solver,
            events,
            q_start,
            q_end,
            h,
        )
    }
}

/// The integrator choice, for configuration files.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, strum::EnumString, strum::ToString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// See [`CorrectedEuler`].
    CorrectedEuler,
    /// See [`Rk4`].
    Rk4,
}

/// A continuous system embedded as a single atomic model.
///
/// `ta` is the shorter of the next integrator step and the next time
/// event; output and the three transitions drive the underlying system's
/// event handlers.
pub struct Hybrid<X> {
    sys: Box<dyn OdeSystem<X>>,
    solver: Box<dyn OdeSolver<X>>,
    locator: Box<dyn EventLocator<X>>,
    q: Vec<f64>,
    q_trial: Vec<f64>,
    event_flags: Vec<bool>,
    sigma: f64,
    event_pending: bool,
}

impl<X> Hybrid<X> {
    /// Wraps `sys`, initializes its state, and plans the first step.
    ///
    /// # Errors
    ///
    /// Fails if the very first trial step diverges.
    pub fn new(
        mut sys: Box<dyn OdeSystem<X>>,
        solver: Box<dyn OdeSolver<X>>,
        locator: Box<dyn EventLocator<X>>,
    ) -> Result<Self, ContinuousError> {
        let n = sys.num_state_variables();
        let indicators = sys.num_event_indicators();
        let mut q = vec![0.0; n + 1];
        sys.init(&mut q);
        q[n] = 0.0;
        let mut hybrid = Self {
            sys,
            solver,
            locator,
            q_trial: q.clone(),
            q,
            event_flags: vec![false; indicators],
            sigma: 0.0,
            event_pending: false,
        };
        hybrid.plan_step()?;
        Ok(hybrid)
    }

    /// Wraps `sys` with a named solver and a bisection locator.
    ///
    /// # Errors
    ///
    /// Fails if the very first trial step diverges.
    pub fn with_solver(
        sys: Box<dyn OdeSystem<X>>,
        kind: SolverKind,
        err_tol: f64,
        h_max: f64,
        event_tol: f64,
    ) -> Result<Self, ContinuousError> {
        let solver: Box<dyn OdeSolver<X>> = match kind {
            SolverKind::CorrectedEuler => Box::new(CorrectedEuler::new(err_tol, h_max)),
            SolverKind::Rk4 => Box::new(Rk4::new(h_max)),
        };
        Self::new(sys, solver, Box::new(BisectionEventLocator::new(event_tol)))
    }

    delegate! {
        to self.sys {
            /// Number of continuous state variables, excluding the time
            /// coordinate.
            #[must_use]
            pub fn num_state_variables(&self) -> usize;
            /// Number of state event indicators.
            #[must_use]
            pub fn num_event_indicators(&self) -> usize;
        }
    }

    /// The committed augmented state vector; the last entry is time.
    #[must_use]
    pub fn state(&self) -> &[f64] {
        &self.q
    }

    /// Plan the next tentative step: integrate a trial from the committed
    /// state, bounded by the next time event, then locate state events.
    fn plan_step(&mut self) -> Result<(), ContinuousError> {
        let te = self.sys.time_event_func(&self.q);
        self.q_trial.copy_from_slice(&self.q);
        for flag in &mut self.event_flags {
            *flag = false;
        }
        let h = self
            .solver
            .integrate(self.sys.as_ref(), &mut self.q_trial, te)?;
        let located = self.locator.find_events(
            self.sys.as_ref(),
            self.solver.as_mut(),
            &mut self.event_flags,
            &self.q,
            &mut self.q_trial,
            h,
        )?;
        match located {
            Some(h_event) => {
                self.sigma = h_event;
                self.event_pending = true;
            }
            None => {
                self.sigma = h;
                // A pure time event fires with all-false flags.
                self.event_pending = h >= te;
            }
        }
        Ok(())
    }
}

impl<X: Clone + 'static> Atomic<X> for Hybrid<X> {
    fn ta(&self) -> f64 {
        self.sigma
    }

    fn output_func(&mut self, ys: &mut Bag<X>) -> TransitionResult {
        self.sys.output_func(&self.q_trial, &self.event_flags, ys);
        Ok(())
    }

    fn delta_int(&mut self) -> TransitionResult {
        self.q.copy_from_slice(&self.q_trial);
        if self.event_pending {
            self.sys.internal_event(&mut self.q, &self.event_flags);
        }
        self.sys.completed_integration_step(&self.q);
        self.plan_step()?;
        Ok(())
    }

    fn delta_ext(&mut self, elapsed: f64, xs: &Bag<X>) -> TransitionResult {
        if elapsed > 0.0 {
            self.solver
                .advance(self.sys.as_ref(), &mut self.q, elapsed)?;
        }
        self.sys.external_event(&mut self.q, elapsed, xs);
        self.sys.completed_integration_step(&self.q);
        self.plan_step()?;
        Ok(())
    }

    fn delta_conf(&mut self, xs: &Bag<X>) -> TransitionResult {
        self.q.copy_from_slice(&self.q_trial);
        self.sys.confluent_event(&mut self.q, &self.event_flags, xs);
        self.sys.completed_integration_step(&self.q);
        self.plan_step()?;
        Ok(())
    }
}
