//! The super-dense simulation clock.
//!
//! A [`Time`] pairs a real-valued instant `t` with a micro-step counter `c`.
//! Transitions that occur at the same real instant are totally ordered by
//! `c`, so causality never depends on real-time ties. The real field is any
//! type implementing [`TimeValue`]; [`f64`] is the default, and [`Fcmp64`]
//! compares through a configurable epsilon for models that accumulate
//! floating-point noise.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// The real field of the simulation clock.
///
/// Implementations must form a totally ordered additive group over the
/// finite values, with a distinguished infinity sentinel. `NaN`-like values
/// must never be produced by a model; comparisons against them abort the
/// simulation.
pub trait TimeValue:
    Copy + PartialOrd + PartialEq + Add<Output = Self> + Sub<Output = Self> + fmt::Debug + 'static
{
    /// The additive identity.
    fn zero() -> Self;

    /// The infinity sentinel denoting a passive model.
    fn infinity() -> Self;

    /// Returns `true` unless this is the infinity sentinel.
    fn is_finite(self) -> bool {
        self < Self::infinity()
    }
}

impl TimeValue for f64 {
    fn zero() -> Self {
        0.0
    }

    fn infinity() -> Self {
        f64::INFINITY
    }
}

/// A point on the super-dense simulation clock.
///
/// Order is lexicographic on `(t, c)`. The advance operator is neither
/// commutative nor associative: adding a zero-width advance bumps only the
/// micro-step counter, while any positive advance resets it.
///
/// ```
/// use devsim::Time;
///
/// let t = Time::new(1.0, 3);
/// assert_eq!(t.advance(Time::new(0.0, 2)), Time::new(1.0, 5));
/// assert_eq!(t.advance(Time::new(0.5, 7)), Time::new(1.5, 0));
/// assert!(t < Time::<f64>::infinity());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Time<T = f64> {
    /// The real instant.
    pub t: T,
    /// The micro-step counter.
    pub c: u32,
}

impl<T: TimeValue> Time<T> {
    /// Creates a time from its real and micro-step parts.
    pub fn new(t: T, c: u32) -> Self {
        Self { t, c }
    }

    /// A time at real instant `t` with a zero micro-step counter.
    pub fn real(t: T) -> Self {
        Self { t, c: 0 }
    }

    /// The origin `(0, 0)`.
    pub fn zero() -> Self {
        Self::real(T::zero())
    }

    /// The infinity sentinel `(∞, 0)`.
    pub fn infinity() -> Self {
        Self::real(T::infinity())
    }

    /// Returns `true` if the real part is the infinity sentinel.
    pub fn is_infinite(self) -> bool {
        !self.t.is_finite()
    }

    /// The advance operator.
    ///
    /// `(t₁,c₁) + (0,c₂) = (t₁,c₁+c₂)` and `(t₁,c₁) + (dt>0,_) = (t₁+dt,0)`.
    #[must_use]
    pub fn advance(self, by: Time<T>) -> Self {
        if by.t == T::zero() {
            Self::new(self.t, self.c + by.c)
        } else {
            Self::new(self.t + by.t, 0)
        }
    }

    /// The next micro-step at the same real instant, i.e. `self + (0, 1)`.
    #[must_use]
    pub fn after_epsilon(self) -> Self {
        Self::new(self.t, self.c + 1)
    }

    /// Real-valued interval elapsed since `earlier`.
    #[must_use]
    pub fn elapsed_since(self, earlier: Time<T>) -> T {
        self.t - earlier.t
    }

    /// Total order used by the schedule.
    ///
    /// # Panics
    ///
    /// Panics if the real parts are incomparable; a model produced a NaN
    /// time advance, which is a programming error.
    pub(crate) fn cmp_total(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .expect("simulation times must be comparable")
    }

    pub(crate) fn min(self, other: Self) -> Self {
        if other < self {
            other
        } else {
            self
        }
    }
}

impl<T: TimeValue> PartialEq for Time<T> {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.c == other.c
    }
}

impl<T: TimeValue> PartialOrd for Time<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.t.partial_cmp(&other.t)? {
            Ordering::Equal => Some(self.c.cmp(&other.c)),
            ord => Some(ord),
        }
    }
}

impl<T: TimeValue + fmt::Display> fmt::Display for Time<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.t, self.c)
    }
}

/// Epsilon used by [`Fcmp64`] comparisons, stored as raw bits.
static FCMP_EPSILON: AtomicU64 = AtomicU64::new(0x3D71_9799_812D_EA11); // 1e-12

/// Sets the relative epsilon used by all [`Fcmp64`] comparisons.
pub fn set_fcmp_epsilon(epsilon: f64) {
    FCMP_EPSILON.store(epsilon.to_bits(), AtomicOrdering::Relaxed);
}

/// Returns the relative epsilon used by [`Fcmp64`] comparisons.
#[must_use]
pub fn fcmp_epsilon() -> f64 {
    f64::from_bits(FCMP_EPSILON.load(AtomicOrdering::Relaxed))
}

/// Compares two floats within a neighborhood scaled by the magnitude of the
/// larger operand, following Belding's `fcmp`.
fn fcmp(x1: f64, x2: f64, epsilon: f64) -> Ordering {
    let magnitude = x1.abs().max(x2.abs());
    // frexp exponent: x = m * 2^e with 0.5 <= |m| < 1
    let exponent = if magnitude == 0.0 {
        0
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let e = magnitude.log2().floor() as i32 + 1;
        e
    };
    let delta = epsilon * f64::powi(2.0, exponent);
    let difference = x1 - x2;
    if difference > delta {
        Ordering::Greater
    } else if difference < -delta {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// A real clock value whose comparisons tolerate floating-point noise.
///
/// Two values closer than the configured relative epsilon (see
/// [`set_fcmp_epsilon`]) compare equal, so models whose event times are
/// reconstructed through slightly different arithmetic still tie and execute
/// as simultaneous.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fcmp64(f64);

impl Fcmp64 {
    /// Wraps a raw float.
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// The wrapped float.
    #[must_use]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl From<f64> for Fcmp64 {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<Fcmp64> for f64 {
    fn from(value: Fcmp64) -> Self {
        value.0
    }
}

impl PartialEq for Fcmp64 {
    fn eq(&self, other: &Self) -> bool {
        if self.0.is_infinite() || other.0.is_infinite() {
            return self.0 == other.0;
        }
        fcmp(self.0, other.0, fcmp_epsilon()) == Ordering::Equal
    }
}

impl PartialOrd for Fcmp64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0.is_nan() || other.0.is_nan() {
            return None;
        }
        if self.0.is_infinite() || other.0.is_infinite() {
            return self.0.partial_cmp(&other.0);
        }
        Some(fcmp(self.0, other.0, fcmp_epsilon()))
    }
}

impl Add for Fcmp64 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Fcmp64 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl TimeValue for Fcmp64 {
    fn zero() -> Self {
        Self(0.0)
    }

    fn infinity() -> Self {
        Self(f64::INFINITY)
    }
}

impl fmt::Display for Fcmp64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        assert!(Time::new(1.0, 0) < Time::new(1.0, 1));
        assert!(Time::new(1.0, 9) < Time::new(2.0, 0));
        assert!(Time::new(1.0, 1) > Time::new(1.0, 0));
        assert_eq!(Time::new(1.0, 1), Time::new(1.0, 1));
        assert!(Time::new(1.0, 0) < Time::<f64>::infinity());
    }

    #[test]
    fn test_advance_zero_width_bumps_counter() {
        let t = Time::new(3.0, 2);
        assert_eq!(t.advance(Time::new(0.0, 1)), Time::new(3.0, 3));
        assert_eq!(t.after_epsilon(), Time::new(3.0, 3));
    }

    #[test]
    fn test_advance_positive_resets_counter() {
        let t = Time::new(3.0, 7);
        assert_eq!(t.advance(Time::new(0.5, 4)), Time::new(3.5, 0));
    }

    #[test]
    fn test_elapsed_is_real_difference() {
        let earlier = Time::new(1.0, 4);
        let later = Time::new(2.5, 1);
        assert!((later.elapsed_since(earlier) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_infinity_is_absorbing_in_order() {
        let inf = Time::<f64>::infinity();
        assert!(inf.is_infinite());
        assert!(!Time::new(1e300, 0).is_infinite());
        assert!(Time::new(1e300, u32::MAX) < inf);
    }

    #[test]
    fn test_fcmp_ties_within_epsilon() {
        set_fcmp_epsilon(1e-9);
        let a = Fcmp64::new(1.0);
        let b = Fcmp64::new(1.0 + 1e-13);
        assert_eq!(a, b);
        assert!(Fcmp64::new(1.0) < Fcmp64::new(1.1));
        assert!(Fcmp64::new(1.0) < Fcmp64::infinity());
        set_fcmp_epsilon(1e-12);
    }

    #[test]
    fn test_fcmp_time_ordering() {
        let a = Time::new(Fcmp64::new(1.0), 0);
        let b = Time::new(Fcmp64::new(1.0 + 1e-15), 1);
        // Real parts tie through the epsilon, so the counter decides.
        assert!(a < b);
    }
}
