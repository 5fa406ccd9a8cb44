//! The atomic model protocol.
//!
//! An [`Atomic`] is a DEVS state machine: it advances spontaneously after
//! [`Atomic::ta`] time units, produces output just before an internal
//! transition, and reacts to routed input through its external or confluent
//! transition. [`MealyAtomic`] extends the protocol with output variants
//! that may depend on the input received at the firing instant.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::error::TransitionResult;
use crate::graph::Pin;
use crate::time::TimeValue;

/// A value appearing at a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinValue<X> {
    /// The pin the value was produced at (for outputs) or delivered to
    /// (for inputs).
    pub pin: Pin,
    /// The carried value.
    pub value: X,
}

impl<X> PinValue<X> {
    /// Creates a pin/value pair.
    pub fn new(pin: Pin, value: X) -> Self {
        Self { pin, value }
    }
}

/// A multiset of pin values; duplicates are preserved and order carries no
/// meaning.
pub type Bag<X> = Vec<PinValue<X>>;

/// An opaque saved model state, produced by [`Atomic::save_state`].
pub type Snapshot = Box<dyn Any + Send>;

/// A DEVS atomic model over values of type `X` and a real clock of type `T`.
///
/// The simulator maintains all timing bookkeeping (`tL`, `tN`, bags); a
/// model only describes behavior. `Send` is required because the optimistic
/// simulator hands models to worker threads.
pub trait Atomic<X, T = f64>: Send
where
    T: TimeValue,
{
    /// Time until the next internal transition; [`TimeValue::infinity`]
    /// means passive. A negative value aborts the simulation.
    fn ta(&self) -> T;

    /// Produces output at an imminent instant, before the internal or
    /// confluent transition is applied.
    fn output_func(&mut self, ys: &mut Bag<X>) -> TransitionResult;

    /// Internal transition: the model is imminent and received no input.
    fn delta_int(&mut self) -> TransitionResult;

    /// External transition: the model is not imminent and received input
    /// `xs` after `elapsed` time in its current state.
    fn delta_ext(&mut self, elapsed: T, xs: &Bag<X>) -> TransitionResult;

    /// Confluent transition: the model is imminent and received input at
    /// the same instant.
    fn delta_conf(&mut self, xs: &Bag<X>) -> TransitionResult;

    /// Saves the current state for a later [`Atomic::restore_state`].
    ///
    /// Returning `None` (the default) declares that the model does not
    /// support checkpointing; the optimistic simulator then refuses to run
    /// it. Every snapshot handed out is eventually returned to exactly one
    /// of [`Atomic::restore_state`]-then-[`Atomic::gc_state`] or
    /// [`Atomic::gc_state`] alone.
    fn save_state(&mut self) -> Option<Snapshot> {
        None
    }

    /// Restores a state previously produced by [`Atomic::save_state`].
    fn restore_state(&mut self, state: &Snapshot) {
        let _ = state;
    }

    /// Releases a snapshot. The default drops it.
    fn gc_state(&mut self, state: Snapshot) {
        drop(state);
    }

    /// Releases output values whose speculative send was either committed
    /// or discarded. The default drops them.
    fn gc_output(&mut self, ys: Bag<X>) {
        drop(ys);
    }

    /// Capability query: returns the Mealy view of this model, if any.
    ///
    /// The engine calls this instead of downcasting; Moore models keep the
    /// default.
    fn mealy_mut(&mut self) -> Option<&mut dyn MealyAtomic<X, T>> {
        None
    }
}

/// An atomic model whose output may depend on the input arriving at the
/// firing instant.
///
/// The purely internal output variant is [`Atomic::output_func`]; the two
/// methods here cover the confluent and external cases. Mealy outputs are
/// resolved after all Moore outputs in an output phase, and a routing cycle
/// made only of Mealy models is a fatal error.
pub trait MealyAtomic<X, T = f64>: Atomic<X, T>
where
    T: TimeValue,
{
    /// Output for a confluent firing: imminent with input `xs`.
    fn confluent_output_func(&mut self, xs: &Bag<X>, ys: &mut Bag<X>) -> TransitionResult;

    /// Output for an external firing: not imminent, input `xs` received
    /// after `elapsed` time.
    fn external_output_func(&mut self, elapsed: T, xs: &Bag<X>, ys: &mut Bag<X>)
        -> TransitionResult;
}
