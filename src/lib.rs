#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

//! A discrete event (DEVS) simulation engine.
//!
//! Models are state machines implementing the [`Atomic`] protocol, wired
//! together through a pin-based routing [`Graph`]. The sequential
//! [`Simulator`] executes them in super-dense [`Time`] order with a
//! two-phase cycle (outputs first, then state transitions), resolving
//! Mealy outputs after Moore outputs and applying structural changes
//! between steps. The optimistic [`OptSimulator`] runs one speculative
//! logical process per model on a worker pool, repairing mis-speculation
//! with rollback and anti-messages and committing events as global virtual
//! time advances. Continuous dynamics enter the event loop through the
//! [`Hybrid`] wrapper, which integrates an [`OdeSystem`] and pins state
//! event crossings down to tolerance.
//!
//! # Example
//!
//! ```
//! use devsim::{Atomic, Bag, Graph, Pin, PinValue, Simulator, Time, TransitionResult};
//!
//! /// Emits a tick on its pin once per period.
//! struct Clock {
//!     period: f64,
//!     out: Pin,
//! }
//!
//! impl Atomic<u32> for Clock {
//!     fn ta(&self) -> f64 {
//!         self.period
//!     }
//!     fn output_func(&mut self, ys: &mut Bag<u32>) -> TransitionResult {
//!         ys.push(PinValue::new(self.out, 1));
//!         Ok(())
//!     }
//!     fn delta_int(&mut self) -> TransitionResult {
//!         Ok(())
//!     }
//!     fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<u32>) -> TransitionResult {
//!         Ok(())
//!     }
//!     fn delta_conf(&mut self, _xs: &Bag<u32>) -> TransitionResult {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> devsim::Result<()> {
//! let mut graph = Graph::new();
//! let out = graph.pin();
//! graph.add_atomic(Box::new(Clock { period: 1.0, out }));
//! let mut sim = Simulator::from_graph(graph)?;
//!
//! let mut ticks = 0;
//! while sim.next_event_time() < Time::real(3.5) {
//!     sim.exec_next_event()?;
//!     ticks += 1;
//! }
//! assert_eq!(ticks, 3);
//! # Ok(())
//! # }
//! ```

pub use cellspace::{CellEvent, CellSpace};
pub use error::{Error, Result, TransitionError, TransitionResult};
pub use graph::{Coupled, Graph, ModelId, Pin, StructureRef};
pub use hybrid::{
    BisectionEventLocator, ContinuousError, CorrectedEuler, EventLocator, Hybrid,
    LinearEventLocator, OdeSolver, OdeSystem, Rk4, SolverKind,
};
pub use model::{Atomic, Bag, MealyAtomic, PinValue, Snapshot};
pub use optimistic::{OptConfig, OptSimulator};
pub use simulator::{EventListener, Simulator};
pub use time::{fcmp_epsilon, set_fcmp_epsilon, Fcmp64, Time, TimeValue};

mod cellspace;
mod error;
mod graph;
mod hybrid;
mod lp;
mod model;
mod optimistic;
mod schedule;
mod simulator;
mod time;
