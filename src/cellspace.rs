//! Cell space models: atomics arranged on a bounded three-dimensional
//! lattice, exchanging events addressed by target coordinates.
//!
//! A [`CellSpace`] is a coupled model. Every cell emits [`CellEvent`]s on
//! the shared [`CellSpace::emit_pin`]; a Mealy routing atomic forwards
//! each event to the input pin of the addressed cell in zero time, so a
//! cell-to-cell hop costs no simulation time. Events addressed outside the
//! `width × height × depth` bounds are re-emitted on the
//! [`CellSpace::outside_pin`] as external outputs of the cell space.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransitionResult};
use crate::graph::{Coupled, Graph, ModelId, Pin};
use crate::model::{Atomic, Bag, MealyAtomic, PinValue};

/// An event addressed to the cell at `(x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellEvent<X> {
    /// Target column.
    pub x: i64,
    /// Target row.
    pub y: i64,
    /// Target layer.
    pub z: i64,
    /// The carried value.
    pub value: X,
}

impl<X> CellEvent<X> {
    /// Creates an event addressed to `(x, y, z)`.
    pub fn new(x: i64, y: i64, z: i64, value: X) -> Self {
        Self { x, y, z, value }
    }
}

/// Zero-delay coordinate router; Mealy so delivery happens in the same
/// output phase as the emission.
struct CellRouter {
    width: i64,
    height: i64,
    depth: i64,
    pins: Vec<Option<Pin>>,
    outside: Pin,
}

impl CellRouter {
    fn target<X>(&self, event: &CellEvent<X>) -> Pin {
        let in_bounds = (0..self.width).contains(&event.x)
            && (0..self.height).contains(&event.y)
            && (0..self.depth).contains(&event.z);
        if in_bounds {
            let idx = ((event.x * self.height + event.y) * self.depth + event.z) as usize;
            self.pins[idx].unwrap_or(self.outside)
        } else {
            self.outside
        }
    }

    fn forward<X: Clone>(&self, xs: &Bag<CellEvent<X>>, ys: &mut Bag<CellEvent<X>>) {
        for pv in xs {
            ys.push(PinValue::new(self.target(&pv.value), pv.value.clone()));
        }
    }
}

impl<X: Clone + Send + 'static> Atomic<CellEvent<X>> for CellRouter {
    fn ta(&self) -> f64 {
        f64::INFINITY
    }
    fn output_func(&mut self, _ys: &mut Bag<CellEvent<X>>) -> TransitionResult {
        Ok(())
    }
    fn delta_int(&mut self) -> TransitionResult {
        Ok(())
    }
    fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<CellEvent<X>>) -> TransitionResult {
        Ok(())
    }
    fn delta_conf(&mut self, _xs: &Bag<CellEvent<X>>) -> TransitionResult {
        Ok(())
    }
    fn mealy_mut(&mut self) -> Option<&mut dyn MealyAtomic<CellEvent<X>, f64>> {
        Some(self)
    }
}

impl<X: Clone + Send + 'static> MealyAtomic<CellEvent<X>> for CellRouter {
    fn confluent_output_func(
        &mut self,
        xs: &Bag<CellEvent<X>>,
        ys: &mut Bag<CellEvent<X>>,
    ) -> TransitionResult {
        self.forward(xs, ys);
        Ok(())
    }

    fn external_output_func(
        &mut self,
        _elapsed: f64,
        xs: &Bag<CellEvent<X>>,
        ys: &mut Bag<CellEvent<X>>,
    ) -> TransitionResult {
        self.forward(xs, ys);
        Ok(())
    }
}

/// A bounded lattice of cell models, assembled into a routing graph.
pub struct CellSpace<X> {
    graph: Graph<CellEvent<X>>,
    width: usize,
    height: usize,
    depth: usize,
    emit: Pin,
    outside: Pin,
    cells: Vec<Option<(ModelId, Pin)>>,
}

impl<X: Clone + Send + 'static> CellSpace<X> {
    /// Creates an empty `width × height × depth` cell space.
    #[must_use]
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        let mut graph = Graph::new();
        let emit = graph.pin();
        let outside = graph.pin();
        Self {
            graph,
            width,
            height,
            depth,
            emit,
            outside,
            cells: vec![None; width * height * depth],
        }
    }

    /// The pin every cell emits its [`CellEvent`]s on. Inputs injected
    /// here are routed by coordinate like any cell emission.
    #[must_use]
    pub fn emit_pin(&self) -> Pin {
        self.emit
    }

    /// The pin carrying events addressed outside the lattice bounds.
    #[must_use]
    pub fn outside_pin(&self) -> Pin {
        self.outside
    }

    /// Places a cell model at `(x, y, z)` and returns its id.
    ///
    /// # Errors
    ///
    /// [`Error::StructuralMisuse`] if the coordinate is out of bounds or
    /// already occupied.
    pub fn add(
        &mut self,
        model: Box<dyn Atomic<CellEvent<X>>>,
        x: usize,
        y: usize,
        z: usize,
    ) -> Result<ModelId> {
        if x >= self.width || y >= self.height || z >= self.depth {
            return Err(Error::StructuralMisuse {
                reason: format!("cell ({x}, {y}, {z}) is outside the space"),
            });
        }
        let idx = (x * self.height + y) * self.depth + z;
        if self.cells[idx].is_some() {
            return Err(Error::StructuralMisuse {
                reason: format!("cell ({x}, {y}, {z}) is already occupied"),
            });
        }
        let pin = self.graph.pin();
        let id = self.graph.add_atomic(model);
        self.graph.connect_to_model(pin, id)?;
        self.cells[idx] = Some((id, pin));
        Ok(id)
    }
}

impl<X: Clone + Send + 'static> Coupled<CellEvent<X>> for CellSpace<X> {
    fn assemble(mut self) -> Result<Graph<CellEvent<X>>> {
        let router = CellRouter {
            width: self.width as i64,
            height: self.height as i64,
            depth: self.depth as i64,
            pins: self
                .cells
                .iter()
                .map(|cell| cell.as_ref().map(|&(_, pin)| pin))
                .collect(),
            outside: self.outside,
        };
        let router_id = self.graph.add_atomic(Box::new(router));
        self.graph.connect_to_model(self.emit, router_id)?;
        Ok(self.graph)
    }
}
