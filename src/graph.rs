//! Pin-based routing graph over atomic models.
//!
//! Output pins connect to other pins and, ultimately, to the input side of
//! atomic models; [`Graph::route`] computes the transitive set of consumers
//! of a value. While a simulation step is in progress the graph is in
//! *provisional* mode: every structural mutation is recorded in a pending
//! operation log and applied atomically at the end of the step, so routing
//! queries keep seeing the pre-mutation graph.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Atomic;
use crate::time::TimeValue;

/// An opaque output/input port identifier, allocated by [`Graph::pin`] or
/// [`StructureRef::pin`].
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct Pin(usize);

/// Identifies an atomic model within a graph. Ids are never reused, even
/// after the model is removed.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct ModelId(usize);

impl ModelId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// A pending structural operation.
enum GraphOp<X, T>
where
    T: TimeValue,
{
    AddAtomic {
        id: ModelId,
        model: Box<dyn Atomic<X, T>>,
    },
    RemoveAtomic {
        id: ModelId,
    },
    Connect {
        from: Pin,
        to: Pin,
    },
    Disconnect {
        from: Pin,
        to: Pin,
    },
    ConnectModel {
        pin: Pin,
        model: ModelId,
    },
    DisconnectModel {
        pin: Pin,
        model: ModelId,
    },
    RemovePin {
        pin: Pin,
    },
}

/// State shared between a [`Graph`] and its [`StructureRef`] handles.
struct SharedStructure<X, T>
where
    T: TimeValue,
{
    pending: Vec<GraphOp<X, T>>,
    provisional: bool,
    next_pin: usize,
    next_model: usize,
}

/// Routing tables, separated from the model arena so the optimistic
/// simulator can share them read-only across worker threads.
#[derive(Debug, Default)]
pub(crate) struct Routes {
    edges: HashMap<Pin, Vec<Pin>>,
    consumers: HashMap<Pin, Vec<ModelId>>,
}

impl Routes {
    /// Every `(consumer pin, consumer model)` transitively reachable from
    /// `pin`. Duplicate attachments deliver duplicate values; pin cycles
    /// are traversed once.
    pub(crate) fn route(&self, pin: Pin, out: &mut Vec<(Pin, ModelId)>) {
        let mut frontier = vec![pin];
        let mut visited = vec![pin];
        while let Some(p) = frontier.pop() {
            if let Some(models) = self.consumers.get(&p) {
                out.extend(models.iter().map(|&m| (p, m)));
            }
            if let Some(next) = self.edges.get(&p) {
                for &q in next {
                    if !visited.contains(&q) {
                        visited.push(q);
                        frontier.push(q);
                    }
                }
            }
        }
    }

    fn connect(&mut self, from: Pin, to: Pin) {
        self.edges.entry(from).or_default().push(to);
    }

    fn disconnect(&mut self, from: Pin, to: Pin) {
        if let Some(next) = self.edges.get_mut(&from) {
            next.retain(|&p| p != to);
        }
    }

    fn connect_model(&mut self, pin: Pin, model: ModelId) {
        self.consumers.entry(pin).or_default().push(model);
    }

    fn disconnect_model(&mut self, pin: Pin, model: ModelId) {
        if let Some(models) = self.consumers.get_mut(&pin) {
            models.retain(|&m| m != model);
        }
    }

    fn remove_pin(&mut self, pin: Pin) {
        self.edges.remove(&pin);
        for next in self.edges.values_mut() {
            next.retain(|&p| p != pin);
        }
        self.consumers.remove(&pin);
    }

    fn remove_model(&mut self, model: ModelId) {
        for models in self.consumers.values_mut() {
            models.retain(|&m| m != model);
        }
    }
}

/// Models added and removed by a pending-log drain, reported so the
/// simulator can adjust its schedule.
pub(crate) struct StructureOutcome {
    pub(crate) added: Vec<ModelId>,
    pub(crate) removed: Vec<ModelId>,
}

/// A directed hypergraph over pins and atomic models.
///
/// The graph owns the atomic models; they are destroyed when the graph is
/// dropped or when a pending remove operation is applied.
pub struct Graph<X, T = f64>
where
    T: TimeValue,
{
    pub(crate) models: Vec<Option<Box<dyn Atomic<X, T>>>>,
    pub(crate) routes: Routes,
    shared: Arc<Mutex<SharedStructure<X, T>>>,
}

impl<X, T: TimeValue> Default for Graph<X, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X, T: TimeValue> Graph<X, T> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            models: Vec::new(),
            routes: Routes::default(),
            shared: Arc::new(Mutex::new(SharedStructure {
                pending: Vec::new(),
                provisional: false,
                next_pin: 0,
                next_model: 0,
            })),
        }
    }

    /// Allocates a fresh pin.
    pub fn pin(&mut self) -> Pin {
        let mut shared = self.shared.lock();
        let pin = Pin(shared.next_pin);
        shared.next_pin += 1;
        pin
    }

    /// Adds an atomic model, returning its id.
    ///
    /// In provisional mode the model joins the graph when the pending log
    /// is drained, but its id is valid immediately (e.g. for provisional
    /// connections).
    pub fn add_atomic(&mut self, model: Box<dyn Atomic<X, T>>) -> ModelId {
        let mut shared = self.shared.lock();
        let id = ModelId(shared.next_model);
        shared.next_model += 1;
        if shared.provisional {
            shared.pending.push(GraphOp::AddAtomic { id, model });
        } else {
            drop(shared);
            self.insert_model(id, model);
        }
        id
    }

    /// Removes an atomic model, destroying it (immediately, or at the
    /// pending-log drain in provisional mode).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StructuralMisuse`] if no such model exists.
    pub fn remove_atomic(&mut self, id: ModelId) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::RemoveAtomic { id });
            return Ok(());
        }
        drop(shared);
        self.take_model(id)?;
        self.routes.remove_model(id);
        Ok(())
    }

    /// Connects output pin `from` to pin `to`.
    pub fn connect(&mut self, from: Pin, to: Pin) {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::Connect { from, to });
        } else {
            self.routes.connect(from, to);
        }
    }

    /// Removes every `from → to` pin edge.
    pub fn disconnect(&mut self, from: Pin, to: Pin) {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::Disconnect { from, to });
        } else {
            self.routes.disconnect(from, to);
        }
    }

    /// Attaches `pin` as an input of `model`: values reaching `pin` are
    /// delivered to the model with that pin as the consumer pin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StructuralMisuse`] if no such model exists.
    pub fn connect_to_model(&mut self, pin: Pin, model: ModelId) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::ConnectModel { pin, model });
            return Ok(());
        }
        drop(shared);
        self.check_model(model)?;
        self.routes.connect_model(pin, model);
        Ok(())
    }

    /// Detaches `pin` from `model`'s input side.
    pub fn disconnect_from_model(&mut self, pin: Pin, model: ModelId) {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::DisconnectModel { pin, model });
        } else {
            self.routes.disconnect_model(pin, model);
        }
    }

    /// Removes a pin and every edge touching it.
    pub fn remove_pin(&mut self, pin: Pin) {
        let mut shared = self.shared.lock();
        if shared.provisional {
            shared.pending.push(GraphOp::RemovePin { pin });
        } else {
            self.routes.remove_pin(pin);
        }
    }

    /// Every `(consumer pin, consumer model)` reachable from `pin`.
    #[must_use]
    pub fn route(&self, pin: Pin) -> Vec<(Pin, ModelId)> {
        let mut out = Vec::new();
        self.routes.route(pin, &mut out);
        out
    }

    /// A shared handle for issuing structural operations from model code
    /// or from the host while a simulation is running.
    #[must_use]
    pub fn structure(&self) -> StructureRef<X, T> {
        StructureRef {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Read access to a model.
    #[must_use]
    pub fn atomic(&self, id: ModelId) -> Option<&dyn Atomic<X, T>> {
        self.models.get(id.0).and_then(|m| m.as_deref())
    }

    /// Write access to a model.
    pub fn atomic_mut(&mut self, id: ModelId) -> Option<&mut (dyn Atomic<X, T> + 'static)> {
        self.models.get_mut(id.0).and_then(|m| m.as_deref_mut())
    }

    /// Ids of all models currently in the graph, in insertion order.
    pub fn model_ids(&self) -> impl Iterator<Item = ModelId> + '_ {
        self.models
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .map(|(i, _)| ModelId(i))
    }

    pub(crate) fn set_provisional(&mut self, provisional: bool) {
        self.shared.lock().provisional = provisional;
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.shared.lock().pending.is_empty()
    }

    /// Drains the pending operation log in order.
    ///
    /// Must be called with provisional mode off. Reports the models that
    /// are newly present and those removed, so the caller can adjust its
    /// schedule.
    pub(crate) fn apply_pending(&mut self) -> Result<StructureOutcome> {
        let pending = std::mem::take(&mut self.shared.lock().pending);
        let mut outcome = StructureOutcome {
            added: Vec::new(),
            removed: Vec::new(),
        };
        for op in pending {
            match op {
                GraphOp::AddAtomic { id, model } => {
                    self.insert_model_at(id, model);
                    outcome.added.push(id);
                }
                GraphOp::RemoveAtomic { id } => {
                    self.take_model(id)?;
                    self.routes.remove_model(id);
                    outcome.added.retain(|&a| a != id);
                    outcome.removed.push(id);
                }
                GraphOp::Connect { from, to } => self.routes.connect(from, to),
                GraphOp::Disconnect { from, to } => self.routes.disconnect(from, to),
                GraphOp::ConnectModel { pin, model } => {
                    self.check_model(model)?;
                    self.routes.connect_model(pin, model);
                }
                GraphOp::DisconnectModel { pin, model } => {
                    self.routes.disconnect_model(pin, model);
                }
                GraphOp::RemovePin { pin } => self.routes.remove_pin(pin),
            }
        }
        Ok(outcome)
    }

    /// Decomposes the graph into its model arena and routing tables,
    /// dropping the structure handle state.
    pub(crate) fn into_parts(self) -> (Vec<Option<Box<dyn Atomic<X, T>>>>, Routes) {
        (self.models, self.routes)
    }

    fn insert_model(&mut self, id: ModelId, model: Box<dyn Atomic<X, T>>) {
        self.insert_model_at(id, model);
    }

    fn insert_model_at(&mut self, id: ModelId, model: Box<dyn Atomic<X, T>>) {
        if self.models.len() <= id.0 {
            self.models.resize_with(id.0 + 1, || None);
        }
        self.models[id.0] = Some(model);
    }

    fn take_model(&mut self, id: ModelId) -> Result<Box<dyn Atomic<X, T>>> {
        self.models
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::StructuralMisuse {
                reason: format!("model {id} is not in the graph"),
            })
    }

    fn check_model(&self, id: ModelId) -> Result<()> {
        if self.atomic(id).is_none() {
            return Err(Error::StructuralMisuse {
                reason: format!("model {id} is not in the graph"),
            });
        }
        Ok(())
    }
}

/// A cloneable handle through which structural changes are requested while
/// a simulation step is in progress.
///
/// Operations append to the owning graph's pending log and take effect at
/// the end of the current `compute_next_state`. Ids for added models and
/// pins are valid immediately, so a freshly added model can be wired up in
/// the same step.
pub struct StructureRef<X, T = f64>
where
    T: TimeValue,
{
    shared: Arc<Mutex<SharedStructure<X, T>>>,
}

impl<X, T: TimeValue> Clone for StructureRef<X, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<X, T: TimeValue> StructureRef<X, T> {
    /// Allocates a fresh pin.
    pub fn pin(&self) -> Pin {
        let mut shared = self.shared.lock();
        let pin = Pin(shared.next_pin);
        shared.next_pin += 1;
        pin
    }

    /// Requests addition of an atomic model; returns its reserved id.
    pub fn add_atomic(&self, model: Box<dyn Atomic<X, T>>) -> ModelId {
        let mut shared = self.shared.lock();
        let id = ModelId(shared.next_model);
        shared.next_model += 1;
        shared.pending.push(GraphOp::AddAtomic { id, model });
        id
    }

    /// Requests removal (and destruction) of a model.
    pub fn remove_atomic(&self, id: ModelId) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::RemoveAtomic { id });
    }

    /// Requests a pin-to-pin connection.
    pub fn connect(&self, from: Pin, to: Pin) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::Connect { from, to });
    }

    /// Requests removal of every `from → to` pin edge.
    pub fn disconnect(&self, from: Pin, to: Pin) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::Disconnect { from, to });
    }

    /// Requests attachment of `pin` as an input of `model`.
    pub fn connect_to_model(&self, pin: Pin, model: ModelId) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::ConnectModel { pin, model });
    }

    /// Requests detachment of `pin` from `model`'s input side.
    pub fn disconnect_from_model(&self, pin: Pin, model: ModelId) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::DisconnectModel { pin, model });
    }

    /// Requests removal of a pin and every edge touching it.
    pub fn remove_pin(&self, pin: Pin) {
        self.shared
            .lock()
            .pending
            .push(GraphOp::RemovePin { pin });
    }
}

/// A coupled model: a component that knows how to assemble itself into a
/// routing graph.
pub trait Coupled<X, T = f64>
where
    T: TimeValue,
{
    /// Builds the graph containing this component's atomics and couplings.
    ///
    /// # Errors
    ///
    /// Implementations surface any wiring error as
    /// [`Error::StructuralMisuse`].
    fn assemble(self) -> Result<Graph<X, T>>;
}
