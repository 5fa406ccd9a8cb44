//! The sequential DEVS simulator.
//!
//! The event cycle is split into two observable phases. Phase A
//! ([`Simulator::compute_next_output`]) routes injected inputs, fires the
//! output functions of imminent models, and resolves Mealy outputs after
//! all Moore outputs are known. Phase B
//! ([`Simulator::compute_next_state`]) applies the internal, external, or
//! confluent transition of every activated model, reschedules it one
//! micro-step past the event instant, and drains the graph's pending
//! structural operations. [`Simulator::exec_next_event`] runs both.
//!
//! Between the phases the host may inspect listener output and, in
//! HLA-style co-simulation, retract its published messages, override the
//! next event time with [`Simulator::set_next_time`], and inject inputs
//! before computing new states.

use std::collections::HashSet;
use std::mem;

use crate::error::{Error, Result};
use crate::graph::{Coupled, Graph, ModelId, StructureRef};
use crate::model::{Atomic, Bag, PinValue};
use crate::schedule::Schedule;
use crate::time::{Time, TimeValue};

/// Receives notifications of events as they occur in a running simulation.
///
/// Callbacks run on the caller's thread and must not re-enter the
/// simulator. All methods default to no-ops so listeners implement only
/// what they observe.
pub trait EventListener<X, T = f64>
where
    T: TimeValue,
{
    /// Called for each pin value a model produces during an output phase.
    fn output_event(&mut self, model: ModelId, value: &PinValue<X>, t: Time<T>) {
        let _ = (model, value, t);
    }

    /// Called for each pin value delivered to a model's external or
    /// confluent transition.
    fn input_event(&mut self, model: ModelId, value: &PinValue<X>, t: Time<T>) {
        let _ = (model, value, t);
    }

    /// Called after a model changes state.
    fn state_change(&mut self, model: ModelId, t: Time<T>) {
        let _ = (model, t);
    }
}

/// Timing bookkeeping and bags the simulator keeps per atomic model.
struct ModelState<X, T>
where
    T: TimeValue,
{
    t_l: Time<T>,
    t_n: Time<T>,
    inputs: Bag<X>,
    outputs: Bag<X>,
}

impl<X, T: TimeValue> Default for ModelState<X, T> {
    fn default() -> Self {
        Self {
            t_l: Time::zero(),
            t_n: Time::infinity(),
            inputs: Bag::new(),
            outputs: Bag::new(),
        }
    }
}

/// The sequential DEVS simulator.
pub struct Simulator<X, T = f64>
where
    T: TimeValue,
{
    graph: Graph<X, T>,
    listeners: Vec<Box<dyn EventListener<X, T>>>,
    external_input: Vec<PinValue<X>>,
    active: Vec<ModelId>,
    active_set: HashSet<ModelId>,
    state: Vec<ModelState<X, T>>,
    sched: Schedule<T>,
    t_next: Time<T>,
}

impl<X: Clone, T: TimeValue> Simulator<X, T> {
    /// Creates a simulator for a single atomic model.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NegativeTimeAdvance`] if the model's initial
    /// time advance is negative.
    pub fn new(model: Box<dyn Atomic<X, T>>) -> Result<Self> {
        let mut graph = Graph::new();
        graph.add_atomic(model);
        Self::from_graph(graph)
    }

    /// Creates a simulator for a collection of models wired through a
    /// graph. Every model is scheduled from time zero.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NegativeTimeAdvance`] if any model's initial
    /// time advance is negative.
    pub fn from_graph(graph: Graph<X, T>) -> Result<Self> {
        let ids: Vec<ModelId> = graph.model_ids().collect();
        let mut sim = Self {
            graph,
            listeners: Vec::new(),
            external_input: Vec::new(),
            active: Vec::new(),
            active_set: HashSet::new(),
            state: Vec::new(),
            sched: Schedule::new(),
            t_next: Time::infinity(),
        };
        for id in ids {
            sim.schedule_model(id, Time::zero())?;
        }
        sim.graph.set_provisional(true);
        sim.t_next = sim.sched.min_priority();
        Ok(sim)
    }

    /// Creates a simulator for a coupled model that assembles its own
    /// graph.
    ///
    /// # Errors
    ///
    /// Propagates assembly errors and initial-scheduling errors.
    pub fn from_coupled<C: Coupled<X, T>>(model: C) -> Result<Self> {
        Self::from_graph(model.assemble()?)
    }

    /// The absolute time of the next output and change of state.
    #[must_use]
    pub fn next_event_time(&self) -> Time<T> {
        self.t_next
    }

    /// Executes one full event cycle and returns the new simulation time.
    ///
    /// # Errors
    ///
    /// Propagates any fatal error from either phase; the schedule remains
    /// consistent for inspection.
    pub fn exec_next_event(&mut self) -> Result<Time<T>> {
        self.compute_next_output()?;
        self.compute_next_state()
    }

    /// Injects an input to be applied at the next call to
    /// [`Simulator::compute_next_output`]. The value is routed to every
    /// model reachable from the pin.
    pub fn inject_input(&mut self, value: PinValue<X>) {
        self.external_input.push(value);
    }

    /// Erases injected inputs that have not yet been applied.
    pub fn clear_injected_input(&mut self) {
        self.external_input.clear();
    }

    /// Overrides the next event time downward, forcing injected inputs to
    /// be applied at `t` even though no model is imminent there.
    pub fn set_next_time(&mut self, t: Time<T>) {
        self.t_next = t;
    }

    /// Registers a listener notified of inputs, outputs, and state changes.
    pub fn add_event_listener(&mut self, listener: Box<dyn EventListener<X, T>>) {
        self.listeners.push(listener);
    }

    /// The routing graph and the models it owns.
    #[must_use]
    pub fn graph(&self) -> &Graph<X, T> {
        &self.graph
    }

    /// A handle for issuing structural changes; they take effect at the
    /// end of the next [`Simulator::compute_next_state`].
    #[must_use]
    pub fn structure(&self) -> StructureRef<X, T> {
        self.graph.structure()
    }

    /// Time of the model's last transition, if it exists.
    #[must_use]
    pub fn last_event_time(&self, id: ModelId) -> Option<Time<T>> {
        self.graph.atomic(id)?;
        self.state.get(id.index()).map(|s| s.t_l)
    }

    /// Time of the model's next internal transition, if it exists.
    #[must_use]
    pub fn next_event_time_of(&self, id: ModelId) -> Option<Time<T>> {
        self.graph.atomic(id)?;
        self.state.get(id.index()).map(|s| s.t_n)
    }

    /// Phase A: compute the outputs of models at the next event time.
    ///
    /// Output is produced by imminent models and by Mealy models receiving
    /// input. Listeners are notified of each output. Neither simulation
    /// time nor model states change.
    ///
    /// # Errors
    ///
    /// [`Error::MealyFeedbackLoop`] if resolving Mealy outputs routes a
    /// value back into an already finalized Mealy model; also propagates
    /// model output failures.
    pub fn compute_next_output(&mut self) -> Result<()> {
        // Undo any previous output computation at this event time.
        for &id in &self.active {
            let st = &mut self.state[id.index()];
            st.inputs.clear();
            st.outputs.clear();
        }
        self.active.clear();
        self.active_set.clear();

        let mut pending: Vec<ModelId> = Vec::new();
        let mut pending_set: HashSet<ModelId> = HashSet::new();

        // Route externally supplied inputs.
        let injected = mem::take(&mut self.external_input);
        let mut routed = Vec::new();
        for pv in injected {
            routed.clear();
            self.graph.routes.route(pv.pin, &mut routed);
            for &(pin, target) in &routed {
                self.deliver(
                    target,
                    PinValue::new(pin, pv.value.clone()),
                    &mut pending,
                    &mut pending_set,
                )?;
            }
        }

        // Route the output from the Moore-type imminent models. Mealy
        // imminents wait until all Moore outputs are known.
        if !self.t_next.is_infinite() && self.sched.min_priority() == self.t_next {
            for id in self.sched.visit_imminent() {
                if self.is_mealy(id) {
                    if pending_set.insert(id) {
                        pending.push(id);
                    }
                    continue;
                }
                self.mark_active(id);
                let mut ys = mem::take(&mut self.state[id.index()].outputs);
                self.model_mut(id)
                    .output_func(&mut ys)
                    .map_err(|source| Error::Model { model: id, source })?;
                self.emit_and_route(id, &ys, &mut pending, &mut pending_set)?;
                self.state[id.index()].outputs = ys;
            }
        }

        // Resolve Mealy outputs. Finalizing a model moves it into the
        // active set; routing a value back into a finalized Mealy model is
        // a feedback loop.
        while let Some(id) = pending.pop() {
            pending_set.remove(&id);
            self.mark_active(id);
            let imminent = self.state[id.index()].t_n == self.t_next;
            let elapsed = self.t_next.elapsed_since(self.state[id.index()].t_l);
            let xs = mem::take(&mut self.state[id.index()].inputs);
            let mut ys = mem::take(&mut self.state[id.index()].outputs);
            {
                let model = self.model_mut(id);
                let mealy = model
                    .mealy_mut()
                    .expect("pending set contains only Mealy models");
                let fired = if xs.is_empty() && imminent {
                    mealy.output_func(&mut ys)
                } else if imminent {
                    mealy.confluent_output_func(&xs, &mut ys)
                } else {
                    mealy.external_output_func(elapsed, &xs, &mut ys)
                };
                fired.map_err(|source| Error::Model { model: id, source })?;
            }
            self.state[id.index()].inputs = xs;
            self.emit_and_route(id, &ys, &mut pending, &mut pending_set)?;
            self.state[id.index()].outputs = ys;
        }
        Ok(())
    }

    /// Phase B: apply transitions to every activated model, drain the
    /// structural operation log, and return the new simulation time.
    ///
    /// # Errors
    ///
    /// Propagates transition failures, [`Error::NegativeTimeAdvance`], and
    /// structural-drain errors.
    pub fn compute_next_state(&mut self) -> Result<Time<T>> {
        let t = self.t_next.after_epsilon();
        let active = mem::take(&mut self.active);
        self.active_set.clear();
        for &id in &active {
            let xs = mem::take(&mut self.state[id.index()].inputs);
            for pv in &xs {
                for listener in &mut self.listeners {
                    listener.input_event(id, pv, self.t_next);
                }
            }
            let imminent = self.state[id.index()].t_n == self.t_next;
            let elapsed = self.t_next.elapsed_since(self.state[id.index()].t_l);
            {
                let model = self.model_mut(id);
                let changed = if xs.is_empty() {
                    model.delta_int()
                } else if imminent {
                    model.delta_conf(&xs)
                } else {
                    model.delta_ext(elapsed, &xs)
                };
                changed.map_err(|source| Error::Model { model: id, source })?;
            }
            for listener in &mut self.listeners {
                listener.state_change(id, self.t_next);
            }
            self.state[id.index()].outputs.clear();
            self.schedule_model(id, t)?;
        }

        // Effect any changes in the model structure.
        self.graph.set_provisional(false);
        let outcome = self.graph.apply_pending()?;
        for id in outcome.added {
            self.schedule_model(id, t)?;
        }
        for id in outcome.removed {
            self.sched.schedule(id, Time::infinity());
        }
        self.graph.set_provisional(true);

        self.t_next = self.sched.min_priority();
        log::trace!(
            "step complete at ({:?}, {}), next event at ({:?}, {})",
            t.t,
            t.c,
            self.t_next.t,
            self.t_next.c
        );
        Ok(t)
    }

    /// Sets the model's last-event time to `t` and (re)schedules its next
    /// internal transition from its time advance.
    fn schedule_model(&mut self, id: ModelId, t: Time<T>) -> Result<()> {
        if self.state.len() <= id.index() {
            self.state.resize_with(id.index() + 1, ModelState::default);
        }
        let dt = match self.graph.models[id.index()].as_mut() {
            Some(model) => model.ta(),
            None => return Ok(()),
        };
        let st = &mut self.state[id.index()];
        st.t_l = t;
        if dt.is_finite() {
            if dt < T::zero() {
                return Err(Error::NegativeTimeAdvance { model: id });
            }
            st.t_n = t.advance(Time::real(dt));
        } else {
            st.t_n = Time::infinity();
        }
        self.sched.schedule(id, st.t_n);
        Ok(())
    }

    /// Notifies listeners of `src`'s outputs and routes each one,
    /// delivering to consumers.
    fn emit_and_route(
        &mut self,
        src: ModelId,
        ys: &Bag<X>,
        pending: &mut Vec<ModelId>,
        pending_set: &mut HashSet<ModelId>,
    ) -> Result<()> {
        let mut routed = Vec::new();
        for pv in ys {
            for listener in &mut self.listeners {
                listener.output_event(src, pv, self.t_next);
            }
            routed.clear();
            self.graph.routes.route(pv.pin, &mut routed);
            for &(pin, target) in &routed {
                self.deliver(
                    target,
                    PinValue::new(pin, pv.value.clone()),
                    pending,
                    pending_set,
                )?;
            }
        }
        Ok(())
    }

    /// Appends an input to `target` and bins it into the active set
    /// (Moore) or the pending set (Mealy).
    fn deliver(
        &mut self,
        target: ModelId,
        pv: PinValue<X>,
        pending: &mut Vec<ModelId>,
        pending_set: &mut HashSet<ModelId>,
    ) -> Result<()> {
        if self.state.len() <= target.index() {
            self.state
                .resize_with(target.index() + 1, ModelState::default);
        }
        if self.is_mealy(target) {
            // A finalized Mealy model must not receive further input.
            if self.active_set.contains(&target) {
                return Err(Error::MealyFeedbackLoop { model: target });
            }
            if pending_set.insert(target) {
                pending.push(target);
            }
        } else {
            self.mark_active(target);
        }
        self.state[target.index()].inputs.push(pv);
        Ok(())
    }

    fn mark_active(&mut self, id: ModelId) {
        if self.active_set.insert(id) {
            self.active.push(id);
        }
    }

    fn is_mealy(&mut self, id: ModelId) -> bool {
        self.model_mut(id).mealy_mut().is_some()
    }

    fn model_mut(&mut self, id: ModelId) -> &mut dyn Atomic<X, T> {
        self.graph.models[id.index()]
            .as_deref_mut()
            .expect("routing produced a model that is not in the graph")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::TransitionResult;
    use crate::graph::Pin;

    /// Emits `1` on its pin every `period`, counting firings.
    struct Pulse {
        period: f64,
        out: Pin,
        fired: u32,
    }

    impl Atomic<i32> for Pulse {
        fn ta(&self) -> f64 {
            self.period
        }
        fn output_func(&mut self, ys: &mut Bag<i32>) -> TransitionResult {
            ys.push(PinValue::new(self.out, 1));
            Ok(())
        }
        fn delta_int(&mut self) -> TransitionResult {
            self.fired += 1;
            Ok(())
        }
        fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<i32>) -> TransitionResult {
            Ok(())
        }
        fn delta_conf(&mut self, _xs: &Bag<i32>) -> TransitionResult {
            Ok(())
        }
    }

    /// Sums everything it receives.
    struct Sum {
        total: i32,
        pending: i32,
    }

    impl Atomic<i32> for Sum {
        fn ta(&self) -> f64 {
            f64::INFINITY
        }
        fn output_func(&mut self, _ys: &mut Bag<i32>) -> TransitionResult {
            Ok(())
        }
        fn delta_int(&mut self) -> TransitionResult {
            Ok(())
        }
        fn delta_ext(&mut self, _elapsed: f64, xs: &Bag<i32>) -> TransitionResult {
            self.pending = xs.iter().map(|pv| pv.value).sum();
            self.total += self.pending;
            Ok(())
        }
        fn delta_conf(&mut self, xs: &Bag<i32>) -> TransitionResult {
            self.delta_ext(0.0, xs)
        }
    }

    #[derive(Default)]
    struct Trace {
        outputs: std::rc::Rc<std::cell::RefCell<Vec<(ModelId, i32, u32)>>>,
    }

    impl EventListener<i32> for Trace {
        fn output_event(&mut self, model: ModelId, value: &PinValue<i32>, t: Time<f64>) {
            self.outputs.borrow_mut().push((model, value.value, t.c));
        }
    }

    fn pulse_into_sum(period: f64) -> (Simulator<i32>, ModelId, ModelId) {
        let mut graph = Graph::new();
        let out = graph.pin();
        let pulse = graph.add_atomic(Box::new(Pulse {
            period,
            out,
            fired: 0,
        }));
        let sum = graph.add_atomic(Box::new(Sum {
            total: 0,
            pending: 0,
        }));
        graph.connect_to_model(out, sum).unwrap();
        (Simulator::from_graph(graph).unwrap(), pulse, sum)
    }

    #[test]
    fn test_event_cycle_routes_outputs() {
        let (mut sim, pulse, sum) = pulse_into_sum(1.0);
        assert_eq!(sim.next_event_time(), Time::real(1.0));
        for _ in 0..3 {
            sim.exec_next_event().unwrap();
        }
        assert_eq!(sim.next_event_time(), Time::real(4.0));
        assert_eq!(sim.last_event_time(pulse), Some(Time::new(3.0, 1)));
        assert_eq!(sim.last_event_time(sum), Some(Time::new(3.0, 1)));
    }

    #[test]
    fn test_listener_sees_outputs_at_event_time() {
        let (mut sim, pulse, _) = pulse_into_sum(2.0);
        let trace = Trace::default();
        let outputs = std::rc::Rc::clone(&trace.outputs);
        sim.add_event_listener(Box::new(trace));
        sim.exec_next_event().unwrap();
        sim.exec_next_event().unwrap();
        assert_eq!(&*outputs.borrow(), &[(pulse, 1, 0), (pulse, 1, 0)]);
    }

    #[test]
    fn test_output_phase_is_repeatable_before_state_phase() {
        let (mut sim, _, _) = pulse_into_sum(1.0);
        sim.compute_next_output().unwrap();
        // An HLA host that retracts its messages recomputes the output.
        sim.compute_next_output().unwrap();
        let t = sim.compute_next_state().unwrap();
        assert_eq!(t, Time::new(1.0, 1));
    }

    #[test]
    fn test_injected_input_with_next_time_override() {
        let (mut sim, _, sum) = pulse_into_sum(10.0);
        // Wire an external input pin straight into the accumulator.
        // The graph is provisional while the simulator runs, so this goes
        // through the structure handle and a dummy step.
        let structure = sim.structure();
        let input = structure.pin();
        structure.connect_to_model(input, sum);
        sim.set_next_time(Time::real(0.5));
        sim.exec_next_event().unwrap();

        sim.inject_input(PinValue::new(input, 7));
        sim.set_next_time(Time::real(1.0));
        sim.exec_next_event().unwrap();
        assert_eq!(sim.last_event_time(sum), Some(Time::new(1.0, 1)));
        // The pulse is still pending at t = 10.
        assert_eq!(sim.next_event_time(), Time::real(10.0));
    }

    #[test]
    fn test_negative_time_advance_is_fatal() {
        struct Broken;
        impl Atomic<i32> for Broken {
            fn ta(&self) -> f64 {
                -1.0
            }
            fn output_func(&mut self, _ys: &mut Bag<i32>) -> TransitionResult {
                Ok(())
            }
            fn delta_int(&mut self) -> TransitionResult {
                Ok(())
            }
            fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<i32>) -> TransitionResult {
                Ok(())
            }
            fn delta_conf(&mut self, _xs: &Bag<i32>) -> TransitionResult {
                Ok(())
            }
        }
        let err = Simulator::new(Box::new(Broken)).err().unwrap();
        assert!(matches!(err, Error::NegativeTimeAdvance { .. }));
    }
}
