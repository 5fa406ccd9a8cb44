//! Structural changes issued mid-step: a model added with `ta = 0` during
//! a transition joins the next imminent set at the same real time with an
//! incremented micro-step.

use std::sync::Arc;

use parking_lot::Mutex;

use devsim::{
    Atomic, Bag, EventListener, Graph, ModelId, Pin, PinValue, Simulator, StructureRef, Time,
    TransitionResult,
};

/// Fires once and says hello.
struct Newcomer {
    out: Pin,
    spent: bool,
}

impl Atomic<u32> for Newcomer {
    fn ta(&self) -> f64 {
        if self.spent {
            f64::INFINITY
        } else {
            0.0
        }
    }
    fn output_func(&mut self, ys: &mut Bag<u32>) -> TransitionResult {
        ys.push(PinValue::new(self.out, 99));
        Ok(())
    }
    fn delta_int(&mut self) -> TransitionResult {
        self.spent = true;
        Ok(())
    }
    fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<u32>) -> TransitionResult {
        Ok(())
    }
    fn delta_conf(&mut self, _xs: &Bag<u32>) -> TransitionResult {
        Ok(())
    }
}

/// On its first transition, requests the addition of a `Newcomer` through
/// the structure handle.
struct Spawner {
    structure: StructureRef<u32>,
    spawned: bool,
}

impl Atomic<u32> for Spawner {
    fn ta(&self) -> f64 {
        if self.spawned {
            f64::INFINITY
        } else {
            1.0
        }
    }
    fn output_func(&mut self, _ys: &mut Bag<u32>) -> TransitionResult {
        Ok(())
    }
    fn delta_int(&mut self) -> TransitionResult {
        let out = self.structure.pin();
        self.structure.add_atomic(Box::new(Newcomer { out, spent: false }));
        self.spawned = true;
        Ok(())
    }
    fn delta_ext(&mut self, _elapsed: f64, _xs: &Bag<u32>) -> TransitionResult {
        Ok(())
    }
    fn delta_conf(&mut self, _xs: &Bag<u32>) -> TransitionResult {
        Ok(())
    }
}

struct OutputTimes {
    seen: Arc<Mutex<Vec<(ModelId, u32, f64, u32)>>>,
}

impl EventListener<u32> for OutputTimes {
    fn output_event(&mut self, model: ModelId, pv: &PinValue<u32>, t: Time<f64>) {
        self.seen.lock().push((model, pv.value, t.t, t.c));
    }
}

#[test]
fn test_mid_step_addition_joins_next_imminent_set() {
    let mut graph: Graph<u32> = Graph::new();
    let structure = graph.structure();
    graph.add_atomic(Box::new(Spawner {
        structure,
        spawned: false,
    }));

    let mut sim = Simulator::from_graph(graph).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    sim.add_event_listener(Box::new(OutputTimes {
        seen: Arc::clone(&seen),
    }));

    // The spawner fires at (1, 0) and requests the addition.
    assert_eq!(sim.next_event_time(), Time::real(1.0));
    sim.exec_next_event().unwrap();

    // The newcomer is imminent at the same real time, next micro-step.
    assert_eq!(sim.next_event_time(), Time::new(1.0, 1));
    sim.exec_next_event().unwrap();
    assert_eq!(&*seen.lock(), &[(ModelId::from(1usize), 99, 1.0, 1)]);

    // Everyone is passive afterwards.
    assert!(sim.next_event_time().is_infinite());
}

#[test]
fn test_mid_step_removal_parks_the_model() {
    let mut graph: Graph<u32> = Graph::new();
    let out = graph.pin();
    let doomed = graph.add_atomic(Box::new(Newcomer { out, spent: false }));
    let structure = graph.structure();
    graph.add_atomic(Box::new(Spawner {
        structure: structure.clone(),
        spawned: true, // never spawns; used here only as a passive peer
    }));

    let mut sim = Simulator::from_graph(graph).unwrap();
    // The doomed model is imminent at (0, 0); remove it during the step.
    structure.remove_atomic(doomed);
    sim.exec_next_event().unwrap();
    assert!(sim.next_event_time().is_infinite());
    assert!(sim.graph().atomic(doomed).is_none());
}
