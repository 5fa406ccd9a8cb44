//! A generator firing into a hybrid block exactly when its internal time
//! event expires: every firing must be confluent, with the internal event
//! applied before the external one at zero elapsed time.

use std::sync::Arc;

use parking_lot::Mutex;

use devsim::{
    Atomic, Bag, BisectionEventLocator, CorrectedEuler, Graph, Hybrid, OdeSystem, Pin, PinValue,
    Simulator, Time, TransitionResult,
};

const PERIOD: f64 = 0.001;

type EventLog = Arc<Mutex<Vec<String>>>;

/// Emits one unit every `PERIOD` seconds.
struct Genr {
    out: Pin,
}

impl Atomic<i32> for Genr {
    fn ta(&self) -> f64 {
        PERIOD
    }
    fn output_func(&mut self, ys: &mut Bag<i32>) -> TransitionResult {
        ys.push(PinValue::new(self.out, 1));
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

/// `dx/dt = -1` with a time event when `x` reaches zero; the internal
/// event resets `x` to `PERIOD`.
struct Countdown {
    log: EventLog,
}

impl OdeSystem<i32> for Countdown {
    fn num_state_variables(&self) -> usize {
        1
    }
    fn num_event_indicators(&self) -> usize {
        0
    }
    fn init(&mut self, q: &mut [f64]) {
        q[0] = PERIOD;
    }
    fn der_func(&self, _q: &[f64], dq: &mut [f64]) {
        dq[0] = -1.0;
    }
    fn state_event_func(&self, _q: &[f64], _z: &mut [f64]) {}
    fn time_event_func(&self, q: &[f64]) -> f64 {
        q[0]
    }
    fn internal_event(&mut self, q: &mut [f64], events: &[bool]) {
        assert!(events.iter().all(|&flag| !flag));
        self.log.lock().push("internal".to_string());
        q[0] = PERIOD;
    }
    fn external_event(&mut self, _q: &mut [f64], elapsed: f64, xs: &Bag<i32>) {
        self.log
            .lock()
            .push(format!("external e={elapsed} n={}", xs.len()));
    }
    fn confluent_event(&mut self, q: &mut [f64], events: &[bool], xs: &Bag<i32>) {
        self.log.lock().push("confluent".to_string());
        self.internal_event(q, events);
        self.external_event(q, 0.0, xs);
    }
    fn output_func(&mut self, _q: &[f64], _events: &[bool], _ys: &mut Bag<i32>) {}
}

#[test]
fn test_generator_and_time_event_fire_confluently() -> anyhow::Result<()> {
    let log: EventLog = Arc::default();
    let block = Hybrid::new(
        Box::new(Countdown {
            log: Arc::clone(&log),
        }),
        Box::new(CorrectedEuler::new(1e-6, 0.01)),
        Box::new(BisectionEventLocator::new(1e-7)),
    )?;

    let mut graph = Graph::new();
    let out = graph.pin();
    graph.add_atomic(Box::new(Genr { out }));
    let hybrid_id = graph.add_atomic(Box::new(block));
    graph.connect_to_model(out, hybrid_id)?;

    let mut sim = Simulator::from_graph(graph)?;
    while sim.next_event_time() < Time::real(PERIOD * 10.0) {
        sim.exec_next_event()?;
    }

    let log = log.lock();
    assert!(log.len() >= 3 * 5, "expected several confluent firings");
    // Every firing is confluent: the internal reset runs first, then the
    // external event with zero elapsed time and one received value.
    for chunk in log.chunks(3) {
        assert_eq!(chunk[0], "confluent");
        assert_eq!(chunk[1], "internal");
        assert_eq!(chunk[2], "external e=0 n=1");
    }
    Ok(())
}
