//! The optimistic (Time Warp) parallel simulator.
//!
//! Every atomic model gets a [`LogicalProcess`](crate::lp) that executes
//! speculatively. Each round, the earliest batch of processes runs in
//! parallel on a worker pool: fossil collection, then speculative output,
//! then state transitions. Global virtual time — the schedule's minimum —
//! is the horizon behind which no rollback can reach; events older than it
//! are committed to listeners and their history reclaimed. The committed
//! event stream is a prefix of what the sequential simulator would produce
//! for the same model.
//!
//! Models must support state saving, must not share state, and the model
//! structure must not change during the run.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Graph, ModelId, Routes};
use crate::lp::{Commit, LogicalProcess, Mailbox, RoundContext};
use crate::schedule::Schedule;
use crate::simulator::EventListener;
use crate::time::{Time, TimeValue};

/// Configuration of the optimistic simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptConfig {
    /// Number of models that process an event in every round. Larger
    /// batches raise the potential parallelism and the risk of wasted
    /// speculation.
    pub max_batch_size: usize,

    /// Worker thread count; `0` uses the hardware default.
    pub threads: usize,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            threads: 0,
        }
    }
}

/// A Time Warp simulator over the models of a routing graph.
pub struct OptSimulator<X, T = f64>
where
    T: TimeValue,
{
    lps: Vec<Option<LogicalProcess<X, T>>>,
    mailboxes: Vec<Arc<Mailbox<X, T>>>,
    routes: Routes,
    sched: Schedule<T>,
    activated: Mutex<Vec<ModelId>>,
    listeners: Vec<Box<dyn EventListener<X, T>>>,
    pool: rayon::ThreadPool,
    max_batch_size: usize,
}

impl<X, T> OptSimulator<X, T>
where
    X: Clone + Send + 'static,
    T: TimeValue + Send + Sync,
{
    /// Creates an optimistic simulator over the models of `graph`.
    ///
    /// # Errors
    ///
    /// Fails if the graph carries pending structural operations
    /// ([`Error::StructuralMisuse`]; structure changes are a sequential
    /// simulator feature), if any model's initial time advance is
    /// negative, or if the worker pool cannot be built.
    pub fn new(graph: Graph<X, T>, config: &OptConfig) -> Result<Self> {
        if graph.has_pending() {
            return Err(Error::StructuralMisuse {
                reason: "optimistic simulation does not support structural changes".into(),
            });
        }
        let (models, routes) = graph.into_parts();
        let mut lps = Vec::with_capacity(models.len());
        let mut mailboxes = Vec::with_capacity(models.len());
        let mut sched = Schedule::new();
        for (i, slot) in models.into_iter().enumerate() {
            let mailbox = Arc::new(Mailbox::new());
            match slot {
                Some(model) => {
                    let id = ModelId::from(i);
                    let lp = LogicalProcess::new(id, model, Arc::clone(&mailbox))?;
                    sched.schedule(id, lp.next_event_time());
                    lps.push(Some(lp));
                }
                None => lps.push(None),
            }
            mailboxes.push(mailbox);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| Error::WorkerPool {
                reason: e.to_string(),
            })?;
        Ok(Self {
            lps,
            mailboxes,
            routes,
            sched,
            activated: Mutex::new(Vec::new()),
            listeners: Vec::new(),
            pool,
            // A zero batch would make no progress; run at least one
            // process per round.
            max_batch_size: config.max_batch_size.max(1),
        })
    }

    /// The time of the earliest possible next event: the current global
    /// virtual time.
    #[must_use]
    pub fn next_event_time(&self) -> Time<T> {
        self.sched.min_priority()
    }

    /// Registers a listener. It observes only committed events, on the
    /// caller's thread.
    pub fn add_event_listener(&mut self, listener: Box<dyn EventListener<X, T>>) {
        self.listeners.push(listener);
    }

    /// Number of outputs produced speculatively, ahead of their commit.
    /// Any value above the committed output count measures wasted or
    /// still-unconfirmed speculation.
    #[must_use]
    pub fn early_output_count(&self) -> u64 {
        self.lps
            .iter()
            .flatten()
            .map(LogicalProcess::early_output_count)
            .sum()
    }

    /// Runs until global virtual time exceeds `stop` (inclusive of every
    /// micro-step at the stop instant), then commits events up to the
    /// horizon.
    ///
    /// # Errors
    ///
    /// Propagates fatal model errors from worker threads.
    pub fn exec_until_real(&mut self, stop: T) -> Result<()> {
        let stop = if stop.is_finite() {
            Time::new(stop, u32::MAX)
        } else {
            Time::infinity()
        };
        self.exec_until(stop)
    }

    /// Runs until global virtual time exceeds `stop`, then commits events
    /// up to `min(gvt, stop)`.
    ///
    /// # Errors
    ///
    /// Propagates fatal model errors from worker threads.
    pub fn exec_until(&mut self, stop: Time<T>) -> Result<()> {
        let mut gvt = self.sched.min_priority();
        while !gvt.is_infinite() && gvt <= stop {
            let batch = self.sched.batch(self.max_batch_size);
            for &id in &batch {
                self.mailboxes[id.index()].set_active(true);
            }

            // Parallel region: every worker owns one process from the
            // batch and touches other processes only through their
            // mailboxes.
            {
                let batch_set: HashSet<usize> = batch.iter().map(|id| id.index()).collect();
                let mut batch_refs: Vec<&mut LogicalProcess<X, T>> =
                    Vec::with_capacity(batch.len());
                for (i, slot) in self.lps.iter_mut().enumerate() {
                    if batch_set.contains(&i) {
                        batch_refs.push(slot.as_mut().expect("scheduled process exists"));
                    }
                }
                let ctx = RoundContext {
                    routes: &self.routes,
                    mailboxes: &self.mailboxes,
                    activated: &self.activated,
                };
                self.pool.install(|| {
                    batch_refs.into_par_iter().try_for_each(|lp| {
                        lp.fossil_collect(gvt);
                        lp.exec_output(&ctx)?;
                        lp.exec_delta()
                    })
                })?;
            }

            // Sequential region: reschedule the batch, then every process
            // activated by message delivery.
            for &id in &batch {
                let t = self.lps[id.index()]
                    .as_ref()
                    .expect("scheduled process exists")
                    .next_event_time();
                self.sched.schedule(id, t);
                self.mailboxes[id.index()].set_active(false);
            }
            loop {
                let id = match self.activated.lock().pop() {
                    Some(id) => id,
                    None => break,
                };
                let t = self.lps[id.index()]
                    .as_ref()
                    .expect("activated process exists")
                    .next_event_time();
                self.sched.schedule(id, t);
                self.mailboxes[id.index()].set_active(false);
            }
            self.flush_commits(&batch);

            gvt = self.sched.min_priority();
            log::trace!("gvt advanced to ({:?}, {})", gvt.t, gvt.c);
        }

        // Final fossil collection pass commits everything up to the
        // horizon actually reached.
        let effective = gvt.min(stop);
        let all: Vec<ModelId> = (0..self.lps.len())
            .filter(|&i| self.lps[i].is_some())
            .map(ModelId::from)
            .collect();
        for &id in &all {
            if let Some(lp) = self.lps[id.index()].as_mut() {
                lp.fossil_collect(effective);
            }
        }
        self.flush_commits(&all);
        Ok(())
    }

    /// Reports the commit buffers of the given processes to listeners, on
    /// the caller's thread.
    fn flush_commits(&mut self, ids: &[ModelId]) {
        let lps = &mut self.lps;
        let listeners = &mut self.listeners;
        for &id in ids {
            if let Some(lp) = lps[id.index()].as_mut() {
                for commit in lp.take_committed() {
                    match commit {
                        Commit::Output { value, t } => {
                            for listener in listeners.iter_mut() {
                                listener.output_event(id, &value, t);
                            }
                        }
                        Commit::State { t } => {
                            for listener in listeners.iter_mut() {
                                listener.state_change(id, t);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: OptConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, OptConfig::default());

        let config: OptConfig =
            serde_json::from_str(r#"{"max_batch_size": 8, "threads": 2}"#).unwrap();
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.threads, 2);
    }
}
