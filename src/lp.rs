//! Logical processes: per-model speculative executors for the optimistic
//! simulator.
//!
//! Each atomic model is wrapped in a [`LogicalProcess`] that consumes
//! messages from a locked mailbox, speculatively computes outputs assuming
//! its next internal event happens, checkpoints state before every
//! transition, and repairs mis-speculation by rolling back and
//! broadcasting anti-messages to every process it has ever sent to.
//! Fossil collection trims history older than global virtual time and
//! records the events that became definitive, for later delivery to
//! listeners outside the parallel region.

use std::collections::{BTreeSet, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::graph::{ModelId, Routes};
use crate::model::{Atomic, Bag, PinValue, Snapshot};
use crate::time::{Time, TimeValue};

/// A value in flight between two logical processes, or retained in a
/// process's history lists.
pub(crate) struct Envelope<X, T>
where
    T: TimeValue,
{
    pub(crate) t: Time<T>,
    pub(crate) src: ModelId,
    pub(crate) value: PinValue<X>,
}

/// A message deliverable to a mailbox.
pub(crate) enum MailMsg<X, T>
where
    T: TimeValue,
{
    /// A value delivered at a time.
    Io(Envelope<X, T>),
    /// An anti-message: discard everything `src` sent at or after `t`.
    Rollback { src: ModelId, t: Time<T> },
}

impl<X, T: TimeValue> MailMsg<X, T> {
    fn time(&self) -> Time<T> {
        match self {
            MailMsg::Io(env) => env.t,
            MailMsg::Rollback { t, .. } => *t,
        }
    }
}

/// The externally writable side of a logical process: its input queue and
/// active flag, the only LP state other threads may touch.
pub(crate) struct Mailbox<X, T>
where
    T: TimeValue,
{
    queue: Mutex<Vec<MailMsg<X, T>>>,
    active: AtomicBool,
}

impl<X, T: TimeValue> Mailbox<X, T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Enqueues a message; returns `true` if the process was inactive and
    /// is activated by this delivery.
    pub(crate) fn post(&self, msg: MailMsg<X, T>) -> bool {
        let mut queue = self.queue.lock();
        queue.push(msg);
        !self.active.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_active(&self, flag: bool) {
        self.active.store(flag, Ordering::Release);
    }

    /// Earliest timestamp waiting in the queue, or infinity.
    pub(crate) fn min_time(&self) -> Time<T> {
        let queue = self.queue.lock();
        queue
            .iter()
            .fold(Time::infinity(), |acc, msg| acc.min(msg.time()))
    }

    fn drain(&self) -> Vec<MailMsg<X, T>> {
        mem::take(&mut *self.queue.lock())
    }
}

/// Shared context for one parallel round.
pub(crate) struct RoundContext<'a, X, T>
where
    T: TimeValue,
{
    pub(crate) routes: &'a Routes,
    pub(crate) mailboxes: &'a [Arc<Mailbox<X, T>>],
    pub(crate) activated: &'a Mutex<Vec<ModelId>>,
}

impl<X, T: TimeValue> RoundContext<'_, X, T> {
    fn send(&self, target: ModelId, msg: MailMsg<X, T>) {
        if self.mailboxes[target.index()].post(msg) {
            self.activated.lock().push(target);
        }
    }
}

/// An event that crossed the commit horizon and may be reported to
/// listeners.
pub(crate) enum Commit<X, T>
where
    T: TimeValue,
{
    Output { value: PinValue<X>, t: Time<T> },
    State { t: Time<T> },
}

/// The speculative executor assigned to one atomic model.
pub(crate) struct LogicalProcess<X, T>
where
    T: TimeValue,
{
    id: ModelId,
    model: Box<dyn Atomic<X, T>>,
    /// Time of the state currently held by the model.
    t_l: Time<T>,
    /// The model's time advance in that state.
    time_advance: T,
    /// Delivered but not yet consumed messages, time-ordered.
    avail: VecDeque<Envelope<X, T>>,
    /// Consumed messages kept for rollback replay, time-ordered.
    used: VecDeque<Envelope<X, T>>,
    /// Outputs believed good, time-ordered.
    output: VecDeque<Envelope<X, T>>,
    /// Retracted outputs awaiting release, time-ordered.
    discard: VecDeque<Envelope<X, T>>,
    /// Saved states, time-ordered.
    chk_pt: VecDeque<(Time<T>, Snapshot)>,
    /// Every process this one has ever sent a message to.
    recipients: BTreeSet<ModelId>,
    mailbox: Arc<Mailbox<X, T>>,
    /// Time of a rollback that still has to be broadcast.
    rb_pending: Option<Time<T>>,
    committed: Vec<Commit<X, T>>,
    early_outputs: u64,
}

impl<X: Clone, T: TimeValue> LogicalProcess<X, T> {
    pub(crate) fn new(
        id: ModelId,
        model: Box<dyn Atomic<X, T>>,
        mailbox: Arc<Mailbox<X, T>>,
    ) -> Result<Self> {
        let time_advance = model.ta();
        if time_advance.is_finite() && time_advance < T::zero() {
            return Err(Error::NegativeTimeAdvance { model: id });
        }
        Ok(Self {
            id,
            model,
            t_l: Time::zero(),
            time_advance,
            avail: VecDeque::new(),
            used: VecDeque::new(),
            output: VecDeque::new(),
            discard: VecDeque::new(),
            chk_pt: VecDeque::new(),
            recipients: BTreeSet::new(),
            mailbox,
            rb_pending: None,
            committed: Vec::new(),
            early_outputs: 0,
        })
    }

    /// Time of the presumed next internal event.
    fn t_self(&self) -> Time<T> {
        if self.time_advance.is_finite() {
            self.t_l.advance(Time::real(self.time_advance))
        } else {
            Time::infinity()
        }
    }

    /// Smallest of the local next event, the earliest unconsumed message,
    /// the earliest undelivered message, and any pending rollback.
    pub(crate) fn next_event_time(&self) -> Time<T> {
        let mut t = self.t_self();
        if let Some(front) = self.avail.front() {
            t = t.min(front.t);
        }
        t = t.min(self.mailbox.min_time());
        if let Some(rb) = self.rb_pending {
            t = t.min(rb);
        }
        t
    }

    pub(crate) fn early_output_count(&self) -> u64 {
        self.early_outputs
    }

    pub(crate) fn take_committed(&mut self) -> Vec<Commit<X, T>> {
        mem::take(&mut self.committed)
    }

    /// Broadcast any pending anti-message, then speculatively produce the
    /// output for the presumed next internal event and route it.
    pub(crate) fn exec_output(&mut self, ctx: &RoundContext<'_, X, T>) -> Result<()> {
        if let Some(rb_t) = self.rb_pending.take() {
            log::trace!("lp {} broadcasting anti-message", self.id);
            for &target in &self.recipients {
                ctx.send(
                    target,
                    MailMsg::Rollback {
                        src: self.id,
                        t: rb_t,
                    },
                );
            }
        }
        if !self.time_advance.is_finite() {
            return Ok(());
        }
        let msg_t = self.t_self();
        let mut ys = Bag::new();
        self.model
            .output_func(&mut ys)
            .map_err(|source| Error::Model {
                model: self.id,
                source,
            })?;
        self.early_outputs += ys.len() as u64;
        let mut routed = Vec::new();
        for pv in ys {
            routed.clear();
            ctx.routes.route(pv.pin, &mut routed);
            for &(pin, target) in &routed {
                if target == self.id {
                    return Err(Error::SelfInfluence { model: self.id });
                }
                self.recipients.insert(target);
                ctx.send(
                    target,
                    MailMsg::Io(Envelope {
                        t: msg_t,
                        src: self.id,
                        value: PinValue::new(pin, pv.value.clone()),
                    }),
                );
            }
            debug_assert!(self.output.back().map_or(true, |e| e.t <= msg_t));
            self.output.push_back(Envelope {
                t: msg_t,
                src: self.id,
                value: pv,
            });
        }
        Ok(())
    }

    /// Drain the mailbox, roll back if an intruder or a cancellation
    /// invalidated consumed input, then apply the next state transition.
    ///
    /// A round that rolled back does not transition: the next round's
    /// [`LogicalProcess::exec_output`] must first re-speculate the output
    /// of the restored state, otherwise the re-executed internal event
    /// would commit without its output ever being re-sent.
    pub(crate) fn exec_delta(&mut self) -> Result<()> {
        let mut rolled_back = false;
        for msg in self.mailbox.drain() {
            let mut used_cancelled = false;
            let (msg_t, is_io) = match msg {
                MailMsg::Rollback { src, t } => {
                    self.avail.retain(|e| !(e.src == src && e.t >= t));
                    let before = self.used.len();
                    self.used.retain(|e| !(e.src == src && e.t >= t));
                    used_cancelled = self.used.len() != before;
                    (t, false)
                }
                MailMsg::Io(env) => {
                    let t = env.t;
                    let at = insertion_point(&self.avail, t);
                    self.avail.insert(at, env);
                    (t, true)
                }
            };
            if (is_io && msg_t < self.t_l) || used_cancelled {
                self.rollback(msg_t)?;
                rolled_back = true;
            }
        }
        if rolled_back {
            return Ok(());
        }

        let t_self = self.t_self();
        let mut t_n = t_self;
        if let Some(front) = self.avail.front() {
            if front.t < t_n {
                t_n = front.t;
            }
        }
        let mut xs = Bag::new();
        while self.avail.front().map_or(false, |e| e.t == t_n) {
            let env = self.avail.pop_front().expect("front exists");
            debug_assert!(self.used.back().map_or(true, |u| env.t >= u.t));
            xs.push(env.value.clone());
            self.used.push_back(env);
        }
        debug_assert!(t_n <= t_self);

        // An earlier event preempts the internal event we already produced
        // output for: retract that output and schedule an anti-message.
        if self.rb_pending.is_none() && self.time_advance.is_finite() && t_n < t_self {
            self.rb_pending = Some(t_self);
            while self.output.back().map_or(false, |e| e.t == t_self) {
                let env = self.output.pop_back().expect("back exists");
                let at = insertion_point(&self.discard, env.t);
                self.discard.insert(at, env);
            }
        }

        if t_n.is_infinite() {
            return Ok(());
        }
        debug_assert!(self.t_l <= t_n);

        let snap = self
            .model
            .save_state()
            .ok_or(Error::StateSavingUnsupported { model: self.id })?;
        self.chk_pt.push_back((self.t_l, snap));

        let step = if xs.is_empty() {
            self.model.delta_int()
        } else if t_n == t_self {
            self.model.delta_conf(&xs)
        } else {
            self.model.delta_ext(t_n.elapsed_since(self.t_l), &xs)
        };
        step.map_err(|source| Error::Model {
            model: self.id,
            source,
        })?;
        self.time_advance = self.model.ta();
        if self.time_advance.is_finite() && self.time_advance < T::zero() {
            return Err(Error::NegativeTimeAdvance { model: self.id });
        }
        self.t_l = t_n.after_epsilon();
        Ok(())
    }

    /// Restore the newest state no later than `to` and retract everything
    /// produced after it.
    fn rollback(&mut self, to: Time<T>) -> Result<()> {
        log::debug!("lp {} rolling back", self.id);
        // Retract outputs sent after the intruding message.
        while self.output.back().map_or(false, |e| e.t > to) {
            let env = self.output.pop_back().expect("back exists");
            let at = insertion_point(&self.discard, env.t);
            self.discard.insert(at, env);
        }
        // Pop checkpoints newer than the intruder, then restore from and
        // consume the one that remains on top.
        while self.chk_pt.back().map_or(false, |(t, _)| *t > to) {
            let (_, snap) = self.chk_pt.pop_back().expect("back exists");
            self.model.gc_state(snap);
        }
        let (t, snap) = self
            .chk_pt
            .pop_back()
            .expect("rollback without a checkpoint");
        self.t_l = t;
        self.model.restore_state(&snap);
        self.model.gc_state(snap);
        self.time_advance = self.model.ta();
        if self.time_advance.is_finite() && self.time_advance < T::zero() {
            return Err(Error::NegativeTimeAdvance { model: self.id });
        }
        // Inputs consumed at or after the restored time must be replayed;
        // merge them back into the available list in time order.
        while self.used.back().map_or(false, |e| e.t >= self.t_l) {
            let env = self.used.pop_back().expect("back exists");
            let at = insertion_point(&self.avail, env.t);
            self.avail.insert(at, env);
        }
        // Everything this process sent from the next micro-step on is
        // suspect.
        let t_bad = to.after_epsilon();
        self.rb_pending = Some(match self.rb_pending {
            Some(cur) if cur < t_bad => cur,
            _ => t_bad,
        });
        Ok(())
    }

    /// Discard history strictly older than `gvt`, retaining the newest
    /// checkpoint at or before it, and record the events that became
    /// definitive.
    pub(crate) fn fossil_collect(&mut self, gvt: Time<T>) {
        while self.chk_pt.len() >= 2 && self.chk_pt[1].0 < gvt {
            let (t, snap) = self.chk_pt.pop_front().expect("front exists");
            self.committed.push(Commit::State { t });
            self.model.gc_state(snap);
        }
        while self.used.front().map_or(false, |e| e.t < gvt) {
            self.used.pop_front();
        }
        let mut gc_bag = Bag::new();
        while self.discard.front().map_or(false, |e| e.t < gvt) {
            gc_bag.push(self.discard.pop_front().expect("front exists").value);
        }
        while self.output.front().map_or(false, |e| e.t < gvt) {
            let env = self.output.pop_front().expect("front exists");
            self.committed.push(Commit::Output {
                value: env.value.clone(),
                t: env.t,
            });
            gc_bag.push(env.value);
        }
        if !gc_bag.is_empty() {
            self.model.gc_output(gc_bag);
        }
    }
}

impl<X, T: TimeValue> Drop for LogicalProcess<X, T> {
    fn drop(&mut self) {
        while let Some((_, snap)) = self.chk_pt.pop_front() {
            self.model.gc_state(snap);
        }
        let bag: Bag<X> = self
            .output
            .drain(..)
            .chain(self.discard.drain(..))
            .map(|env| env.value)
            .collect();
        if !bag.is_empty() {
            self.model.gc_output(bag);
        }
    }
}

/// Index at which an envelope with time `t` is inserted to keep a list
/// time-ordered, after any existing entries with the same time.
fn insertion_point<X, T: TimeValue>(list: &VecDeque<Envelope<X, T>>, t: Time<T>) -> usize {
    list.iter().position(|e| e.t > t).unwrap_or(list.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::TransitionResult;
    use crate::graph::Pin;

    /// Counts its transitions; checkpointable.
    struct Counter {
        count: u32,
    }

    impl Atomic<i32> for Counter {
        fn ta(&self) -> f64 {
            1.0
        }
        fn output_func(&mut self, _ys: &mut Bag<i32>) -> TransitionResult {
            Ok(())
        }
        fn delta_int(&mut self) -> TransitionResult {
            self.count += 1;
            Ok(())
        }
        fn delta_ext(&mut self, _elapsed: f64, xs: &Bag<i32>) -> TransitionResult {
            self.count += xs.len() as u32;
            Ok(())
        }
        fn delta_conf(&mut self, xs: &Bag<i32>) -> TransitionResult {
            self.delta_int()?;
            self.delta_ext(0.0, xs)
        }
        fn save_state(&mut self) -> Option<Snapshot> {
            Some(Box::new(self.count))
        }
        fn restore_state(&mut self, state: &Snapshot) {
            self.count = *state.downcast_ref::<u32>().expect("counter snapshot");
        }
    }

    fn io(src: usize, t: Time<f64>, value: i32) -> MailMsg<i32, f64> {
        MailMsg::Io(Envelope {
            t,
            src: ModelId::from(src),
            value: PinValue::new(Pin::from(0usize), value),
        })
    }

    #[test]
    fn test_straggler_triggers_rollback_and_replay() {
        let mailbox = Arc::new(Mailbox::new());
        let mut lp = LogicalProcess::new(
            ModelId::from(9usize),
            Box::new(Counter { count: 0 }),
            Arc::clone(&mailbox),
        )
        .unwrap();

        // Consume a message at t = 0.5 before the internal event at 1.0.
        mailbox.post(io(1, Time::real(0.5), 10));
        lp.exec_delta().unwrap();
        assert_eq!(lp.t_l, Time::new(0.5, 1));
        assert_eq!(lp.used.len(), 1);
        // The speculative output for t = 1.0 was wrong.
        assert_eq!(lp.rb_pending, Some(Time::real(1.0)));

        // A straggler arrives at t = 0.2: roll back to the initial state.
        // The round that rolled back does not transition.
        mailbox.post(io(2, Time::real(0.2), 20));
        lp.exec_delta().unwrap();
        assert_eq!(lp.t_l, Time::zero());
        // Both the straggler and the replayed 0.5 message are available,
        // in time order.
        assert_eq!(lp.avail.len(), 2);
        assert_eq!(lp.avail.front().unwrap().t, Time::real(0.2));
        assert_eq!(lp.avail.back().unwrap().t, Time::real(0.5));
        // An anti-message is scheduled just after the straggler.
        assert_eq!(lp.rb_pending, Some(Time::new(0.2, 1)));

        // Subsequent rounds re-consume the inputs in order.
        lp.rb_pending = None;
        lp.exec_delta().unwrap();
        assert_eq!(lp.t_l, Time::new(0.2, 1));
        lp.exec_delta().unwrap();
        assert_eq!(lp.t_l, Time::new(0.5, 1));
        assert!(lp.avail.is_empty());
    }

    #[test]
    fn test_anti_message_cancels_unconsumed_input() {
        let mailbox = Arc::new(Mailbox::new());
        let mut lp = LogicalProcess::new(
            ModelId::from(9usize),
            Box::new(Counter { count: 0 }),
            Arc::clone(&mailbox),
        )
        .unwrap();

        mailbox.post(io(1, Time::real(2.0), 10));
        mailbox.post(MailMsg::Rollback {
            src: ModelId::from(1usize),
            t: Time::real(1.5),
        });
        lp.exec_delta().unwrap();
        // The message was cancelled before consumption; only the internal
        // event at t = 1.0 ran.
        assert!(lp.avail.is_empty());
        assert!(lp.used.is_empty());
        assert_eq!(lp.t_l, Time::new(1.0, 1));
        assert!(lp.rb_pending.is_none());
    }

    #[test]
    fn test_fossil_collection_retains_latest_checkpoint() {
        let mailbox = Arc::new(Mailbox::new());
        let mut lp = LogicalProcess::new(
            ModelId::from(0usize),
            Box::new(Counter { count: 0 }),
            Arc::clone(&mailbox),
        )
        .unwrap();
        for _ in 0..4 {
            lp.exec_delta().unwrap();
        }
        assert_eq!(lp.chk_pt.len(), 4);
        lp.fossil_collect(Time::real(2.5));
        // Checkpoints at (0,0), (1,1) dropped; (2,1) retained as the
        // newest at or before gvt; (3,1) still speculative.
        assert_eq!(lp.chk_pt.len(), 2);
        assert_eq!(lp.chk_pt.front().unwrap().0, Time::new(2.0, 1));
    }
}
