//! The evaluation broker: prioritized, at-least-once dispatch of
//! evaluations to scheduler classes.
//!
//! Producers enqueue evaluations; consumers (sub-schedulers) issue blocking
//! dequeues against the classes they can handle. The broker sorts ready work
//! by priority per class, serializes evaluations of the same job, defers
//! admission through relative waits and absolute deadlines, and tracks every
//! delivery under a unique token. Deliveries that are not acked within the
//! nack timeout are implicitly nacked and redelivered with compounding
//! back-off until the delivery limit diverts them to [`FAILED_QUEUE`].
//!
//! All broker state lives behind one reader-writer lock. Timers and the
//! delayed-evals watcher run on their own threads and re-enter through the
//! public API, so they take the lock themselves and never run under a
//! caller's critical section.

use crate::delay::DelayHeap;
use crate::error::BrokerError;
use crate::evaluation::{Evaluation, JobKey};
use crate::queue::PendingQueue;
use crate::stats::{BrokerStats, MetricsSink};
use crate::timer::DeadlineTimer;
use crossbeam_channel::{bounded, select, tick, Receiver, Select, Sender};
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};
use uuid::Uuid;

/// Scheduler class receiving evaluations that exhausted their delivery
/// limit, so the leader can observe them and finalize the failure.
pub const FAILED_QUEUE: &str = "_failed";

/// Broker tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Time from delivery to implicit nack when no ack arrives.
    pub nack_timeout: Duration,
    /// Number of deliveries after which an evaluation is diverted to
    /// [`FAILED_QUEUE`] instead of redelivered.
    pub delivery_limit: usize,
    /// Hold-off before the first redelivery of a nacked evaluation.
    pub initial_nack_delay: Duration,
    /// Per-additional-attempt compounding hold-off after the first nack.
    pub subsequent_nack_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            nack_timeout: Duration::from_secs(60),
            delivery_limit: 3,
            initial_nack_delay: Duration::from_secs(5),
            subsequent_nack_delay: Duration::from_secs(60),
        }
    }
}

/// Source of unique delivery tokens.
///
/// Tokens bind a delivery to its ack/nack; a fresh token per delivery keeps
/// a consumer that dequeued before a redelivery or leadership change from
/// resolving work it no longer owns.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
}

/// Default token source backed by v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokens;

impl TokenSource for UuidTokens {
    fn token(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Builder injecting the broker's collaborators. [`EvalBroker::new`] covers
/// the common case; the builder exists for tests that need deterministic
/// tokens or tie-breaking.
pub struct BrokerBuilder {
    config: BrokerConfig,
    token_source: Arc<dyn TokenSource>,
    rng_seed: Option<u64>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            token_source: Arc::new(UuidTokens),
            rng_seed: None,
        }
    }

    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> BrokerBuilder {
        self.token_source = source;
        self
    }

    /// Seed the class tie-break RNG for deterministic dispatch.
    pub fn rng_seed(mut self, seed: u64) -> BrokerBuilder {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<EvalBroker, BrokerError> {
        if self.config.delivery_limit == 0 {
            return Err(BrokerError::InvalidConfig(
                "delivery_limit must be at least 1",
            ));
        }
        let rng = match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let (update_tx, update_rx) = bounded(1);
        let shared = Arc::new(Shared {
            config: self.config,
            token_source: self.token_source,
            rng: Mutex::new(rng),
            inner: RwLock::new(Inner {
                enabled: false,
                stats: BrokerStats::default(),
                evals: HashMap::new(),
                job_evals: HashMap::new(),
                blocked: HashMap::new(),
                ready: HashMap::new(),
                unack: HashMap::new(),
                waiting: HashMap::new(),
                requeue: HashMap::new(),
                time_wait: HashMap::new(),
                delay_heap: DelayHeap::new(),
                delayed_update_tx: update_tx,
                delayed_update_rx: update_rx,
                delayed_cancel_tx: None,
            }),
        });
        Ok(EvalBroker { shared })
    }
}

/// In-flight delivery: the evaluation, its token, and the armed nack timer.
struct UnackedEval {
    eval: Arc<Evaluation>,
    token: String,
    nack_timer: DeadlineTimer,
}

/// Per-class 1-slot wake-up channel. Signals coalesce, and dropping the
/// sender on flush wakes every parked dequeue.
struct WaitChannel {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WaitChannel {
    fn new() -> WaitChannel {
        let (tx, rx) = bounded(1);
        WaitChannel { tx, rx }
    }
}

/// All mutable broker state, guarded by the one reader-writer lock.
struct Inner {
    enabled: bool,
    stats: BrokerStats,
    /// Queued evaluation ids mapped to their delivery-attempt count; doubles
    /// as the enqueue de-duplication set.
    evals: HashMap<String, usize>,
    /// Current in-flight-or-ready evaluation per job key.
    job_evals: HashMap<JobKey, String>,
    /// Evaluations parked behind their job's current evaluation.
    blocked: HashMap<JobKey, PendingQueue>,
    /// Ready queues per scheduler class.
    ready: HashMap<String, PendingQueue>,
    /// In-flight deliveries by evaluation id.
    unack: HashMap<String, UnackedEval>,
    /// Per-class dequeue wake-up channels.
    waiting: HashMap<String, WaitChannel>,
    /// Evaluations to re-enqueue iff their producer's token is acked.
    requeue: HashMap<String, Arc<Evaluation>>,
    /// Armed relative-wait timers by evaluation id.
    time_wait: HashMap<String, DeadlineTimer>,
    /// Evaluations held until an absolute deadline.
    delay_heap: DelayHeap,
    delayed_update_tx: Sender<()>,
    delayed_update_rx: Receiver<()>,
    delayed_cancel_tx: Option<Sender<()>>,
}

struct Shared {
    config: BrokerConfig,
    token_source: Arc<dyn TokenSource>,
    rng: Mutex<SmallRng>,
    inner: RwLock<Inner>,
}

/// Prioritized, at-least-once dispatch queue handing evaluations to
/// scheduler classes. Cheap to clone; all clones share one broker.
///
/// The broker starts disabled and should only be enabled on the active
/// leader. Disabling flushes all state, so a broker that loses leadership
/// drops its queues and the replicated log re-seeds its successor.
#[derive(Clone)]
pub struct EvalBroker {
    shared: Arc<Shared>,
}

impl EvalBroker {
    /// Create a disabled broker with default collaborators.
    pub fn new(config: BrokerConfig) -> Result<EvalBroker, BrokerError> {
        BrokerBuilder::new(config).build()
    }

    /// Builder for injecting a token source or a deterministic RNG seed.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn enabled(&self) -> bool {
        self.shared.inner.read().enabled
    }

    /// Enable or disable dispatch. Idempotent. Enabling starts the
    /// delayed-evals watcher; disabling flushes all state, stops every
    /// timer, and wakes parked dequeues so they observe the disabled broker.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.shared.inner.write();
        let prev = inner.enabled;
        inner.enabled = enabled;

        if enabled && !prev {
            let (cancel_tx, cancel_rx) = bounded(1);
            inner.delayed_cancel_tx = Some(cancel_tx);
            let update_rx = inner.delayed_update_rx.clone();
            let weak = Arc::downgrade(&self.shared);
            thread::spawn(move || run_delayed_evals_watcher(&weak, &update_rx, &cancel_rx));
            debug!("eval broker enabled");
        }
        if !enabled {
            flush(&mut inner);
            debug!("eval broker disabled and flushed");
        }
    }

    /// Enqueue a single evaluation. A no-op while disabled; duplicates of an
    /// already-queued id are dropped.
    pub fn enqueue(&self, eval: Arc<Evaluation>) {
        let mut inner = self.shared.inner.write();
        process_enqueue(&self.shared, &mut inner, eval, None);
    }

    /// Enqueue a batch under one lock acquisition so unblocked dequeues see
    /// the highest-priority evaluation of the batch.
    ///
    /// A pair carries the delivery token when a sub-scheduler re-submits an
    /// evaluation it produced while its own evaluation is still in flight;
    /// such work is held and only admitted once that token is acked. A nack
    /// drops it, since it was produced by a scheduler run that failed.
    pub fn enqueue_all(&self, evals: Vec<(Arc<Evaluation>, Option<String>)>) {
        let mut inner = self.shared.inner.write();
        for (eval, token) in evals {
            process_enqueue(&self.shared, &mut inner, eval, token.as_deref());
        }
    }

    /// Blocking dequeue across `schedulers`.
    ///
    /// Returns the next evaluation and a unique delivery token, `Ok(None)`
    /// once `timeout` elapses without work, or [`BrokerError::Disabled`]. A
    /// zero timeout blocks until work arrives or the broker is disabled.
    pub fn dequeue(
        &self,
        schedulers: &[&str],
        timeout: Duration,
    ) -> Result<Option<(Arc<Evaluation>, String)>, BrokerError> {
        if schedulers.is_empty() {
            return Ok(None);
        }
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if let Some(delivery) = self.scan_for_schedulers(schedulers)? {
                return Ok(Some(delivery));
            }
            if !self.wait_for_schedulers(schedulers, deadline) {
                return Ok(None);
            }
        }
    }

    /// One pass over the requested ready queues: find the classes whose head
    /// carries the maximum priority, pick one fairly, and deliver its head.
    fn scan_for_schedulers(
        &self,
        schedulers: &[&str],
    ) -> Result<Option<(Arc<Evaluation>, String)>, BrokerError> {
        let mut inner = self.shared.inner.write();
        if !inner.enabled {
            return Err(BrokerError::Disabled);
        }

        let mut eligible: Vec<&str> = Vec::new();
        let mut eligible_priority = 0;
        for &class in schedulers {
            let Some(head) = inner.ready.get(class).and_then(|queue| queue.peek()) else {
                continue;
            };
            if eligible.is_empty() || head.priority > eligible_priority {
                eligible.clear();
                eligible.push(class);
                eligible_priority = head.priority;
            } else if head.priority == eligible_priority {
                eligible.push(class);
            }
        }

        let class = match eligible.len() {
            0 => return Ok(None),
            1 => eligible[0],
            n => {
                // Equal head priorities on several classes; pick one at
                // random so work spreads fairly across them.
                let offset = self.shared.rng.lock().gen_range(0..n);
                eligible[offset]
            }
        };
        Ok(Some(self.dequeue_for_sched(&mut inner, class)))
    }

    /// Pop the head of `class`, mint a token, and arm the nack timer.
    fn dequeue_for_sched(&self, inner: &mut Inner, class: &str) -> (Arc<Evaluation>, String) {
        let eval = inner
            .ready
            .get_mut(class)
            .and_then(PendingQueue::pop)
            .expect("scan selected a class with ready work");

        let token = self.shared.token_source.token();
        let weak = Arc::downgrade(&self.shared);
        let timer_id = eval.id.clone();
        let timer_token = token.clone();
        let nack_timer = DeadlineTimer::spawn(self.shared.config.nack_timeout, move || {
            if let Some(shared) = weak.upgrade() {
                let broker = EvalBroker { shared };
                let _ = broker.nack(&timer_id, &timer_token);
            }
        });

        inner.unack.insert(
            eval.id.clone(),
            UnackedEval {
                eval: Arc::clone(&eval),
                token: token.clone(),
                nack_timer,
            },
        );
        *inner.evals.entry(eval.id.clone()).or_insert(0) += 1;

        inner.stats.total_ready -= 1;
        inner.stats.total_unacked += 1;
        let by_sched = inner.stats.by_scheduler.entry(class.to_string()).or_default();
        by_sched.ready -= 1;
        by_sched.unacked += 1;

        trace!(id = %eval.id, class, "delivered evaluation");
        (eval, token)
    }

    /// Park until any requested class signals ready work or the deadline
    /// passes. Returns true when the caller should rescan.
    fn wait_for_schedulers(&self, schedulers: &[&str], deadline: Option<Instant>) -> bool {
        let receivers: Vec<Receiver<()>> = {
            let mut inner = self.shared.inner.write();
            schedulers
                .iter()
                .map(|&class| {
                    inner
                        .waiting
                        .entry(class.to_string())
                        .or_insert_with(WaitChannel::new)
                        .rx
                        .clone()
                })
                .collect()
        };

        let mut select = Select::new();
        for rx in &receivers {
            select.recv(rx);
        }
        let oper = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match select.select_timeout(remaining) {
                    Ok(oper) => oper,
                    Err(_) => return false,
                }
            }
            None => select.select(),
        };

        // Drain the coalesced signal. A closed channel means a flush ran,
        // and the rescan will observe the disabled broker.
        let index = oper.index();
        let _ = oper.recv(&receivers[index]);
        true
    }

    /// Token for the in-flight delivery of `eval_id`, if one exists.
    pub fn outstanding(&self, eval_id: &str) -> Option<String> {
        self.shared
            .inner
            .read()
            .unack
            .get(eval_id)
            .map(|unack| unack.token.clone())
    }

    /// Re-arm the nack timer of an in-flight delivery to the full nack
    /// timeout, for consumers that are still making progress.
    pub fn outstanding_reset(&self, eval_id: &str, token: &str) -> Result<(), BrokerError> {
        let inner = self.shared.inner.read();
        let unack = inner.unack.get(eval_id).ok_or(BrokerError::NotOutstanding)?;
        if unack.token != token {
            return Err(BrokerError::TokenMismatch);
        }
        if !unack.nack_timer.reset(self.shared.config.nack_timeout) {
            return Err(BrokerError::NackTimeoutReached);
        }
        Ok(())
    }

    /// Stop the nack timer while the consumer enters a potentially unbounded
    /// operation. [`Self::resume_nack_timeout`] re-arms it afterwards.
    pub fn pause_nack_timeout(&self, eval_id: &str, token: &str) -> Result<(), BrokerError> {
        let inner = self.shared.inner.read();
        let unack = inner.unack.get(eval_id).ok_or(BrokerError::NotOutstanding)?;
        if unack.token != token {
            return Err(BrokerError::TokenMismatch);
        }
        if !unack.nack_timer.pause() {
            return Err(BrokerError::NackTimeoutReached);
        }
        Ok(())
    }

    /// Re-arm a paused nack timer to the full nack timeout.
    pub fn resume_nack_timeout(&self, eval_id: &str, token: &str) -> Result<(), BrokerError> {
        let inner = self.shared.inner.write();
        let unack = inner.unack.get(eval_id).ok_or(BrokerError::NotOutstanding)?;
        if unack.token != token {
            return Err(BrokerError::TokenMismatch);
        }
        unack.nack_timer.reset(self.shared.config.nack_timeout);
        Ok(())
    }

    /// Positively acknowledge a delivery, retiring the evaluation. Promotes
    /// the job's next blocked evaluation and admits any evaluation requeued
    /// under this token.
    pub fn ack(&self, eval_id: &str, token: &str) -> Result<(), BrokerError> {
        let mut inner = self.shared.inner.write();

        // The requeue entry dies with this token no matter how the ack
        // resolves; only a successful ack admits it.
        let requeued = inner.requeue.remove(token);

        let Some(unack) = inner.unack.get(eval_id) else {
            return Err(BrokerError::NotOutstanding);
        };
        if unack.token != token {
            return Err(BrokerError::TokenMismatch);
        }
        if !unack.nack_timer.stop() {
            // The expired timer is already redelivering this evaluation; a
            // second resolution would fork its lifecycle.
            return Err(BrokerError::AckedAfterNack);
        }

        let unack = inner.unack.remove(eval_id).expect("unack entry just seen");
        let attempts = inner.evals.remove(eval_id).unwrap_or(0);

        inner.stats.total_unacked -= 1;
        let class = unacked_stats_class(&self.shared.config, attempts, &unack.eval);
        inner
            .stats
            .by_scheduler
            .entry(class.to_string())
            .or_default()
            .unacked -= 1;

        let key = unack.eval.job_key();
        inner.job_evals.remove(&key);

        // Promote the next evaluation blocked on this job, if any.
        let promoted = inner.blocked.get_mut(&key).and_then(PendingQueue::pop);
        if inner.blocked.get(&key).is_some_and(PendingQueue::is_empty) {
            inner.blocked.remove(&key);
        }
        if let Some(next) = promoted {
            inner.stats.total_blocked -= 1;
            let class = next.scheduler.clone();
            enqueue_locked(&mut inner, next, class);
        }

        if let Some(eval) = requeued {
            process_enqueue(&self.shared, &mut inner, eval, None);
        }

        trace!(id = %eval_id, "acked evaluation");
        Ok(())
    }

    /// Negatively acknowledge a delivery. The evaluation is redelivered
    /// after a compounding back-off, or diverted to [`FAILED_QUEUE`] once
    /// the delivery limit is reached. Expired nack timers land here too.
    pub fn nack(&self, eval_id: &str, token: &str) -> Result<(), BrokerError> {
        let mut inner = self.shared.inner.write();

        // Work requeued under this token came from a scheduler run that
        // failed; drop it regardless of how the nack resolves.
        inner.requeue.remove(token);

        let Some(unack) = inner.unack.get(eval_id) else {
            return Err(BrokerError::NotOutstanding);
        };
        if unack.token != token {
            return Err(BrokerError::TokenMismatch);
        }
        let unack = inner.unack.remove(eval_id).expect("unack entry just seen");
        // Either we beat the timer or we are its firing path.
        unack.nack_timer.stop();

        let attempts = inner.evals.get(eval_id).copied().unwrap_or(0);

        inner.stats.total_unacked -= 1;
        let class = unacked_stats_class(&self.shared.config, attempts, &unack.eval);
        inner
            .stats
            .by_scheduler
            .entry(class.to_string())
            .or_default()
            .unacked -= 1;

        if attempts >= self.shared.config.delivery_limit {
            debug!(id = %eval_id, attempts, "delivery limit reached, diverting to failed queue");
            enqueue_locked(&mut inner, unack.eval, FAILED_QUEUE.to_string());
            return Ok(());
        }

        let delay = nack_reenqueue_delay(&self.shared.config, attempts);
        trace!(id = %eval_id, attempts, ?delay, "nacked evaluation");
        if delay.is_zero() {
            let class = unack.eval.scheduler.clone();
            enqueue_locked(&mut inner, unack.eval, class);
        } else {
            let eval = Arc::new(Evaluation {
                wait: Some(delay),
                ..(*unack.eval).clone()
            });
            process_waiting_enqueue(&self.shared, &mut inner, eval, delay);
        }
        Ok(())
    }

    /// Deep snapshot of the broker's occupancy gauges.
    pub fn stats(&self) -> BrokerStats {
        self.shared.inner.read().stats.clone()
    }

    /// Publish broker gauges to `sink` every `period` until `stop` signals
    /// or closes. Runs on the caller's thread.
    pub fn emit_stats(&self, period: Duration, stop: &Receiver<()>, sink: &dyn MetricsSink) {
        let ticker = tick(period);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let stats = self.stats();
                    sink.set_gauge(&["eval_broker", "total_ready"], stats.total_ready as f64);
                    sink.set_gauge(&["eval_broker", "total_unacked"], stats.total_unacked as f64);
                    sink.set_gauge(&["eval_broker", "total_blocked"], stats.total_blocked as f64);
                    sink.set_gauge(&["eval_broker", "total_waiting"], stats.total_waiting as f64);
                    for (class, sched) in &stats.by_scheduler {
                        sink.set_gauge(&["eval_broker", class, "ready"], sched.ready as f64);
                        sink.set_gauge(&["eval_broker", class, "unacked"], sched.unacked as f64);
                    }
                }
                recv(stop) -> _ => return,
            }
        }
    }
}

/// Gauge class an unacked delivery is charged against: once the attempt
/// count passes the delivery limit the delivery came from the failed queue,
/// so the decrement goes where the increment went.
fn unacked_stats_class<'a>(
    config: &BrokerConfig,
    attempts: usize,
    eval: &'a Evaluation,
) -> &'a str {
    if attempts > config.delivery_limit {
        FAILED_QUEUE
    } else {
        &eval.scheduler
    }
}

/// Hold-off before redelivering a nacked evaluation, compounding with the
/// number of previous delivery attempts.
fn nack_reenqueue_delay(config: &BrokerConfig, prev_dequeues: usize) -> Duration {
    match prev_dequeues {
        0 => Duration::ZERO,
        1 => config.initial_nack_delay,
        n => config.subsequent_nack_delay * (n as u32 - 1),
    }
}

/// De-duplicate and route one enqueue: requeue-hold, wait timer, delay
/// heap, or immediate admission. Must run under the write lock.
fn process_enqueue(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    eval: Arc<Evaluation>,
    token: Option<&str>,
) {
    if !inner.enabled {
        return;
    }

    if inner.evals.contains_key(&eval.id) {
        let Some(token) = token else {
            trace!(id = %eval.id, "dropped duplicate enqueue");
            return;
        };
        // A sub-scheduler re-submitted this evaluation while its own
        // evaluation is in flight; hold it until that delivery resolves.
        if inner
            .unack
            .get(&eval.id)
            .is_some_and(|unack| unack.token == token)
        {
            inner.requeue.insert(token.to_string(), eval);
        }
        return;
    }
    inner.evals.insert(eval.id.clone(), 0);

    if let Some(wait) = eval.wait.filter(|wait| !wait.is_zero()) {
        process_waiting_enqueue(shared, inner, eval, wait);
        return;
    }

    if let Some(wait_until) = eval.wait_until {
        inner.delay_heap.push(eval, wait_until);
        inner.stats.total_waiting += 1;
        let _ = inner.delayed_update_tx.try_send(());
        return;
    }

    let class = eval.scheduler.clone();
    enqueue_locked(inner, eval, class);
}

/// Park an evaluation on a relative-wait timer that re-enters the normal
/// admission path when it fires.
fn process_waiting_enqueue(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    eval: Arc<Evaluation>,
    wait: Duration,
) {
    let weak = Arc::downgrade(shared);
    let timer_eval = Arc::clone(&eval);
    let timer = DeadlineTimer::spawn(wait, move || {
        if let Some(shared) = weak.upgrade() {
            enqueue_waiting(&shared, &timer_eval);
        }
    });
    inner.time_wait.insert(eval.id.clone(), timer);
    inner.stats.total_waiting += 1;
}

/// Wait-timer firing path: admit the evaluation unless a flush already
/// retired its timer.
fn enqueue_waiting(shared: &Arc<Shared>, eval: &Arc<Evaluation>) {
    let mut inner = shared.inner.write();
    if inner.time_wait.remove(&eval.id).is_none() {
        return;
    }
    inner.stats.total_waiting -= 1;
    let class = eval.scheduler.clone();
    enqueue_locked(&mut inner, Arc::clone(eval), class);
}

/// Admit an evaluation to `class`'s ready queue, or park it behind its
/// job's current evaluation. Must run under the write lock.
fn enqueue_locked(inner: &mut Inner, eval: Arc<Evaluation>, class: String) {
    if !inner.enabled {
        return;
    }

    let key = eval.job_key();
    match inner.job_evals.get(&key) {
        None => {
            inner.job_evals.insert(key, eval.id.clone());
        }
        Some(current) if *current != eval.id => {
            inner.blocked.entry(key).or_default().push(eval);
            inner.stats.total_blocked += 1;
            return;
        }
        Some(_) => {}
    }

    inner.ready.entry(class.clone()).or_default().push(eval);
    inner.stats.total_ready += 1;
    inner
        .stats
        .by_scheduler
        .entry(class.clone())
        .or_default()
        .ready += 1;

    // Wake one parked dequeue; a full slot means a wake-up is already due.
    let wait = inner.waiting.entry(class).or_insert_with(WaitChannel::new);
    let _ = wait.tx.try_send(());
}

/// Tear down all broker state: wake parked dequeues, stop every timer,
/// cancel the delayed-evals watcher, and reinitialize every container.
/// Must run under the write lock.
fn flush(inner: &mut Inner) {
    // Dropping the senders closes every per-class wait channel.
    inner.waiting.clear();

    for unack in inner.unack.values() {
        unack.nack_timer.stop();
    }
    for timer in inner.time_wait.values() {
        timer.stop();
    }

    // Dropping the cancel sender stops the watcher; a fresh update channel
    // orphans any watcher still draining the old one.
    inner.delayed_cancel_tx = None;
    let (update_tx, update_rx) = bounded(1);
    inner.delayed_update_tx = update_tx;
    inner.delayed_update_rx = update_rx;

    inner.stats = BrokerStats::default();
    inner.evals.clear();
    inner.job_evals.clear();
    inner.blocked.clear();
    inner.ready.clear();
    inner.unack.clear();
    inner.requeue.clear();
    inner.time_wait.clear();
    inner.delay_heap = DelayHeap::new();
}

/// Long-lived loop launched on enable: admits `wait_until` evaluations once
/// their deadline passes. Exits when the cancel channel closes, when a
/// flush replaces the update channel, or when the broker is dropped.
fn run_delayed_evals_watcher(
    shared: &Weak<Shared>,
    update_rx: &Receiver<()>,
    cancel_rx: &Receiver<()>,
) {
    loop {
        let next = {
            let Some(strong) = shared.upgrade() else { return };
            next_delayed_eval(&strong)
        };

        match next {
            None => {
                select! {
                    recv(cancel_rx) -> _ => return,
                    recv(update_rx) -> msg => {
                        if msg.is_err() {
                            return;
                        }
                    }
                }
            }
            Some((eval, wait_until)) => {
                let launch_dur = wait_until
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                select! {
                    recv(cancel_rx) -> _ => return,
                    recv(update_rx) -> msg => {
                        if msg.is_err() {
                            return;
                        }
                    }
                    default(launch_dur) => {
                        let Some(strong) = shared.upgrade() else { return };
                        let mut inner = strong.inner.write();
                        // A concurrent flush may have emptied the heap; only
                        // admit what we actually removed.
                        if let Some(eval) = inner.delay_heap.remove(&eval.id) {
                            inner.stats.total_waiting -= 1;
                            let class = eval.scheduler.clone();
                            enqueue_locked(&mut inner, eval, class);
                        }
                    }
                }
            }
        }
    }
}

/// Peek the earliest-deadline delayed evaluation under the shared lock.
fn next_delayed_eval(shared: &Shared) -> Option<(Arc<Evaluation>, SystemTime)> {
    let inner = shared.inner.read();
    if inner.delay_heap.is_empty() {
        return None;
    }
    inner
        .delay_heap
        .peek()
        .map(|(eval, wait_until)| (Arc::clone(eval), wait_until))
}
