//! In-process runtime: drives orchestration turns, runs activities on a
//! bounded worker pool, fires durable timers and routes external events.
//!
//! Everything durable goes through the [`HistoryStore`]. In-memory state here
//! (run slots, waiting sets, timer heap) is a cache that can be rebuilt from
//! history, which is what [`Runtime::start`] does for instances left running
//! by a previous process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, RuntimeError};
use crate::providers::{HistoryStore, InstanceHistory, ProviderError};
use crate::{EventKind, OrchestrationContext};

mod activity;
pub mod observability;
pub mod registry;
pub mod replay;
mod router;
mod status;
mod timers;

use activity::{ActivityDispatcher, ActivityWorkItem};
pub use observability::{init_logging, LogFormat, ObservabilityConfig};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, Registry,
    RegistryBuilder,
};
pub use replay::{run_turn, TurnOptions, TurnOutcome, TurnResult};
pub use router::{RaiseOutcome, UnmatchedEventPolicy};
pub(crate) use router::ExternalEventRouter;
pub(crate) use status::last_activity_output;
pub use status::{OrchestrationState, OrchestrationStatus};
use timers::{TimerHandle, TimerService};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of activity workers.
    pub worker_concurrency: usize,
    /// Capacity of the activity queue; dispatch waits while it is full.
    pub activity_queue_capacity: usize,
    /// What to do with events raised while nobody waits for them.
    pub unmatched_event_policy: UnmatchedEventPolicy,
    /// Idle sleep of background loops whose channel was closed.
    /// Default: 10ms
    pub dispatcher_idle_sleep_ms: u64,
    /// Attempts for store calls that fail with a retryable error.
    pub store_retry_attempts: u32,
    /// Install a global `tracing` subscriber on start.
    pub observability: Option<ObservabilityConfig>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            activity_queue_capacity: 256,
            unmatched_event_policy: UnmatchedEventPolicy::Buffer,
            dispatcher_idle_sleep_ms: 10,
            store_retry_attempts: 5,
            observability: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    pub fn with_activity_queue_capacity(mut self, capacity: usize) -> Self {
        self.activity_queue_capacity = capacity;
        self
    }

    pub fn with_unmatched_event_policy(mut self, policy: UnmatchedEventPolicy) -> Self {
        self.unmatched_event_policy = policy;
        self
    }

    pub fn with_dispatcher_idle_sleep_ms(mut self, ms: u64) -> Self {
        self.dispatcher_idle_sleep_ms = ms;
        self
    }

    pub fn with_store_retry_attempts(mut self, attempts: u32) -> Self {
        self.store_retry_attempts = attempts;
        self
    }

    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability = Some(config);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidOption("worker_concurrency must be at least 1".into()));
        }
        if self.activity_queue_capacity == 0 {
            return Err(ConfigError::InvalidOption(
                "activity_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// What an activity knows about the call it is serving. Activities never see history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    activity_name: String,
    attempt: u32,
    generation: u64,
}

impl ActivityContext {
    pub(crate) fn new(instance_id: &str, activity_name: &str, attempt: u32, generation: u64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            activity_name: activity_name.to_string(),
            attempt,
            generation,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1 for the first execution, incremented per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        info!(
            target: "duraflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Wakes the orchestration dispatcher for an instance.
#[derive(Clone)]
pub(crate) struct InstanceNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl InstanceNotifier {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn notify(&self, instance: &str) {
        if self.tx.send(instance.to_string()).is_err() {
            debug!(target: "duraflow::runtime", instance_id = %instance, "dispatcher gone; dropping notification");
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or `attempts` retryable failures occurred.
pub(crate) async fn with_store_retry<T, F, Fut>(attempts: u32, operation_tag: &str, op: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut tries: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && tries + 1 < attempts.max(1) => {
                let backoff_ms = 10u64.saturating_mul(1 << tries.min(16));
                warn!(target: "duraflow::runtime", attempts = tries + 1, backoff_ms, error = %e, "{} failed; retrying", operation_tag);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

const TURN_RETRY_BASE_MS: u64 = 50;
const TURN_RETRY_MAX_MS: u64 = 5_000;

/// Per-instance run slot: at most one turn in flight, later notifications coalesce.
#[derive(Debug, Default)]
struct InstanceSlot {
    running: bool,
    dirty: bool,
    /// Last seq seen by the previous turn of `generation`.
    generation: u64,
    boundary: u64,
}

/// In-process runtime that executes orchestrations, activities and timers and
/// persists history via a [`HistoryStore`].
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
    notifier: InstanceNotifier,
    dispatcher: ActivityDispatcher,
    timers: TimerHandle,
    router: Arc<ExternalEventRouter>,
    slots: StdMutex<HashMap<String, InstanceSlot>>,
}

impl Runtime {
    /// Validate configuration, start the background tasks and recover
    /// instances left running in `store`.
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, RuntimeError> {
        options.validate()?;
        if orchestrations.is_empty() {
            return Err(ConfigError::InvalidOption("no orchestrations registered".into()).into());
        }
        if let Some(config) = &options.observability {
            if let Err(e) = init_logging(config) {
                // a subscriber installed by the host application wins
                debug!(target: "duraflow::runtime", error = %e, "logging already initialized");
            }
        }

        let (notifier, notifications) = InstanceNotifier::channel();
        let (timer_join, timers) = TimerService::start(
            store.clone(),
            notifier.clone(),
            options.dispatcher_idle_sleep_ms,
            options.store_retry_attempts,
        );
        let (dispatcher, work_rx) = ActivityDispatcher::channel(options.activity_queue_capacity);
        let mut joins = activity::start_workers(
            work_rx,
            activity::WorkerShared {
                store: store.clone(),
                activities,
                notifier: notifier.clone(),
                dispatcher: dispatcher.clone(),
                store_retry_attempts: options.store_retry_attempts,
            },
            options.worker_concurrency,
        );
        joins.push(timer_join);

        let router = Arc::new(ExternalEventRouter::new(
            store.clone(),
            notifier.clone(),
            options.unmatched_event_policy,
            options.store_retry_attempts,
        ));

        let runtime = Arc::new(Self {
            joins: Mutex::new(joins),
            store,
            orchestrations,
            options,
            notifier,
            dispatcher,
            timers,
            router,
            slots: StdMutex::new(HashMap::new()),
        });

        let dispatcher_join = runtime.clone().start_orchestration_dispatcher(notifications);
        runtime.joins.lock().await.push(dispatcher_join);

        runtime.recover().await?;
        info!(
            target: "duraflow::runtime",
            workers = runtime.options.worker_concurrency,
            orchestrations = ?runtime.orchestrations.list_names(),
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn client(self: &Arc<Self>) -> crate::Client {
        crate::Client::new(self.clone())
    }

    pub(crate) fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub(crate) fn router(&self) -> &ExternalEventRouter {
        &self.router
    }

    pub(crate) fn orchestrations(&self) -> &OrchestrationRegistry {
        &self.orchestrations
    }

    pub(crate) fn notify(&self, instance: &str) {
        self.notifier.notify(instance);
    }

    pub(crate) fn store_retry_attempts(&self) -> u32 {
        self.options.store_retry_attempts
    }

    /// Abort background tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        debug!(target: "duraflow::runtime", "runtime shut down");
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_orchestration_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(instance) = rx.recv().await {
                if !self.claim_slot(&instance) {
                    continue;
                }
                let rt = self.clone();
                tokio::spawn(async move { rt.drive_instance(instance).await });
            }
            debug!(target: "duraflow::runtime", "orchestration dispatcher stopped");
        })
    }

    /// Mark the instance dirty; returns true if the caller must start a driver.
    fn claim_slot(&self, instance: &str) -> bool {
        let mut slots = self.slots();
        let slot = slots.entry(instance.to_string()).or_default();
        slot.dirty = true;
        if slot.running {
            false
        } else {
            slot.running = true;
            true
        }
    }

    /// Run turns until no notification arrived during the last one.
    ///
    /// The slot is dropped once the instance has finished. A turn that fails on
    /// a transient store error is run again after a back-off.
    async fn drive_instance(self: Arc<Self>, instance: String) {
        let mut failures: u32 = 0;
        loop {
            let boundary = {
                let mut slots = self.slots();
                let slot = slots.entry(instance.clone()).or_default();
                if !slot.dirty {
                    slot.running = false;
                    return;
                }
                slot.dirty = false;
                (slot.generation, slot.boundary)
            };
            match self.process_instance(&instance, boundary).await {
                Ok(Some(seen)) => {
                    failures = 0;
                    let mut slots = self.slots();
                    let slot = slots.entry(instance.clone()).or_default();
                    slot.generation = seen.0;
                    slot.boundary = seen.1;
                }
                Ok(None) => {
                    let mut slots = self.slots();
                    if slots.get(&instance).is_some_and(|slot| !slot.dirty) {
                        slots.remove(&instance);
                        return;
                    }
                }
                Err(e) if e.is_transient() => {
                    let delay_ms = TURN_RETRY_BASE_MS
                        .saturating_mul(1 << failures.min(6))
                        .min(TURN_RETRY_MAX_MS);
                    failures += 1;
                    warn!(target: "duraflow::runtime", instance_id = %instance, error = %e, failures, delay_ms, "turn failed; retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    self.slots().entry(instance.clone()).or_default().dirty = true;
                }
                Err(e) => {
                    error!(target: "duraflow::runtime", instance_id = %instance, error = %e, "turn failed");
                }
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots().len()
    }

    /// One turn for `instance`. Returns the `(generation, last seq)` the turn
    /// saw, or `None` once the instance has finished.
    async fn process_instance(&self, instance: &str, last_seen: (u64, u64)) -> Result<Option<(u64, u64)>, RuntimeError> {
        let attempts = self.options.store_retry_attempts;
        let history = with_store_retry(attempts, "read", || self.store.read(instance)).await?;
        if history.is_terminal() {
            self.router.clear(instance);
            return Ok(None);
        }
        let Some((name, _)) = history.started() else {
            warn!(target: "duraflow::runtime", instance_id = %instance, "history without start event");
            return Ok(None);
        };
        let generation = history.generation;
        let seen = (generation, history.last_seq());

        let handler = match self.orchestrations.resolve(name) {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "duraflow::runtime", instance_id = %instance, error = %e, "failing instance");
                let failed = EventKind::OrchestrationFailed {
                    error: (&e).into(),
                };
                self.append_closing(instance, generation, vec![failed]).await?;
                return Ok(None);
            }
        };

        let replay_boundary = if last_seen.0 == generation { last_seen.1 } else { 0 };
        let options = TurnOptions::new(instance)
            .generation(generation)
            .replay_boundary(replay_boundary);
        let outcome = run_turn(&history.events, options, |ctx, input| {
            let handler = handler.clone();
            async move { handler.invoke(ctx, input).await }
        });
        self.router.set_waiting(instance, generation, outcome.waiting_on.clone());

        match outcome.result {
            TurnResult::Continue => {
                if !outcome.actions.is_empty() {
                    self.materialize(&history, &outcome).await?;
                }
            }
            TurnResult::Completed(output) => {
                info!(target: "duraflow::runtime", instance_id = %instance, generation, "orchestration completed");
                self.append_closing(instance, generation, vec![EventKind::OrchestrationCompleted { output }])
                    .await?;
                return Ok(None);
            }
            TurnResult::Failed(error) => {
                warn!(target: "duraflow::runtime", instance_id = %instance, generation, error = %error, "orchestration failed");
                self.append_closing(instance, generation, vec![EventKind::OrchestrationFailed { error }])
                    .await?;
                return Ok(None);
            }
            TurnResult::ContinueAsNew(input) => {
                let result = with_store_retry(attempts, "continue_as_new", || {
                    self.store.continue_as_new(instance, generation, &input)
                })
                .await;
                match result {
                    Ok(next) => {
                        info!(target: "duraflow::runtime", instance_id = %instance, generation = next, "continued as new");
                        self.router.clear(instance);
                        self.notifier.notify(instance);
                    }
                    Err(e) if e.is_closed_generation() => {
                        debug!(target: "duraflow::runtime", instance_id = %instance, error = %e, "generation closed concurrently")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(Some(seen))
    }

    async fn append_closing(&self, instance: &str, generation: u64, events: Vec<EventKind>) -> Result<(), RuntimeError> {
        let result = with_store_retry(self.options.store_retry_attempts, "append terminal event", || {
            self.store.append(instance, generation, events.clone())
        })
        .await;
        self.router.clear(instance);
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_closed_generation() => {
                debug!(target: "duraflow::runtime", instance_id = %instance, error = %e, "generation closed concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the turn's opening events, then hand them to the workers and the timer service.
    async fn materialize(&self, history: &InstanceHistory, outcome: &TurnOutcome) -> Result<(), RuntimeError> {
        let instance = history.instance.as_str();
        let generation = history.generation;
        let events = outcome.opening_events();
        let appended = with_store_retry(self.options.store_retry_attempts, "append openings", || {
            self.store.append(instance, generation, events.clone())
        })
        .await;
        let seqs = match appended {
            Ok(seqs) => seqs,
            Err(e) if e.is_closed_generation() => {
                debug!(target: "duraflow::runtime", instance_id = %instance, error = %e, "dropping actions of closed generation");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for (action, seq) in outcome.actions.iter().zip(seqs) {
            match action {
                crate::Action::CallActivity { name, input, retry } => {
                    debug!(target: "duraflow::runtime", instance_id = %instance, activity = %name, scheduled = seq, "dispatching activity");
                    self.dispatcher
                        .invoke(ActivityWorkItem {
                            instance: instance.to_string(),
                            generation,
                            scheduled: seq,
                            name: name.clone(),
                            input: input.clone(),
                            attempt: 1,
                            retry: retry.clone(),
                        })
                        .await?;
                }
                crate::Action::CreateTimer { fire_at_ms } => {
                    self.timers.schedule(instance, generation, seq, *fire_at_ms);
                }
                crate::Action::WaitForEvent { name } => {
                    debug!(target: "duraflow::runtime", instance_id = %instance, event = %name, "waiting for event");
                }
            }
        }
        Ok(())
    }

    /// Rebuild in-memory work from history: pending timers, open activities and one turn per running instance.
    async fn recover(&self) -> Result<(), RuntimeError> {
        let attempts = self.options.store_retry_attempts;
        let instances = with_store_retry(attempts, "list_instances", || self.store.list_instances()).await?;
        let mut recovered = 0usize;
        for instance in instances {
            let history = with_store_retry(attempts, "read", || self.store.read(&instance)).await?;
            if history.is_terminal() {
                continue;
            }
            let open = OpenWork::scan(&history);
            for (created, fire_at_ms) in open.timers {
                self.timers.schedule(&instance, history.generation, created, fire_at_ms);
            }
            for item in open.activities {
                let delay = Duration::from_millis(item.1.saturating_sub(crate::providers::now_ms()));
                self.dispatcher.invoke_after(item.0, delay);
            }
            self.notifier.notify(&instance);
            recovered += 1;
        }
        if recovered > 0 {
            info!(target: "duraflow::runtime", instances = recovered, "recovered running instances");
        }
        Ok(())
    }
}

/// Timers and activities opened in the current generation that have no result yet.
struct OpenWork {
    timers: Vec<(u64, u64)>,
    /// Latest attempt of each open activity with its `not_before_ms`.
    activities: Vec<(ActivityWorkItem, u64)>,
}

impl OpenWork {
    fn scan(history: &InstanceHistory) -> Self {
        let mut timers: Vec<(u64, u64)> = Vec::new();
        let mut activities: Vec<(ActivityWorkItem, u64)> = Vec::new();
        let mut closed = std::collections::HashSet::new();
        for ev in &history.events {
            match &ev.kind {
                EventKind::TimerCreated { fire_at_ms } => timers.push((ev.seq, *fire_at_ms)),
                EventKind::TimerFired { created } => {
                    closed.insert(*created);
                }
                EventKind::ActivityScheduled {
                    name,
                    input,
                    attempt,
                    retry,
                    retry_of,
                    not_before_ms,
                } => {
                    let scheduled = retry_of.unwrap_or(ev.seq);
                    let item = ActivityWorkItem {
                        instance: history.instance.clone(),
                        generation: history.generation,
                        scheduled,
                        name: name.clone(),
                        input: input.clone(),
                        attempt: *attempt,
                        retry: retry.clone(),
                    };
                    match activities.iter_mut().find(|(a, _)| a.scheduled == scheduled) {
                        Some(slot) if slot.0.attempt < *attempt => *slot = (item, *not_before_ms),
                        Some(_) => {}
                        None => activities.push((item, *not_before_ms)),
                    }
                }
                EventKind::ActivityCompleted { scheduled, .. } | EventKind::ActivityFailed { scheduled, .. } => {
                    closed.insert(*scheduled);
                }
                _ => {}
            }
        }
        timers.retain(|(created, _)| !closed.contains(created));
        activities.retain(|(a, _)| !closed.contains(&a.scheduled));
        Self { timers, activities }
    }
}
