//! # duraflow
//!
//! A deterministic, replay-driven workflow orchestration engine.
//!
//! Orchestrations are ordinary `async` functions that receive an
//! [`OrchestrationContext`]. Every call they make through the context
//! (activities, timers, external events) is recorded as an event in an
//! append-only history. Whenever something new lands in that history the
//! runtime re-runs the orchestration from the start: steps that already have a
//! recorded result resolve immediately, and the first step without one emits a
//! new opening event and suspends.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use duraflow::providers::in_memory::InMemoryHistoryStore;
//! use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime, RuntimeOptions};
//! use duraflow::OrchestrationContext;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build()?;
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         let greeting = ctx.call_activity("Greet", name).await.map_err(|e| e.to_string())?;
//!         Ok(greeting)
//!     })
//!     .build()?;
//!
//! let store = Arc::new(InMemoryHistoryStore::default());
//! let rt = Runtime::start(store, activities, orchestrations, RuntimeOptions::default()).await?;
//! let client = rt.client();
//! let id = client.start_orchestration("HelloWorld", "Rust").await?;
//! let state = client.wait_for_orchestration(&id, Duration::from_secs(5)).await?;
//! assert_eq!(state.output.as_deref(), Some("Hello, Rust!"));
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Orchestration code must be deterministic: no wall-clock reads, random
//! values or shared mutable state. Use [`OrchestrationContext::current_time_ms`]
//! for time and activities for anything else that varies between runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod patterns;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::Client;
pub use error::{ClientError, ConfigError, ConfigErrorKind, ErrorDetails, RuntimeError};
pub use futures::{
    DurableFuture, DurableOutput, EventOrTimeout, FanInFuture, FanOutFailure, FanOutPolicy, JoinFuture, SelectFuture,
};
pub use retry::RetryPolicy;
pub use runtime::{
    ActivityContext, OrchestrationState, OrchestrationStatus, RaiseOutcome, Runtime, RuntimeOptions, UnmatchedEventPolicy,
};

/// One durable fact in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position inside the generation, starting at 1 with no gaps.
    pub seq: u64,
    /// Wall-clock time of the append, non-decreasing within a generation.
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self { seq, timestamp_ms, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    OrchestrationStarted {
        name: String,
        input: String,
        generation: u64,
    },
    /// Opening event of an activity call. Retries are recorded with the same
    /// name and input, a higher `attempt` and `retry_of` pointing at the first record.
    ActivityScheduled {
        name: String,
        input: String,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_of: Option<u64>,
        #[serde(default)]
        not_before_ms: u64,
    },
    ActivityCompleted {
        scheduled: u64,
        output: String,
    },
    ActivityFailed {
        scheduled: u64,
        error: ErrorDetails,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        created: u64,
    },
    EventAwaited {
        name: String,
    },
    EventRaised {
        name: String,
        payload: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        error: ErrorDetails,
    },
    OrchestrationTerminated {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_output: Option<String>,
    },
    OrchestrationContinuedAsNew {
        new_input: String,
    },
}

impl EventKind {
    /// Terminal events close a generation; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
                | EventKind::OrchestrationContinuedAsNew { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventAwaited { .. } => "EventAwaited",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated",
            EventKind::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
        }
    }
}

/// A decision produced by a replay turn that the runtime must materialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    CreateTimer {
        fire_at_ms: u64,
    },
    WaitForEvent {
        name: String,
    },
}

impl Action {
    /// The opening event recorded for this decision.
    pub fn to_event_kind(&self) -> EventKind {
        match self {
            Action::CallActivity { name, input, retry } => EventKind::ActivityScheduled {
                name: name.clone(),
                input: input.clone(),
                attempt: 1,
                retry: retry.clone(),
                retry_of: None,
                not_before_ms: 0,
            },
            Action::CreateTimer { fire_at_ms } => EventKind::TimerCreated { fire_at_ms: *fire_at_ms },
            Action::WaitForEvent { name } => EventKind::EventAwaited { name: name.clone() },
        }
    }
}

/// Whole milliseconds in `d`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[doc(hidden)]
pub mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};

    pub trait Codec {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize + ?Sized>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
        }
    }
}

/// Opening step as seen by the replay cursor.
#[derive(Debug, Clone)]
pub(crate) enum Opening {
    Activity {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    Timer {
        fire_at_ms: u64,
    },
    Event {
        name: String,
    },
}

impl Opening {
    // Retry policies and timer deadlines may change between code versions
    // without changing which step this is.
    fn same_step(&self, other: &Opening) -> bool {
        match (self, other) {
            (
                Opening::Activity { name: a, input: ai, .. },
                Opening::Activity { name: b, input: bi, .. },
            ) => a == b && ai == bi,
            (Opening::Timer { .. }, Opening::Timer { .. }) => true,
            (Opening::Event { name: a }, Opening::Event { name: b }) => a == b,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Opening::Activity { name, input, .. } => format!("activity '{name}' with input {input:?}"),
            Opening::Timer { fire_at_ms } => format!("timer firing at {fire_at_ms}"),
            Opening::Event { name } => format!("wait for event '{name}'"),
        }
    }

    fn into_action(self) -> Action {
        match self {
            Opening::Activity { name, input, retry } => Action::CallActivity { name, input, retry },
            Opening::Timer { fire_at_ms } => Action::CreateTimer { fire_at_ms },
            Opening::Event { name } => Action::WaitForEvent { name },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRaise {
    pub(crate) seq: u64,
    pub(crate) timestamp_ms: u64,
    pub(crate) name: String,
    pub(crate) payload: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedResult {
    pub(crate) seq: u64,
    pub(crate) timestamp_ms: u64,
    pub(crate) result: Result<String, ErrorDetails>,
}

/// Replay state for one turn of one instance generation.
#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) generation: u64,
    replay_boundary: u64,
    replaying: bool,
    clock_ms: u64,
    next_seq: u64,
    pub(crate) openings: Vec<(u64, Opening)>,
    pub(crate) cursor: usize,
    activity_results: HashMap<u64, RecordedResult>,
    timers_fired: HashMap<u64, u64>,
    raises: Vec<RecordedRaise>,
    consumed_raises: HashSet<u64>,
    open_waits: BTreeMap<u64, String>,
    pub(crate) actions: Vec<Action>,
    pub(crate) nondeterminism: Option<String>,
    pub(crate) continue_as_new: Option<String>,
}

impl CtxInner {
    fn from_history(instance: &str, generation: u64, history: &[Event], replay_boundary: u64) -> Self {
        let mut inner = CtxInner {
            instance: instance.to_string(),
            generation,
            replay_boundary,
            replaying: replay_boundary > 0,
            clock_ms: 0,
            next_seq: history.last().map(|e| e.seq + 1).unwrap_or(1),
            openings: Vec::new(),
            cursor: 0,
            activity_results: HashMap::new(),
            timers_fired: HashMap::new(),
            raises: Vec::new(),
            consumed_raises: HashSet::new(),
            open_waits: BTreeMap::new(),
            actions: Vec::new(),
            nondeterminism: None,
            continue_as_new: None,
        };

        let mut activity_seqs = HashSet::new();
        let mut timer_seqs = HashSet::new();
        for ev in history {
            match &ev.kind {
                EventKind::OrchestrationStarted { .. } => {
                    if inner.clock_ms == 0 {
                        inner.clock_ms = ev.timestamp_ms;
                    }
                }
                EventKind::ActivityScheduled {
                    name,
                    input,
                    retry,
                    retry_of: None,
                    ..
                } => {
                    activity_seqs.insert(ev.seq);
                    inner.openings.push((
                        ev.seq,
                        Opening::Activity {
                            name: name.clone(),
                            input: input.clone(),
                            retry: retry.clone(),
                        },
                    ));
                }
                EventKind::ActivityScheduled { .. } => {}
                EventKind::ActivityCompleted { scheduled, output } => {
                    if !activity_seqs.contains(scheduled) {
                        inner.corrupt(ev.seq, *scheduled);
                        continue;
                    }
                    inner.activity_results.entry(*scheduled).or_insert(RecordedResult {
                        seq: ev.seq,
                        timestamp_ms: ev.timestamp_ms,
                        result: Ok(output.clone()),
                    });
                }
                EventKind::ActivityFailed { scheduled, error } => {
                    if !activity_seqs.contains(scheduled) {
                        inner.corrupt(ev.seq, *scheduled);
                        continue;
                    }
                    inner.activity_results.entry(*scheduled).or_insert(RecordedResult {
                        seq: ev.seq,
                        timestamp_ms: ev.timestamp_ms,
                        result: Err(error.clone()),
                    });
                }
                EventKind::TimerCreated { fire_at_ms } => {
                    timer_seqs.insert(ev.seq);
                    inner.openings.push((ev.seq, Opening::Timer { fire_at_ms: *fire_at_ms }));
                }
                EventKind::TimerFired { created } => {
                    if !timer_seqs.contains(created) {
                        inner.corrupt(ev.seq, *created);
                        continue;
                    }
                    inner.timers_fired.entry(*created).or_insert(ev.seq);
                }
                EventKind::EventAwaited { name } => {
                    inner.openings.push((ev.seq, Opening::Event { name: name.clone() }));
                }
                EventKind::EventRaised { name, payload } => inner.raises.push(RecordedRaise {
                    seq: ev.seq,
                    timestamp_ms: ev.timestamp_ms,
                    name: name.clone(),
                    payload: payload.clone(),
                }),
                EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
                | EventKind::OrchestrationContinuedAsNew { .. } => {}
            }
        }
        inner
    }

    fn corrupt(&mut self, seq: u64, target: u64) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(format!(
                "corrupted history: event {seq} completes {target}, which is not a matching opening event"
            ));
        }
    }

    /// Match the next recorded opening event, or record a new one.
    pub(crate) fn claim(&mut self, wanted: Opening) -> Option<(u64, Opening)> {
        if self.nondeterminism.is_some() {
            return None;
        }
        if let Some((seq, recorded)) = self.openings.get(self.cursor).cloned() {
            if !recorded.same_step(&wanted) {
                self.nondeterminism = Some(format!(
                    "nondeterministic replay: history has {} at seq {seq}, orchestration requested {}",
                    recorded.describe(),
                    wanted.describe()
                ));
                return None;
            }
            self.cursor += 1;
            return Some((seq, recorded));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.replaying = false;
        self.actions.push(wanted.clone().into_action());
        Some((seq, wanted))
    }

    pub(crate) fn clock(&self) -> u64 {
        self.clock_ms
    }

    pub(crate) fn activity_result(&self, scheduled: u64) -> Option<&RecordedResult> {
        self.activity_results.get(&scheduled)
    }

    pub(crate) fn timer_fired(&self, created: u64) -> Option<u64> {
        self.timers_fired.get(&created).copied()
    }

    /// Reserve the earliest raise of `name` that no other wait has taken.
    pub(crate) fn take_raise(&mut self, name: &str) -> Option<RecordedRaise> {
        let found = self
            .raises
            .iter()
            .find(|r| r.name == name && !self.consumed_raises.contains(&r.seq))
            .cloned()?;
        self.consumed_raises.insert(found.seq);
        Some(found)
    }

    pub(crate) fn release_raise(&mut self, seq: u64) {
        self.consumed_raises.remove(&seq);
    }

    pub(crate) fn mark_waiting(&mut self, awaited: u64, name: &str) {
        self.open_waits.insert(awaited, name.to_string());
    }

    pub(crate) fn clear_waiting(&mut self, awaited: u64) {
        self.open_waits.remove(&awaited);
    }

    /// Advance the deterministic clock past a consumed completion.
    pub(crate) fn observe(&mut self, seq: u64, clock_ms: u64) {
        if seq > self.replay_boundary {
            self.replaying = false;
        }
        self.clock_ms = self.clock_ms.max(clock_ms);
    }

    pub(crate) fn waiting_on(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open_waits.values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Handle given to orchestration code. Owns the replay cursor of the current
/// turn and exposes the scheduling primitives.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance", &inner.instance)
            .field("generation", &inner.generation)
            .finish()
    }
}

impl OrchestrationContext {
    pub(crate) fn from_history(instance: &str, generation: u64, history: &[Event], replay_boundary: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::from_history(
                instance,
                generation,
                history,
                replay_boundary,
            ))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Deterministic time: the start timestamp, advanced by each consumed completion.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().clock_ms
    }

    /// True while the orchestration is re-executing steps it already took in an earlier turn.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let inner = self.lock();
            tracing::info!(target: "duraflow::orchestration", instance_id = %inner.instance, generation = inner.generation, "{}", message.as_ref());
        }
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let inner = self.lock();
            tracing::warn!(target: "duraflow::orchestration", instance_id = %inner.instance, generation = inner.generation, "{}", message.as_ref());
        }
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let inner = self.lock();
            tracing::error!(target: "duraflow::orchestration", instance_id = %inner.instance, generation = inner.generation, "{}", message.as_ref());
        }
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), None)
    }

    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), Some(retry))
    }

    pub fn call_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, ErrorDetails>> + Send {
        self.schedule_activity(name, input).into_activity()
    }

    pub fn call_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> impl Future<Output = Result<String, ErrorDetails>> + Send {
        self.schedule_activity_with_retry(name, input, retry).into_activity()
    }

    /// Call an activity with JSON encoded input and output.
    pub fn call_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, ErrorDetails>> + Send
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned + Send,
    {
        use _typed_codec::{Codec, Json};
        let encoded = Json::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let input = encoded.map_err(ErrorDetails::serialization)?;
            let raw = ctx.schedule_activity(name, input).into_activity().await?;
            Json::decode(&raw).map_err(ErrorDetails::serialization)
        }
    }

    /// Durable timer relative to [`current_time_ms`](Self::current_time_ms).
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), saturating_millis(delay), None)
    }

    pub fn schedule_timer_at(&self, fire_at_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), 0, Some(fire_at_ms))
    }

    pub fn create_timer(&self, delay: Duration) -> impl Future<Output = ()> + Send {
        self.schedule_timer(delay).into_timer()
    }

    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    pub fn wait_for_event(&self, name: impl Into<String>) -> impl Future<Output = String> + Send {
        self.schedule_wait(name).into_event()
    }

    /// Wait for `name`, racing a durable timer of `timeout`.
    ///
    /// The event wins only when it was raised strictly before the timer's
    /// deadline; an event raised at or after the deadline is a timeout and stays
    /// available to a later wait.
    pub fn wait_for_event_with_timeout(&self, name: impl Into<String>, timeout: Duration) -> EventOrTimeout {
        let name = name.into();
        let event = self.schedule_wait(name.clone());
        let timer = self.schedule_timer(timeout);
        EventOrTimeout::new(event, timer, name, saturating_millis(timeout))
    }

    /// Resolve when every future resolves; outputs are in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Resolve with the child whose completion was recorded first.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(vec![a, b])
    }

    /// Join activity futures under a failure policy.
    pub fn fan_in(&self, futures: Vec<DurableFuture>, policy: FanOutPolicy) -> FanInFuture {
        FanInFuture::new(futures, policy)
    }

    /// Restart this instance with `input` once the current turn ends.
    /// Takes precedence over whatever the orchestration returns.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().continue_as_new = Some(input.into());
    }

    pub fn continue_as_new_typed<T: Serialize + ?Sized>(&self, input: &T) -> Result<(), ErrorDetails> {
        use _typed_codec::{Codec, Json};
        let encoded = Json::encode(input).map_err(ErrorDetails::serialization)?;
        self.continue_as_new(encoded);
        Ok(())
    }

    /// Fail the instance with an orchestration logic error.
    pub(crate) fn fail_logic(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.nondeterminism.is_none() {
            inner.nondeterminism = Some(message.into());
        }
    }
}
