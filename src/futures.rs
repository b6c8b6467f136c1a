//! Durable futures returned by [`OrchestrationContext`] scheduling calls.
//!
//! A future claims its opening event the first time it is polled. Readiness is
//! decided purely from recorded history, so a future polled during replay
//! resolves to exactly what it resolved to the first time around.
//!
//! Aggregates never look at arrival order in real time. `select` prefers the
//! completion with the smallest history seq and `join` returns in argument
//! order. Both answers stay the same when later completions are appended.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Opening, OrchestrationContext, RetryPolicy};

/// Resolved value of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, ErrorDetails>),
    Timer,
    External(String),
}

/// A resolved child before it is committed to the deterministic clock.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub(crate) seq: u64,
    pub(crate) clock_ms: u64,
    pub(crate) output: DurableOutput,
}

#[derive(Debug, Clone)]
enum Kind {
    Activity {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    Timer {
        delay_ms: u64,
        fire_at_ms: Option<u64>,
    },
    External {
        name: String,
    },
}

pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed: Option<u64>,
    fire_at_ms: Option<u64>,
    reserved: Option<Completion>,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String, retry: Option<RetryPolicy>) -> Self {
        Self::with_kind(ctx, Kind::Activity { name, input, retry })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64, fire_at_ms: Option<u64>) -> Self {
        Self::with_kind(ctx, Kind::Timer { delay_ms, fire_at_ms })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::with_kind(ctx, Kind::External { name })
    }

    fn with_kind(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            claimed: None,
            fire_at_ms: None,
            reserved: None,
        }
    }

    /// Seq of the opening event once claimed.
    pub fn scheduled_seq(&self) -> Option<u64> {
        self.claimed
    }

    /// Check readiness without advancing the clock.
    pub(crate) fn poll_step(&mut self) -> Poll<Completion> {
        if let Some(c) = &self.reserved {
            return Poll::Ready(c.clone());
        }
        let ctx = self.ctx.clone();
        let mut inner = ctx.lock();

        let seq = match self.claimed {
            Some(seq) => seq,
            None => {
                let wanted = match &self.kind {
                    Kind::Activity { name, input, retry } => Opening::Activity {
                        name: name.clone(),
                        input: input.clone(),
                        retry: retry.clone(),
                    },
                    Kind::Timer { delay_ms, fire_at_ms } => Opening::Timer {
                        fire_at_ms: fire_at_ms.unwrap_or_else(|| inner.clock().saturating_add(*delay_ms)),
                    },
                    Kind::External { name } => Opening::Event { name: name.clone() },
                };
                let Some((seq, recorded)) = inner.claim(wanted) else {
                    return Poll::Pending;
                };
                if let Opening::Timer { fire_at_ms } = recorded {
                    self.fire_at_ms = Some(fire_at_ms);
                }
                self.claimed = Some(seq);
                seq
            }
        };

        match &self.kind {
            Kind::Activity { .. } => match inner.activity_result(seq) {
                Some(r) => Poll::Ready(Completion {
                    seq: r.seq,
                    clock_ms: r.timestamp_ms,
                    output: DurableOutput::Activity(r.result.clone()),
                }),
                None => Poll::Pending,
            },
            Kind::Timer { .. } => match inner.timer_fired(seq) {
                Some(fired) => Poll::Ready(Completion {
                    seq: fired,
                    clock_ms: self.fire_at_ms.unwrap_or_default(),
                    output: DurableOutput::Timer,
                }),
                None => Poll::Pending,
            },
            Kind::External { name } => match inner.take_raise(name) {
                Some(raise) => {
                    inner.clear_waiting(seq);
                    let c = Completion {
                        seq: raise.seq,
                        clock_ms: raise.timestamp_ms,
                        output: DurableOutput::External(raise.payload),
                    };
                    self.reserved = Some(c.clone());
                    Poll::Ready(c)
                }
                None => {
                    inner.mark_waiting(seq, name);
                    Poll::Pending
                }
            },
        }
    }

    pub(crate) fn commit(&mut self, completion: &Completion) {
        self.ctx.lock().observe(completion.seq, completion.clock_ms);
    }

    /// Drop interest in this future. A reserved raise becomes available again.
    pub(crate) fn cancel(&mut self) {
        let mut inner = self.ctx.lock();
        if let Some(c) = self.reserved.take() {
            inner.release_raise(c.seq);
        }
        if let (Kind::External { .. }, Some(seq)) = (&self.kind, self.claimed) {
            inner.clear_waiting(seq);
        }
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, ErrorDetails>> + Send {
        async move {
            let ctx = self.ctx.clone();
            match self.await {
                DurableOutput::Activity(result) => result,
                other => {
                    ctx.fail_logic(format!("expected an activity result, got {other:?}"));
                    std::future::pending().await
                }
            }
        }
    }

    pub fn into_activity_typed<Out: DeserializeOwned + Send>(
        self,
    ) -> impl Future<Output = Result<Out, ErrorDetails>> + Send {
        use crate::_typed_codec::{Codec, Json};
        async move {
            let raw = self.into_activity().await?;
            Json::decode(&raw).map_err(ErrorDetails::serialization)
        }
    }

    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            let ctx = self.ctx.clone();
            match self.await {
                DurableOutput::Timer => {}
                other => {
                    ctx.fail_logic(format!("expected a timer, got {other:?}"));
                    std::future::pending::<()>().await
                }
            }
        }
    }

    pub fn into_event(self) -> impl Future<Output = String> + Send {
        async move {
            let ctx = self.ctx.clone();
            match self.await {
                DurableOutput::External(payload) => payload,
                other => {
                    ctx.fail_logic(format!("expected an external event, got {other:?}"));
                    std::future::pending().await
                }
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.poll_step() {
            Poll::Ready(c) => {
                this.commit(&c);
                Poll::Ready(c.output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves once every child resolves; outputs keep argument order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<Completion>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let results = vec![None; children.len()];
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_none() {
                if let Poll::Ready(c) = child.poll_step() {
                    *slot = Some(c);
                }
            }
        }
        if this.results.iter().any(Option::is_none) {
            return Poll::Pending;
        }
        let mut outputs = Vec::with_capacity(this.children.len());
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if let Some(c) = slot.take() {
                child.commit(&c);
                outputs.push(c.output);
            }
        }
        Poll::Ready(outputs)
    }
}

/// Resolves with `(index, output)` of the child recorded first in history.
/// Losing children are cancelled.
pub struct SelectFuture {
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // every child is polled so each claims its opening event in order
        let ready: Vec<(usize, Completion)> = this
            .children
            .iter_mut()
            .enumerate()
            .filter_map(|(i, child)| match child.poll_step() {
                Poll::Ready(c) => Some((i, c)),
                Poll::Pending => None,
            })
            .collect();

        let Some((winner, completion)) = ready.into_iter().min_by_key(|(_, c)| c.seq) else {
            return Poll::Pending;
        };
        for (i, child) in this.children.iter_mut().enumerate() {
            if i != winner {
                child.cancel();
            }
        }
        this.children[winner].commit(&completion);
        Poll::Ready((winner, completion.output))
    }
}

/// How a fan-in reacts to failed children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FanOutPolicy {
    /// Resolve as soon as the first failure is recorded.
    #[default]
    FailFast,
    /// Wait for every child, then report all failures.
    WaitAll,
}

/// Failed fan-in: the failures plus whatever succeeded before the failure was decided.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutFailure {
    /// `(index, error)` pairs in argument order.
    pub failures: Vec<(usize, ErrorDetails)>,
    /// `(index, output)` pairs in argument order.
    pub completed: Vec<(usize, String)>,
}

impl FanOutFailure {
    pub fn first_error(&self) -> Option<&ErrorDetails> {
        self.failures.first().map(|(_, e)| e)
    }
}

impl std::fmt::Display for FanOutFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.first_error() {
            Some(e) => write!(f, "{} of the fan-out calls failed; first: {e}", self.failures.len()),
            None => write!(f, "fan-out failed"),
        }
    }
}

pub struct FanInFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<Completion>>,
    policy: FanOutPolicy,
}

impl FanInFuture {
    pub(crate) fn new(children: Vec<DurableFuture>, policy: FanOutPolicy) -> Self {
        let results = vec![None; children.len()];
        Self {
            children,
            results,
            policy,
        }
    }

    fn commit_where(&mut self, keep: impl Fn(&Completion) -> bool) {
        for (child, slot) in self.children.iter_mut().zip(self.results.iter()) {
            if let Some(c) = slot {
                if keep(c) {
                    child.commit(c);
                }
            }
        }
    }
}

fn success_value(output: &DurableOutput) -> Option<String> {
    match output {
        DurableOutput::Activity(Ok(v)) | DurableOutput::External(v) => Some(v.clone()),
        DurableOutput::Timer => Some(String::new()),
        DurableOutput::Activity(Err(_)) => None,
    }
}

impl Future for FanInFuture {
    type Output = Result<Vec<String>, FanOutFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_none() {
                if let Poll::Ready(c) = child.poll_step() {
                    *slot = Some(c);
                }
            }
        }

        if this.policy == FanOutPolicy::FailFast {
            let first_failure = this
                .results
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| match slot {
                    Some(Completion {
                        seq,
                        output: DurableOutput::Activity(Err(e)),
                        ..
                    }) => Some((i, *seq, e.clone())),
                    _ => None,
                })
                .min_by_key(|(_, seq, _)| *seq);
            if let Some((index, failed_seq, error)) = first_failure {
                // only what was recorded before the failure, so replay sees the same subset
                let completed = this
                    .results
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| match slot {
                        Some(c) if c.seq < failed_seq => success_value(&c.output).map(|v| (i, v)),
                        _ => None,
                    })
                    .collect();
                this.commit_where(|c| c.seq <= failed_seq);
                for child in this.children.iter_mut() {
                    child.cancel();
                }
                return Poll::Ready(Err(FanOutFailure {
                    failures: vec![(index, error)],
                    completed,
                }));
            }
        }

        if this.results.iter().any(Option::is_none) {
            return Poll::Pending;
        }
        this.commit_where(|_| true);

        let mut values = Vec::with_capacity(this.results.len());
        let mut failures = Vec::new();
        let mut completed = Vec::new();
        for (i, slot) in this.results.iter().enumerate() {
            let Some(c) = slot else { continue };
            match (&c.output, success_value(&c.output)) {
                (_, Some(v)) => {
                    completed.push((i, v.clone()));
                    values.push(v);
                }
                (DurableOutput::Activity(Err(e)), None) => failures.push((i, e.clone())),
                _ => {}
            }
        }
        if failures.is_empty() {
            Poll::Ready(Ok(values))
        } else {
            Poll::Ready(Err(FanOutFailure { failures, completed }))
        }
    }
}

/// An external event raced against a durable timer.
///
/// Decided from recorded timestamps: the event wins iff it was raised strictly
/// before the timer's deadline. Ties go to the timer.
pub struct EventOrTimeout {
    event: DurableFuture,
    timer: DurableFuture,
    name: String,
    timeout_ms: u64,
}

impl EventOrTimeout {
    pub(crate) fn new(event: DurableFuture, timer: DurableFuture, name: String, timeout_ms: u64) -> Self {
        Self {
            event,
            timer,
            name,
            timeout_ms,
        }
    }
}

impl Future for EventOrTimeout {
    type Output = Result<String, ErrorDetails>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let event = this.event.poll_step();
        let timer = this.timer.poll_step();
        let Some(deadline) = this.timer.fire_at_ms else {
            return Poll::Pending;
        };

        if let Poll::Ready(c) = &event {
            if c.clock_ms < deadline {
                this.event.commit(c);
                if let DurableOutput::External(payload) = &c.output {
                    return Poll::Ready(Ok(payload.clone()));
                }
            }
        }

        let trigger = match (&timer, &event) {
            (Poll::Ready(t), _) => Some(t.seq),
            (Poll::Pending, Poll::Ready(late)) => Some(late.seq),
            (Poll::Pending, Poll::Pending) => None,
        };
        let Some(seq) = trigger else {
            return Poll::Pending;
        };
        this.event.cancel();
        this.timer.commit(&Completion {
            seq,
            clock_ms: deadline,
            output: DurableOutput::Timer,
        });
        Poll::Ready(Err(ErrorDetails::Timeout {
            event: this.name.clone(),
            after_ms: this.timeout_ms,
        }))
    }
}
