//! One replay turn: rebuild the orchestration's state from history and decide
//! what happens next.
//!
//! The orchestration future is polled exactly once with a no-op waker. Durable
//! futures resolve synchronously from history, so a single poll runs the logic
//! as far as the recorded facts allow. Nothing here performs I/O; the runtime
//! persists the returned actions and the next event triggers a fresh turn.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use super::panic_message;
use crate::{Action, ErrorDetails, Event, EventKind, OrchestrationContext};

/// Where the instance stands after a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Suspended on at least one outstanding step.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew(String),
}

impl TurnResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnResult::Continue)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// New opening steps, in the order the logic requested them.
    pub actions: Vec<Action>,
    pub result: TurnResult,
    /// Event names the logic is suspended on.
    pub waiting_on: Vec<String>,
}

impl TurnOutcome {
    fn failed(error: ErrorDetails) -> Self {
        Self {
            actions: Vec::new(),
            result: TurnResult::Failed(error),
            waiting_on: Vec::new(),
        }
    }

    /// Opening events to append for this turn.
    pub fn opening_events(&self) -> Vec<EventKind> {
        self.actions.iter().map(Action::to_event_kind).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub instance: String,
    pub generation: u64,
    /// Last seq the previous turn saw; everything above it is new to the logic.
    pub replay_boundary: u64,
}

impl TurnOptions {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            generation: 1,
            replay_boundary: 0,
        }
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn replay_boundary(mut self, seq: u64) -> Self {
        self.replay_boundary = seq;
        self
    }
}

/// Run `orchestration` against `history` once.
///
/// The history must be a single generation starting with
/// `OrchestrationStarted`; its input is handed to the orchestration.
pub fn run_turn<F, Fut>(history: &[Event], options: TurnOptions, orchestration: F) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let input = match history.first().map(|e| &e.kind) {
        Some(EventKind::OrchestrationStarted { input, .. }) => input.clone(),
        _ => {
            return TurnOutcome::failed(ErrorDetails::logic(
                "history does not start with OrchestrationStarted",
            ))
        }
    };
    if let Some(terminal) = history.iter().find(|e| e.kind.is_terminal()) {
        return TurnOutcome::failed(ErrorDetails::logic(format!(
            "generation already closed by {} at seq {}",
            terminal.kind.type_name(),
            terminal.seq
        )));
    }

    let ctx = OrchestrationContext::from_history(
        &options.instance,
        options.generation,
        history,
        options.replay_boundary,
    );

    let polled = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut fut = Box::pin(orchestration(ctx.clone(), input));
        let waker = ::futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        fut.as_mut().poll(&mut cx)
    }));

    let mut inner = ctx.lock();
    let actions = std::mem::take(&mut inner.actions);
    let waiting_on = inner.waiting_on();
    let unreplayed = inner.openings.len().saturating_sub(inner.cursor);

    let result = if let Some(message) = inner.nondeterminism.take() {
        TurnResult::Failed(ErrorDetails::logic(message))
    } else {
        match polled {
            Err(panic) => TurnResult::Failed(ErrorDetails::logic(format!(
                "orchestration panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(_) if unreplayed > 0 => {
                let (seq, _) = &inner.openings[inner.cursor];
                TurnResult::Failed(ErrorDetails::logic(format!(
                    "nondeterministic replay: {unreplayed} recorded step(s) starting at seq {seq} were never requested"
                )))
            }
            Ok(poll) => match (inner.continue_as_new.take(), poll) {
                (Some(next_input), _) => TurnResult::ContinueAsNew(next_input),
                (None, Poll::Ready(Ok(output))) => TurnResult::Completed(output),
                (None, Poll::Ready(Err(message))) => TurnResult::Failed(ErrorDetails::Application { message }),
                (None, Poll::Pending) => TurnResult::Continue,
            },
        }
    };

    TurnOutcome {
        actions,
        result,
        waiting_on,
    }
}
