use serde::{Deserialize, Serialize};

use crate::providers::InstanceHistory;
use crate::{ErrorDetails, Event, EventKind};

/// High-level instance status derived from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    /// Only reported for a closed generation; the instance itself keeps running.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestrationStatus::Running)
    }
}

/// Snapshot of one generation of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance: String,
    pub orchestration: String,
    pub generation: u64,
    pub status: OrchestrationStatus,
    pub input: String,
    /// Completed: the returned value. Terminated: the last completed activity
    /// output, if any. ContinuedAsNew: the next generation's input.
    pub output: Option<String>,
    pub error: Option<ErrorDetails>,
}

impl OrchestrationState {
    pub fn from_history(history: &InstanceHistory) -> Self {
        Self::from_events(&history.instance, history.generation, &history.events)
    }

    pub fn from_events(instance: &str, generation: u64, events: &[Event]) -> Self {
        let (orchestration, input) = match events.first().map(|e| &e.kind) {
            Some(EventKind::OrchestrationStarted { name, input, .. }) => (name.clone(), input.clone()),
            _ => (String::new(), String::new()),
        };
        let mut state = Self {
            instance: instance.to_string(),
            orchestration,
            generation,
            status: OrchestrationStatus::Running,
            input,
            output: None,
            error: None,
        };
        match events.last().map(|e| &e.kind) {
            Some(EventKind::OrchestrationCompleted { output }) => {
                state.status = OrchestrationStatus::Completed;
                state.output = Some(output.clone());
            }
            Some(EventKind::OrchestrationFailed { error }) => {
                state.status = OrchestrationStatus::Failed;
                state.error = Some(error.clone());
            }
            Some(EventKind::OrchestrationTerminated { reason, last_output }) => {
                state.status = OrchestrationStatus::Terminated;
                state.output = last_output.clone();
                state.error = Some(ErrorDetails::TerminationRequested { reason: reason.clone() });
            }
            Some(EventKind::OrchestrationContinuedAsNew { new_input }) => {
                state.status = OrchestrationStatus::ContinuedAsNew;
                state.output = Some(new_input.clone());
            }
            _ => {}
        }
        state
    }
}

/// Output of the most recently completed activity, used as a terminated instance's partial result.
pub(crate) fn last_activity_output(events: &[Event]) -> Option<String> {
    events.iter().rev().find_map(|e| match &e.kind {
        EventKind::ActivityCompleted { output, .. } => Some(output.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(tail: Vec<EventKind>) -> Vec<Event> {
        let mut out = vec![Event::new(
            1,
            10,
            EventKind::OrchestrationStarted {
                name: "O".into(),
                input: "in".into(),
                generation: 1,
            },
        )];
        for (i, kind) in tail.into_iter().enumerate() {
            out.push(Event::new(i as u64 + 2, 10, kind));
        }
        out
    }

    #[test]
    fn running_until_a_terminal_event() {
        let state = OrchestrationState::from_events("i", 1, &events(vec![EventKind::TimerCreated { fire_at_ms: 5 }]));
        assert_eq!(state.status, OrchestrationStatus::Running);
        assert_eq!(state.input, "in");
        assert_eq!(state.orchestration, "O");
        assert!(state.output.is_none());
    }

    #[test]
    fn terminated_exposes_partial_output_and_marker() {
        let evs = events(vec![
            EventKind::ActivityScheduled {
                name: "A".into(),
                input: "".into(),
                attempt: 1,
                retry: None,
                retry_of: None,
                not_before_ms: 0,
            },
            EventKind::ActivityCompleted {
                scheduled: 2,
                output: "a.mp4".into(),
            },
            EventKind::OrchestrationTerminated {
                reason: "user".into(),
                last_output: Some("a.mp4".into()),
            },
        ]);
        assert_eq!(last_activity_output(&evs), Some("a.mp4".into()));
        let state = OrchestrationState::from_events("i", 1, &evs);
        assert_eq!(state.status, OrchestrationStatus::Terminated);
        assert_eq!(state.output.as_deref(), Some("a.mp4"));
        assert_eq!(
            state.error,
            Some(ErrorDetails::TerminationRequested { reason: "user".into() })
        );
    }
}
