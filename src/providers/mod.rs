use std::collections::{HashMap, HashSet};

use crate::{Event, EventKind};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// Current generation of an instance together with its events.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceHistory {
    pub instance: String,
    pub generation: u64,
    pub events: Vec<Event>,
}

impl InstanceHistory {
    /// Orchestration name and input from the generation's start event.
    pub fn started(&self) -> Option<(&str, &str)> {
        match self.events.first().map(|e| &e.kind) {
            Some(EventKind::OrchestrationStarted { name, input, .. }) => Some((name.as_str(), input.as_str())),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.events.last().is_some_and(|e| e.kind.is_terminal())
    }

    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }
}

/// Append-only, per-instance event log.
///
/// Every instance has one or more generations; continuing as new closes the
/// current one and starts the next with a fresh history. Implementations must
/// serialize writes per instance and make each `append` atomic: either every
/// event of the batch is durable or none is.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create generation 1 holding only `OrchestrationStarted`.
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError>;

    /// Current generation, gap free and in seq order.
    async fn read(&self, instance: &str) -> Result<InstanceHistory, ProviderError>;

    async fn read_generation(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError>;

    /// Append a batch to `generation`, returning the seq of each event.
    ///
    /// A completion that duplicates an already recorded one is absorbed and
    /// reports the seq of the original.
    async fn append(&self, instance: &str, generation: u64, events: Vec<EventKind>) -> Result<Vec<u64>, ProviderError>;

    async fn append_event(&self, instance: &str, generation: u64, event: EventKind) -> Result<u64, ProviderError> {
        let seqs = self.append(instance, generation, vec![event]).await?;
        seqs.first()
            .copied()
            .ok_or_else(|| ProviderError::permanent("append_event", "store returned no sequence number"))
    }

    /// Close `generation` with `OrchestrationContinuedAsNew` and start the next
    /// one with `new_input`, atomically. Returns the new generation.
    async fn continue_as_new(&self, instance: &str, generation: u64, new_input: &str) -> Result<u64, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Generations still retained for `instance`, ascending.
    async fn list_generations(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    /// Debug helper: pretty-print every instance's current history.
    async fn dump_all_pretty(&self) -> Result<String, ProviderError> {
        let mut out = String::new();
        for instance in self.list_instances().await? {
            let history = self.read(&instance).await?;
            out.push_str(&format!("instance={instance} generation={}\n", history.generation));
            for ev in history.events {
                out.push_str(&format!("  #{:<4} {:?}\n", ev.seq, ev.kind));
            }
        }
        Ok(out)
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn started_event(orchestration: &str, input: &str, generation: u64, timestamp_ms: u64) -> Event {
    Event::new(
        1,
        timestamp_ms,
        EventKind::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            generation,
        },
    )
}

/// Events to insert plus the seq reported for every requested event.
#[derive(Debug)]
pub(crate) struct AppendPlan {
    pub(crate) new_events: Vec<Event>,
    pub(crate) seqs: Vec<u64>,
}

/// Validate a batch against the existing generation and assign seqs and timestamps.
///
/// Shared by every provider so they agree on deduplication and correlation rules.
pub(crate) fn plan_append(
    instance: &str,
    existing: &[Event],
    incoming: Vec<EventKind>,
    now: u64,
) -> Result<AppendPlan, ProviderError> {
    const OP: &str = "append";
    let Some(last) = existing.last() else {
        return Err(ProviderError::invalid_event(
            OP,
            format!("instance '{instance}' has an empty generation"),
        ));
    };
    if last.kind.is_terminal() {
        return Err(ProviderError::terminal(OP, instance));
    }

    let mut activities: HashSet<u64> = HashSet::new();
    let mut timers: HashSet<u64> = HashSet::new();
    let mut closed: HashMap<u64, u64> = HashMap::new();
    let mut retries: HashMap<(u64, u32), u64> = HashMap::new();
    for ev in existing {
        track(&ev.kind, ev.seq, &mut activities, &mut timers, &mut closed, &mut retries);
    }

    let mut seq = last.seq;
    let mut timestamp_ms = now.max(last.timestamp_ms);
    let mut plan = AppendPlan {
        new_events: Vec::with_capacity(incoming.len()),
        seqs: Vec::with_capacity(incoming.len()),
    };
    let mut closed_by_batch = false;

    for kind in incoming {
        if closed_by_batch {
            return Err(ProviderError::invalid_event(
                OP,
                format!("{} follows a terminal event", kind.type_name()),
            ));
        }
        match &kind {
            EventKind::OrchestrationStarted { .. } => {
                return Err(ProviderError::invalid_event(
                    OP,
                    "OrchestrationStarted is only written by create_instance and continue_as_new",
                ));
            }
            EventKind::ActivityCompleted { scheduled, .. } | EventKind::ActivityFailed { scheduled, .. } => {
                if !activities.contains(scheduled) {
                    return Err(ProviderError::invalid_event(
                        OP,
                        format!("{} references unknown activity {scheduled}", kind.type_name()),
                    ));
                }
                if let Some(existing_seq) = closed.get(scheduled) {
                    plan.seqs.push(*existing_seq);
                    continue;
                }
            }
            EventKind::TimerFired { created } => {
                if !timers.contains(created) {
                    return Err(ProviderError::invalid_event(
                        OP,
                        format!("TimerFired references unknown timer {created}"),
                    ));
                }
                if let Some(existing_seq) = closed.get(created) {
                    plan.seqs.push(*existing_seq);
                    continue;
                }
            }
            EventKind::ActivityScheduled {
                retry_of: Some(first),
                attempt,
                ..
            } => {
                if !activities.contains(first) || closed.contains_key(first) {
                    return Err(ProviderError::invalid_event(
                        OP,
                        format!("retry record for activity {first} which is unknown or already closed"),
                    ));
                }
                if let Some(existing_seq) = retries.get(&(*first, *attempt)) {
                    plan.seqs.push(*existing_seq);
                    continue;
                }
            }
            _ => {}
        }

        seq += 1;
        timestamp_ms = timestamp_ms.max(now);
        track(&kind, seq, &mut activities, &mut timers, &mut closed, &mut retries);
        closed_by_batch = kind.is_terminal();
        plan.seqs.push(seq);
        plan.new_events.push(Event::new(seq, timestamp_ms, kind));
    }
    Ok(plan)
}

fn track(
    kind: &EventKind,
    seq: u64,
    activities: &mut HashSet<u64>,
    timers: &mut HashSet<u64>,
    closed: &mut HashMap<u64, u64>,
    retries: &mut HashMap<(u64, u32), u64>,
) {
    match kind {
        EventKind::ActivityScheduled { retry_of: None, .. } => {
            activities.insert(seq);
        }
        EventKind::ActivityScheduled {
            retry_of: Some(first),
            attempt,
            ..
        } => {
            retries.insert((*first, *attempt), seq);
        }
        EventKind::TimerCreated { .. } => {
            timers.insert(seq);
        }
        EventKind::ActivityCompleted { scheduled, .. } | EventKind::ActivityFailed { scheduled, .. } => {
            closed.entry(*scheduled).or_insert(seq);
        }
        EventKind::TimerFired { created } => {
            closed.entry(*created).or_insert(seq);
        }
        _ => {}
    }
}
