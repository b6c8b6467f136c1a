use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{with_store_retry, InstanceNotifier};
use crate::error::ClientError;
use crate::providers::{HistoryStore, ProviderErrorKind};
use crate::EventKind;

/// What happens to an event raised while the instance is not waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnmatchedEventPolicy {
    /// Record it; the next wait with that name takes it.
    #[default]
    Buffer,
    /// Discard it.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaiseOutcome {
    /// The instance's last turn was waiting for this name.
    Delivered,
    /// Recorded for a later wait.
    Buffered,
    /// Discarded under [`UnmatchedEventPolicy::Drop`].
    Dropped,
}

/// Routes raised events into instance histories.
///
/// Waiting sets are refreshed after every turn; they only decide between
/// delivered, buffered and dropped. Pairing itself happens during replay.
pub(crate) struct ExternalEventRouter {
    store: Arc<dyn HistoryStore>,
    notifier: InstanceNotifier,
    policy: UnmatchedEventPolicy,
    store_retry_attempts: u32,
    waiting: Mutex<HashMap<String, (u64, Vec<String>)>>,
}

impl ExternalEventRouter {
    pub(crate) fn new(
        store: Arc<dyn HistoryStore>,
        notifier: InstanceNotifier,
        policy: UnmatchedEventPolicy,
        store_retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            store_retry_attempts,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_waiting(&self, instance: &str, generation: u64, names: Vec<String>) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if names.is_empty() {
            waiting.remove(instance);
        } else {
            waiting.insert(instance.to_string(), (generation, names));
        }
    }

    pub(crate) fn clear(&self, instance: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance);
    }

    fn is_waiting(&self, instance: &str, generation: u64, name: &str) -> bool {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance)
            .is_some_and(|(g, names)| *g == generation && names.iter().any(|n| n == name))
    }

    pub(crate) async fn raise(&self, instance: &str, name: &str, payload: &str) -> Result<RaiseOutcome, ClientError> {
        // a continue-as-new between read and append moves the generation; retry against the new one
        let mut stale_retries = 3;
        loop {
            let history = with_store_retry(self.store_retry_attempts, "read", || self.store.read(instance)).await?;
            if history.is_terminal() {
                return Err(ClientError::NotRunning(instance.to_string()));
            }
            let generation = history.generation;
            let waiting = self.is_waiting(instance, generation, name);
            if !waiting && self.policy == UnmatchedEventPolicy::Drop {
                info!(target: "duraflow::runtime", instance_id = %instance, event = %name, "no waiter; event dropped");
                return Ok(RaiseOutcome::Dropped);
            }

            let event = EventKind::EventRaised {
                name: name.to_string(),
                payload: payload.to_string(),
            };
            let appended = with_store_retry(self.store_retry_attempts, "append EventRaised", || {
                self.store.append(instance, generation, vec![event.clone()])
            })
            .await;
            match appended {
                Ok(_) => {
                    self.notifier.notify(instance);
                    let outcome = if waiting {
                        RaiseOutcome::Delivered
                    } else {
                        RaiseOutcome::Buffered
                    };
                    debug!(target: "duraflow::runtime", instance_id = %instance, event = %name, ?outcome, "event raised");
                    return Ok(outcome);
                }
                Err(e) if e.kind == ProviderErrorKind::StaleGeneration && stale_retries > 0 => {
                    stale_retries -= 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;

    async fn router(policy: UnmatchedEventPolicy) -> (ExternalEventRouter, Arc<dyn HistoryStore>) {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        store.create_instance("i", "O", "").await.unwrap();
        let (notifier, _rx) = InstanceNotifier::channel();
        (ExternalEventRouter::new(store.clone(), notifier, policy, 3), store)
    }

    #[tokio::test]
    async fn buffered_until_a_wait_exists() {
        let (router, store) = router(UnmatchedEventPolicy::Buffer).await;
        assert_eq!(router.raise("i", "Go", "1").await.unwrap(), RaiseOutcome::Buffered);
        router.set_waiting("i", 1, vec!["Go".into()]);
        assert_eq!(router.raise("i", "Go", "2").await.unwrap(), RaiseOutcome::Delivered);
        let raised = store
            .read("i")
            .await
            .unwrap()
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::EventRaised { .. }))
            .count();
        assert_eq!(raised, 2);
    }

    #[tokio::test]
    async fn drop_policy_discards_unmatched_events() {
        let (router, store) = router(UnmatchedEventPolicy::Drop).await;
        assert_eq!(router.raise("i", "Go", "1").await.unwrap(), RaiseOutcome::Dropped);
        assert_eq!(store.read("i").await.unwrap().events.len(), 1);
        router.set_waiting("i", 1, vec!["Go".into()]);
        assert_eq!(router.raise("i", "Other", "1").await.unwrap(), RaiseOutcome::Dropped);
        assert_eq!(router.raise("i", "Go", "1").await.unwrap(), RaiseOutcome::Delivered);
    }

    #[tokio::test]
    async fn unknown_and_closed_instances_are_errors() {
        let (router, store) = router(UnmatchedEventPolicy::Buffer).await;
        assert!(matches!(router.raise("nope", "Go", "").await, Err(ClientError::NotFound(_))));
        store
            .append_event("i", 1, EventKind::OrchestrationCompleted { output: "".into() })
            .await
            .unwrap();
        assert!(matches!(router.raise("i", "Go", "").await, Err(ClientError::NotRunning(_))));
    }
}
