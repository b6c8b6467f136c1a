use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::{now_ms, plan_append, started_event, HistoryStore, InstanceHistory, ProviderError};
use crate::{Event, EventKind};

struct InstanceLog {
    orchestration: String,
    current: u64,
    generations: BTreeMap<u64, Vec<Event>>,
}

impl InstanceLog {
    fn current_events(&self) -> &[Event] {
        self.generations.get(&self.current).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Volatile history store for tests and demos.
///
/// Each instance has its own lock, so appends to unrelated instances never
/// wait on each other.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    instances: RwLock<HashMap<String, Arc<Mutex<InstanceLog>>>>,
}

impl InMemoryHistoryStore {
    async fn log(&self, operation: &str, instance: &str) -> Result<Arc<Mutex<InstanceLog>>, ProviderError> {
        self.instances
            .read()
            .await
            .get(instance)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(operation, instance))
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let mut map = self.instances.write().await;
        if map.contains_key(instance) {
            return Err(ProviderError::already_exists("create_instance", instance));
        }
        let mut generations = BTreeMap::new();
        generations.insert(1, vec![started_event(orchestration, input, 1, now_ms())]);
        map.insert(
            instance.to_string(),
            Arc::new(Mutex::new(InstanceLog {
                orchestration: orchestration.to_string(),
                current: 1,
                generations,
            })),
        );
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<InstanceHistory, ProviderError> {
        let log = self.log("read", instance).await?;
        let log = log.lock().await;
        Ok(InstanceHistory {
            instance: instance.to_string(),
            generation: log.current,
            events: log.current_events().to_vec(),
        })
    }

    async fn read_generation(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let log = self.log("read_generation", instance).await?;
        let log = log.lock().await;
        Ok(log.generations.get(&generation).cloned().unwrap_or_default())
    }

    async fn append(&self, instance: &str, generation: u64, events: Vec<EventKind>) -> Result<Vec<u64>, ProviderError> {
        let log = self.log("append", instance).await?;
        let mut log = log.lock().await;
        if generation != log.current {
            return Err(ProviderError::stale_generation("append", instance));
        }
        let plan = plan_append(instance, log.current_events(), events, now_ms())?;
        let current = log.current;
        log.generations.entry(current).or_default().extend(plan.new_events);
        Ok(plan.seqs)
    }

    async fn continue_as_new(&self, instance: &str, generation: u64, new_input: &str) -> Result<u64, ProviderError> {
        let log = self.log("continue_as_new", instance).await?;
        let mut log = log.lock().await;
        if generation != log.current {
            return Err(ProviderError::stale_generation("continue_as_new", instance));
        }
        let closing = EventKind::OrchestrationContinuedAsNew {
            new_input: new_input.to_string(),
        };
        let plan = plan_append(instance, log.current_events(), vec![closing], now_ms())?;
        let closed_at = plan.new_events.last().map(|e| e.timestamp_ms).unwrap_or_else(now_ms);
        log.generations.entry(generation).or_default().extend(plan.new_events);

        let next = generation + 1;
        let started = started_event(&log.orchestration, new_input, next, closed_at);
        log.generations.insert(next, vec![started]);
        log.current = next;
        // keep the generation just closed for diagnostics, drop anything older
        log.generations.retain(|g, _| *g + 1 >= next);
        Ok(next)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_generations(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let log = self.log("list_generations", instance).await?;
        let log = log.lock().await;
        Ok(log.generations.keys().copied().collect())
    }
}
