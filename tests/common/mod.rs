#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use duraflow::patterns::video::{self, VideoConfig};
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::sqlite::SqliteHistoryStore;
use duraflow::providers::{HistoryStore, InstanceHistory, ProviderError};
use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry};
use duraflow::{Event, EventKind, Runtime, RuntimeOptions};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::default())
}

/// SQLite file in a fresh temp dir. Keep the `TempDir` alive for the test.
pub async fn sqlite_store_disk() -> (Arc<dyn HistoryStore>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("history.db");
    let url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteHistoryStore::new(&url).await.unwrap()) as Arc<dyn HistoryStore>;
    (store, td, url)
}

pub async fn start(
    store: Arc<dyn HistoryStore>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
) -> Arc<Runtime> {
    Runtime::start(store, activities, orchestrations, RuntimeOptions::default())
        .await
        .unwrap()
}

pub async fn start_video(store: Arc<dyn HistoryStore>, config: &VideoConfig) -> Arc<Runtime> {
    let activities = video::register_activities(ActivityRegistry::builder(), config)
        .build()
        .unwrap();
    let orchestrations = video::register_orchestrations(OrchestrationRegistry::builder(), config)
        .build()
        .unwrap();
    start(store, activities, orchestrations).await
}

/// Poll the current generation until `predicate` holds.
pub async fn wait_for_history<F>(store: &Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout: Duration) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(h) = store.read(instance).await {
            if predicate(&h.events) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_wait(store: &Arc<dyn HistoryStore>, instance: &str, name: &str) -> bool {
    wait_for_history(
        store,
        instance,
        |events| {
            events
                .iter()
                .any(|e| matches!(&e.kind, EventKind::EventAwaited { name: n } if n == name))
        },
        WAIT,
    )
    .await
}

pub fn scheduled_attempts(events: &[Event], activity: &str) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { name, attempt, .. } if name == activity => Some(*attempt),
            _ => None,
        })
        .collect()
}

pub fn scheduled_inputs(events: &[Event], activity: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled {
                name,
                input,
                retry_of: None,
                ..
            } if name == activity => Some(input.clone()),
            _ => None,
        })
        .collect()
}

/// In-memory store that rejects appends carrying a matching event with a
/// retryable error, `failures` times, then behaves normally.
pub struct FlakyStore {
    inner: InMemoryHistoryStore,
    rejects: fn(&EventKind) -> bool,
    remaining: AtomicU32,
}

impl FlakyStore {
    pub fn new(rejects: fn(&EventKind) -> bool, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryHistoryStore::default(),
            rejects,
            remaining: AtomicU32::new(failures),
        })
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FlakyStore {
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        self.inner.create_instance(instance, orchestration, input).await
    }

    async fn read(&self, instance: &str) -> Result<InstanceHistory, ProviderError> {
        self.inner.read(instance).await
    }

    async fn read_generation(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_generation(instance, generation).await
    }

    async fn append(&self, instance: &str, generation: u64, events: Vec<EventKind>) -> Result<Vec<u64>, ProviderError> {
        if events.iter().any(|e| (self.rejects)(e))
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(ProviderError::retryable("append", "database is locked"));
        }
        self.inner.append(instance, generation, events).await
    }

    async fn continue_as_new(&self, instance: &str, generation: u64, new_input: &str) -> Result<u64, ProviderError> {
        self.inner.continue_as_new(instance, generation, new_input).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn list_generations(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        self.inner.list_generations(instance).await
    }
}
