use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{with_store_retry, InstanceNotifier};
use crate::providers::{now_ms, HistoryStore};
use crate::EventKind;

/// Wait before firing a timer again after the store rejected `TimerFired`.
const REFIRE_DELAY_MS: u64 = 100;

/// A durable timer waiting to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerSchedule {
    pub(crate) instance: String,
    pub(crate) generation: u64,
    /// Seq of the `TimerCreated` event, which doubles as the timer id.
    pub(crate) created: u64,
    pub(crate) fire_at_ms: u64,
}

impl TimerSchedule {
    fn key(&self) -> String {
        format!("{}|{}|{}", self.instance, self.generation, self.created)
    }
}

#[derive(Clone)]
pub(crate) struct TimerHandle {
    tx: tokio::sync::mpsc::UnboundedSender<TimerSchedule>,
}

impl TimerHandle {
    /// Arrange for `TimerFired{created}` to be appended no earlier than `fire_at_ms`.
    pub(crate) fn schedule(&self, instance: &str, generation: u64, created: u64, fire_at_ms: u64) -> u64 {
        let item = TimerSchedule {
            instance: instance.to_string(),
            generation,
            created,
            fire_at_ms,
        };
        if self.tx.send(item).is_err() {
            warn!(target: "duraflow::runtime", instance_id = %instance, timer = created, "timer service stopped; timer will be recovered on restart");
        }
        created
    }
}

/// In-process timer service.
/// Keeps a min-heap of pending timers and appends `TimerFired` when they are due.
pub(crate) struct TimerService {
    store: Arc<dyn HistoryStore>,
    notifier: InstanceNotifier,
    rx: tokio::sync::mpsc::UnboundedReceiver<TimerSchedule>,
    items: HashMap<String, TimerSchedule>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    poller_idle_ms: u64,
    store_retry_attempts: u32,
}

impl TimerService {
    pub(crate) fn start(
        store: Arc<dyn HistoryStore>,
        notifier: InstanceNotifier,
        poller_idle_ms: u64,
        store_retry_attempts: u32,
    ) -> (tokio::task::JoinHandle<()>, TimerHandle) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<TimerSchedule>();
        let mut svc = TimerService {
            store,
            notifier,
            rx,
            items: HashMap::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
            store_retry_attempts,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, TimerHandle { tx })
    }

    async fn run(&mut self) {
        let mut closed = false;
        loop {
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            let now = now_ms();
            let mut due: Vec<TimerSchedule> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts > now {
                    break;
                }
                let _ = self.min_heap.pop();
                if let Some(item) = self.items.remove(&key) {
                    due.push(item);
                }
            }
            for item in due.drain(..) {
                if let Some(retry) = self.fire(item).await {
                    self.insert_item(retry);
                }
            }

            match self.min_heap.peek().cloned() {
                Some(Reverse((next_ts, _))) => {
                    let dur_ms = next_ts.saturating_sub(now_ms()).max(1);
                    if closed {
                        tokio::time::sleep(Duration::from_millis(dur_ms)).await;
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(dur_ms)) => {},
                        maybe = self.rx.recv() => match maybe {
                            Some(item) => self.insert_item(item),
                            None => {
                                closed = true;
                                tokio::time::sleep(Duration::from_millis(self.poller_idle_ms)).await;
                            }
                        },
                    }
                }
                None if closed => break,
                None => match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    None => break,
                },
            }
        }
        debug!(target: "duraflow::runtime", "timer service stopped");
    }

    fn insert_item(&mut self, item: TimerSchedule) {
        let key = item.key();
        if !self.items.contains_key(&key) {
            self.min_heap.push(Reverse((item.fire_at_ms, key.clone())));
            self.items.insert(key, item);
        }
    }

    /// Append `TimerFired`. Returns the timer re-armed for later when the store is unavailable.
    async fn fire(&self, mut item: TimerSchedule) -> Option<TimerSchedule> {
        let appended = with_store_retry(self.store_retry_attempts, "append TimerFired", || {
            self.store.append(
                &item.instance,
                item.generation,
                vec![EventKind::TimerFired { created: item.created }],
            )
        })
        .await;
        match appended {
            Ok(_) => {
                debug!(target: "duraflow::runtime", instance_id = %item.instance, timer = item.created, "timer fired");
                self.notifier.notify(&item.instance);
                None
            }
            Err(e) if e.is_closed_generation() => {
                debug!(target: "duraflow::runtime", instance_id = %item.instance, timer = item.created, "generation closed; dropping timer");
                None
            }
            Err(e) if e.is_retryable() => {
                warn!(target: "duraflow::runtime", instance_id = %item.instance, timer = item.created, error = %e, retry_in_ms = REFIRE_DELAY_MS, "failed to fire timer; re-arming");
                item.fire_at_ms = now_ms().saturating_add(REFIRE_DELAY_MS);
                Some(item)
            }
            Err(e) => {
                warn!(target: "duraflow::runtime", instance_id = %item.instance, timer = item.created, error = %e, "failed to fire timer");
                None
            }
        }
    }
}
