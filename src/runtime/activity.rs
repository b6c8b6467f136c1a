use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ::futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{panic_message, with_store_retry, ActivityContext, ActivityRegistry, InstanceNotifier};
use crate::error::RuntimeError;
use crate::providers::{now_ms, HistoryStore};
use crate::{ErrorDetails, EventKind, RetryPolicy};

/// Wait before re-running an attempt whose result the store could not take.
const REDISPATCH_DELAY_MS: u64 = 100;

/// One execution attempt of a scheduled activity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActivityWorkItem {
    pub(crate) instance: String,
    pub(crate) generation: u64,
    /// Seq of the first `ActivityScheduled` record; completions point here.
    pub(crate) scheduled: u64,
    pub(crate) name: String,
    pub(crate) input: String,
    pub(crate) attempt: u32,
    pub(crate) retry: Option<RetryPolicy>,
}

/// Sending half of the bounded activity queue.
#[derive(Clone)]
pub(crate) struct ActivityDispatcher {
    tx: mpsc::Sender<ActivityWorkItem>,
}

impl ActivityDispatcher {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ActivityWorkItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an attempt, waiting while the queue is full.
    pub(crate) async fn invoke(&self, item: ActivityWorkItem) -> Result<(), RuntimeError> {
        self.tx.send(item).await.map_err(|_| RuntimeError::QueueClosed)
    }

    /// Queue an attempt once `delay` has elapsed.
    pub(crate) fn invoke_after(&self, item: ActivityWorkItem, delay: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = dispatcher.invoke(item).await {
                debug!(target: "duraflow::activity", error = %e, "delayed dispatch dropped");
            }
        });
    }
}

/// State shared by every worker.
pub(crate) struct WorkerShared {
    pub(crate) store: Arc<dyn HistoryStore>,
    pub(crate) activities: ActivityRegistry,
    pub(crate) notifier: InstanceNotifier,
    pub(crate) dispatcher: ActivityDispatcher,
    pub(crate) store_retry_attempts: u32,
}

pub(crate) fn start_workers(
    rx: mpsc::Receiver<ActivityWorkItem>,
    shared: WorkerShared,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let shared = Arc::new(shared);
    (0..concurrency)
        .map(|worker_id| {
            let rx = rx.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(item) = next else {
                        debug!(target: "duraflow::activity", worker_id, "activity queue closed; worker exiting");
                        break;
                    };
                    shared.execute(worker_id, item).await;
                }
            })
        })
        .collect()
}

impl WorkerShared {
    async fn execute(&self, worker_id: usize, item: ActivityWorkItem) {
        let handler = match self.activities.resolve(&item.name) {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "duraflow::activity", instance_id = %item.instance, activity_name = %item.name, "unknown activity");
                self.record(
                    &item,
                    EventKind::ActivityFailed {
                        scheduled: item.scheduled,
                        error: (&e).into(),
                    },
                    true,
                )
                .await;
                return;
            }
        };

        debug!(
            target: "duraflow::activity",
            instance_id = %item.instance,
            activity_name = %item.name,
            attempt = item.attempt,
            worker_id,
            "activity started"
        );
        let ctx = ActivityContext::new(&item.instance, &item.name, item.attempt, item.generation);
        let started = std::time::Instant::now();
        let result = match AssertUnwindSafe(handler.invoke(ctx, item.input.clone()))
            .catch_unwind()
            .await
        {
            Ok(r) => r,
            Err(panic) => Err(format!("activity panicked: {}", panic_message(panic.as_ref()))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(target: "duraflow::activity", instance_id = %item.instance, activity_name = %item.name, attempt = item.attempt, duration_ms, "activity completed");
                self.record(
                    &item,
                    EventKind::ActivityCompleted {
                        scheduled: item.scheduled,
                        output,
                    },
                    true,
                )
                .await;
            }
            Err(message) => match item.retry.clone() {
                Some(policy) if policy.has_attempts_remaining(item.attempt) => {
                    let delay = policy.delay_for_attempt(item.attempt);
                    let next_attempt = item.attempt + 1;
                    info!(
                        target: "duraflow::activity",
                        instance_id = %item.instance,
                        activity_name = %item.name,
                        attempt = item.attempt,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "activity failed; retrying"
                    );
                    let retry_record = EventKind::ActivityScheduled {
                        name: item.name.clone(),
                        input: item.input.clone(),
                        attempt: next_attempt,
                        retry: Some(policy),
                        retry_of: Some(item.scheduled),
                        not_before_ms: now_ms().saturating_add(crate::saturating_millis(delay)),
                    };
                    if self.record(&item, retry_record, false).await {
                        self.dispatcher.invoke_after(
                            ActivityWorkItem {
                                attempt: next_attempt,
                                ..item
                            },
                            delay,
                        );
                    }
                }
                _ => {
                    warn!(
                        target: "duraflow::activity",
                        instance_id = %item.instance,
                        activity_name = %item.name,
                        attempts = item.attempt,
                        error = %message,
                        "activity failed"
                    );
                    self.record(
                        &item,
                        EventKind::ActivityFailed {
                            scheduled: item.scheduled,
                            error: ErrorDetails::ActivityExecution {
                                activity: item.name.clone(),
                                attempts: item.attempt,
                                message,
                            },
                        },
                        true,
                    )
                    .await;
                }
            },
        }
    }

    /// Append `event` for the item's generation. Returns false when the result was discarded.
    ///
    /// A store that stays unavailable past the retry budget gets the same
    /// attempt dispatched again later, so the outcome is eventually recorded.
    async fn record(&self, item: &ActivityWorkItem, event: EventKind, notify: bool) -> bool {
        let appended = with_store_retry(self.store_retry_attempts, "append activity result", || {
            self.store.append(&item.instance, item.generation, vec![event.clone()])
        })
        .await;
        match appended {
            Ok(_) => {
                if notify {
                    self.notifier.notify(&item.instance);
                }
                true
            }
            Err(e) if e.is_closed_generation() => {
                debug!(target: "duraflow::activity", instance_id = %item.instance, activity_name = %item.name, error = %e, "generation closed; discarding result");
                false
            }
            Err(e) if e.is_retryable() => {
                warn!(target: "duraflow::activity", instance_id = %item.instance, activity_name = %item.name, attempt = item.attempt, error = %e, "failed to record activity result; dispatching the attempt again");
                self.dispatcher
                    .invoke_after(item.clone(), Duration::from_millis(REDISPATCH_DELAY_MS));
                false
            }
            Err(e) => {
                warn!(target: "duraflow::activity", instance_id = %item.instance, activity_name = %item.name, error = %e, "failed to record activity result");
                false
            }
        }
    }
}
