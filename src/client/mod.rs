use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::_typed_codec::{Codec, Json};
use crate::error::ClientError;
use crate::providers::InstanceHistory;
use crate::runtime::{
    last_activity_output, with_store_retry, OrchestrationState, RaiseOutcome, Runtime,
};
use crate::{Event, EventKind};

/// Control-plane handle for a running [`Runtime`].
///
/// Obtained from [`Runtime::client`]. Every operation goes through the
/// history store; the runtime is only nudged to run a turn afterwards.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub(crate) fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Start `orchestration` under a fresh UUID v4 instance id.
    pub async fn start_orchestration(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    pub async fn start_orchestration_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.runtime.orchestrations().resolve(orchestration)?;
        let input = input.into();
        let store = self.runtime.store();
        with_store_retry(self.runtime.store_retry_attempts(), "create_instance", || {
            store.create_instance(instance, orchestration, &input)
        })
        .await?;
        info!(target: "duraflow::runtime", instance_id = %instance, orchestration, "orchestration started");
        self.runtime.notify(instance);
        Ok(())
    }

    /// Start with a JSON encoded input.
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Serialization)?;
        self.start_orchestration(orchestration, payload).await
    }

    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationState, ClientError> {
        let history = self.read_history(instance).await?;
        Ok(OrchestrationState::from_history(&history))
    }

    /// State of a specific, possibly closed, generation.
    pub async fn get_generation_status(&self, instance: &str, generation: u64) -> Result<OrchestrationState, ClientError> {
        let events = self.runtime.store().read_generation(instance, generation).await?;
        if events.is_empty() {
            return Err(ClientError::NotFound(format!("{instance} generation {generation}")));
        }
        Ok(OrchestrationState::from_events(instance, generation, &events))
    }

    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        payload: impl Into<String>,
    ) -> Result<RaiseOutcome, ClientError> {
        self.runtime.router().raise(instance, name, &payload.into()).await
    }

    /// Close the instance with `OrchestrationTerminated`. Results still in
    /// flight are discarded when they arrive.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let reason = reason.into();
        let store = self.runtime.store();
        let attempts = self.runtime.store_retry_attempts();
        // retry once per continue-as-new that races the read
        for _ in 0..3 {
            let history = with_store_retry(attempts, "read", || store.read(instance)).await?;
            if history.is_terminal() {
                return Err(ClientError::NotRunning(instance.to_string()));
            }
            let event = EventKind::OrchestrationTerminated {
                reason: reason.clone(),
                last_output: last_activity_output(&history.events),
            };
            match store.append(instance, history.generation, vec![event]).await {
                Ok(_) => {
                    info!(target: "duraflow::runtime", instance_id = %instance, reason = %reason, "orchestration terminated");
                    self.runtime.notify(instance);
                    return Ok(());
                }
                Err(e) if e.kind == crate::providers::ProviderErrorKind::StaleGeneration => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClientError::NotRunning(instance.to_string()))
    }

    /// Poll until the instance reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationState, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let state = self.get_status(instance).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::WaitTimeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(100);
        }
    }

    pub async fn read_history(&self, instance: &str) -> Result<InstanceHistory, ClientError> {
        let store = self.runtime.store();
        Ok(with_store_retry(self.runtime.store_retry_attempts(), "read", || store.read(instance)).await?)
    }

    pub async fn read_generation(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.runtime.store().read_generation(instance, generation).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.runtime.store().list_instances().await?)
    }
}
