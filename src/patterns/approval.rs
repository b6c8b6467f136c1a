//! Ask a human, then wait for their answer or a deadline.

use std::time::Duration;

use crate::{durable_info, durable_warn, ErrorDetails, OrchestrationContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    /// Payload of the event that arrived before the deadline.
    Responded(String),
    TimedOut,
}

/// Run `notify_activity`, then wait up to `timeout` for `event`.
///
/// The timeout is a durable timer, so the deadline survives restarts. A
/// failing notification is returned as an error without waiting.
pub async fn request_interaction(
    ctx: &OrchestrationContext,
    notify_activity: &str,
    notify_input: impl Into<String>,
    event: &str,
    timeout: Duration,
) -> Result<Interaction, ErrorDetails> {
    ctx.call_activity(notify_activity, notify_input).await?;
    durable_info!(ctx, event, timeout_ms = timeout.as_millis() as u64, "waiting for response");
    match ctx.wait_for_event_with_timeout(event, timeout).await {
        Ok(payload) => Ok(Interaction::Responded(payload)),
        Err(ErrorDetails::Timeout { .. }) => {
            durable_warn!(ctx, event, "no response before the deadline");
            Ok(Interaction::TimedOut)
        }
        Err(other) => Err(other),
    }
}
