//! Replay-safe logging for orchestration code.
//!
//! Orchestrations re-run from the start on every turn. These macros only emit
//! while the context is executing new steps, so each line shows up once per
//! real transition instead of once per replay.
//!
//! ```rust,no_run
//! # use duraflow::{durable_info, OrchestrationContext};
//! # async fn orch(ctx: OrchestrationContext) {
//! durable_info!(ctx, video = "v1", "transcoding started");
//! # }
//! ```

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(target: "duraflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(target: "duraflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(target: "duraflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(target: "duraflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}
