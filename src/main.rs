//! Runs the video processing sample against an in-memory store.
//!
//! Every pattern runs once with millisecond-scale delays: a successful chain,
//! a chain whose thumbnail step keeps failing, the fan-out pipeline, an
//! approval that is answered and one that times out, and a few generations of
//! the periodic orchestration before it is terminated.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use duraflow::patterns::video::{self, VideoConfig};
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::runtime::{ActivityRegistry, LogFormat, ObservabilityConfig, OrchestrationRegistry};
use duraflow::{Client, OrchestrationState, Runtime, RuntimeOptions};

const WAIT: Duration = Duration::from_secs(10);

fn print_state(label: &str, state: &OrchestrationState) {
    println!("{label}: status={:?} generation={}", state.status, state.generation);
    if let Some(output) = &state.output {
        println!("  output: {output}");
    }
    if let Some(error) = &state.error {
        println!("  error: {error}");
    }
}

async fn run(client: &Client, label: &str, orchestration: &str, input: &str) -> Result<(), Box<dyn Error>> {
    let id = client.start_orchestration(orchestration, input).await?;
    let state = client.wait_for_orchestration(&id, WAIT).await?;
    print_state(label, &state);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = VideoConfig::fast().with_approval_timeout(Duration::from_millis(300));
    let activities = video::register_activities(ActivityRegistry::builder(), &config).build()?;
    let orchestrations = video::register_orchestrations(OrchestrationRegistry::builder(), &config).build()?;

    let options = RuntimeOptions::default().with_observability(ObservabilityConfig {
        log_format: LogFormat::Compact,
        log_level: "warn".to_string(),
    });
    let store = Arc::new(InMemoryHistoryStore::default());
    let rt = Runtime::start(store, activities, orchestrations, options).await?;
    let client = rt.client();

    run(&client, "chain", video::PROCESS_VIDEO, "holiday").await?;
    run(&client, "chain with failing thumbnail", video::PROCESS_VIDEO, "error-clip").await?;
    run(&client, "fan-out", video::PROCESS_VIDEO_FAN_OUT, "holiday").await?;

    let approved = client
        .start_orchestration(video::PROCESS_VIDEO_WITH_APPROVAL, "holiday")
        .await?;
    // answered before the pipeline reaches the wait; the event is buffered
    client.raise_event(&approved, video::APPROVAL_EVENT, video::APPROVED).await?;
    print_state("approval", &client.wait_for_orchestration(&approved, WAIT).await?);
    run(&client, "approval timeout", video::PROCESS_VIDEO_WITH_APPROVAL, "holiday").await?;

    let periodic = client.start_orchestration(video::PERIODIC, "0").await?;
    tokio::time::sleep(config.periodic_interval * 4).await;
    client.terminate(&periodic, "demo finished").await?;
    print_state("periodic", &client.wait_for_orchestration(&periodic, WAIT).await?);

    rt.shutdown().await;
    Ok(())
}
