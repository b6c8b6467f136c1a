use std::sync::Arc;
use std::time::Duration;

use duraflow::patterns::video::{self, VideoConfig, VideoOutcome};
use duraflow::providers::sqlite::SqliteHistoryStore;
use duraflow::providers::HistoryStore;
use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry};
use duraflow::{EventKind, OrchestrationContext, OrchestrationStatus};

mod common;
use common::*;

fn timer_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Sleepy", |ctx: OrchestrationContext, input: String| async move {
            ctx.create_timer(Duration::from_millis(300)).await;
            let out = ctx.call_activity("Echo", input).await.map_err(|e| e.to_string())?;
            Ok(format!("woke:{out}"))
        })
        .build()
        .unwrap()
}

fn echo() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Echo", |_ctx, input: String| async move { Ok(input) })
        .build()
        .unwrap()
}

#[tokio::test]
async fn pending_timer_fires_after_restart() {
    let (store, _td, url) = sqlite_store_disk().await;
    let rt = start(store.clone(), echo(), timer_orchestrations()).await;
    let id = rt.client().start_orchestration("Sleepy", "x").await.unwrap();
    assert!(
        wait_for_history(
            &store,
            &id,
            |events| events.iter().any(|e| matches!(e.kind, EventKind::TimerCreated { .. })),
            WAIT
        )
        .await
    );
    rt.shutdown().await;
    drop(store);

    let reopened = Arc::new(SqliteHistoryStore::new(&url).await.unwrap()) as Arc<dyn HistoryStore>;
    let rt = start(reopened, echo(), timer_orchestrations()).await;
    let state = rt.client().wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("woke:x"));
    rt.shutdown().await;
}

#[tokio::test]
async fn open_activity_is_dispatched_again_after_restart() {
    let (store, _td, url) = sqlite_store_disk().await;
    // the first runtime never completes the activity
    let stuck = ActivityRegistry::builder()
        .register("Echo", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        })
        .build()
        .unwrap();
    let orchestrations = || {
        OrchestrationRegistry::builder()
            .register("Once", |ctx: OrchestrationContext, input: String| async move {
                ctx.call_activity("Echo", input).await.map_err(|e| e.to_string())
            })
            .build()
            .unwrap()
    };
    let rt = start(store.clone(), stuck, orchestrations()).await;
    let id = rt.client().start_orchestration("Once", "again").await.unwrap();
    assert!(
        wait_for_history(
            &store,
            &id,
            |events| events.iter().any(|e| matches!(e.kind, EventKind::ActivityScheduled { .. })),
            WAIT
        )
        .await
    );
    rt.shutdown().await;
    drop(store);

    let reopened = Arc::new(SqliteHistoryStore::new(&url).await.unwrap()) as Arc<dyn HistoryStore>;
    let rt = start(reopened, echo(), orchestrations()).await;
    let state = rt.client().wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.output.as_deref(), Some("again"));
    rt.shutdown().await;
}

#[tokio::test]
async fn video_chain_runs_on_sqlite() {
    let (store, _td, _url) = sqlite_store_disk().await;
    let rt = start_video(store, &VideoConfig::fast()).await;
    let client = rt.client();

    let id = client.start_orchestration(video::PROCESS_VIDEO, "clip").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    let outcome: VideoOutcome = serde_json::from_str(state.output.as_deref().unwrap()).unwrap();
    assert!(matches!(outcome, VideoOutcome::Processed { transcoded, .. } if transcoded == "clip-transcoded.mp4"));
    rt.shutdown().await;
}
