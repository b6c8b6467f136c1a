use std::time::Duration;

use duraflow::patterns::video::{self, VideoConfig, VideoOutcome};
use duraflow::{ErrorDetails, OrchestrationStatus};

mod common;
use common::*;

fn outcome(output: Option<&str>) -> VideoOutcome {
    serde_json::from_str(output.expect("completed with output")).unwrap()
}

#[tokio::test]
async fn chain_runs_every_step_in_order() {
    let store = memory_store();
    let rt = start_video(store.clone(), &VideoConfig::fast()).await;
    let client = rt.client();

    let id = client.start_orchestration(video::PROCESS_VIDEO, "holiday").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(
        outcome(state.output.as_deref()),
        VideoOutcome::Processed {
            transcoded: "holiday-transcoded.mp4".into(),
            thumbnail: "holiday-transcoded.mp4-thumbnail.mp4".into(),
            with_intro: "holiday-transcoded.mp4-withintro.mp4".into(),
            approval: None,
        }
    );

    let history = client.read_history(&id).await.unwrap();
    assert!(scheduled_inputs(&history.events, video::CLEANUP).is_empty());
    assert_eq!(scheduled_inputs(&history.events, video::PREPEND_INTRO), vec!["holiday-transcoded.mp4"]);
    rt.shutdown().await;
}

#[tokio::test]
async fn chain_failure_retries_then_cleans_up_once() {
    let store = memory_store();
    let rt = start_video(store.clone(), &VideoConfig::fast()).await;
    let client = rt.client();

    let id = client.start_orchestration(video::PROCESS_VIDEO, "error-clip").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    // the failure is handled by the orchestration, so the instance itself completes
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(
        outcome(state.output.as_deref()),
        VideoOutcome::Failed {
            error: video::PROCESSING_FAILED.into(),
            message: video::THUMBNAIL_FAILED.into(),
            failed_step: video::EXTRACT_THUMBNAIL.into(),
            cleanup: "Cleaned up successfully".into(),
        }
    );

    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(scheduled_attempts(&events, video::EXTRACT_THUMBNAIL), vec![1, 2, 3, 4]);
    assert!(scheduled_inputs(&events, video::PREPEND_INTRO).is_empty());
    assert_eq!(
        scheduled_inputs(&events, video::CLEANUP),
        vec![r#"["error-clip-transcoded.mp4","",""]"#]
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn fan_out_keeps_the_highest_bit_rate() {
    let store = memory_store();
    let rt = start_video(store.clone(), &VideoConfig::fast()).await;
    let client = rt.client();

    let id = client
        .start_orchestration(video::PROCESS_VIDEO_FAN_OUT, "holiday")
        .await
        .unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(
        outcome(state.output.as_deref()),
        VideoOutcome::Processed {
            transcoded: "holiday-4000kbps.mp4".into(),
            thumbnail: "holiday-4000kbps.mp4-thumbnail.mp4".into(),
            with_intro: "holiday-4000kbps.mp4-withintro.mp4".into(),
            approval: None,
        }
    );
    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(
        scheduled_inputs(&events, video::TRANSCODE_VIDEO_WITH_BIT_RATE).len(),
        video::BIT_RATES.len()
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn fan_out_failure_in_later_step_cleans_up_the_best_rendition() {
    let store = memory_store();
    let rt = start_video(store.clone(), &VideoConfig::fast()).await;
    let client = rt.client();

    let id = client
        .start_orchestration(video::PROCESS_VIDEO_FAN_OUT, "error-clip")
        .await
        .unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert!(matches!(
        outcome(state.output.as_deref()),
        VideoOutcome::Failed { failed_step, .. } if failed_step == video::EXTRACT_THUMBNAIL
    ));
    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(
        scheduled_inputs(&events, video::CLEANUP),
        vec![r#"["error-clip-4000kbps.mp4","",""]"#]
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn approved_video_is_published() {
    let store = memory_store();
    let config = VideoConfig::fast().with_approval_timeout(Duration::from_secs(30));
    let rt = start_video(store.clone(), &config).await;
    let client = rt.client();

    let id = client
        .start_orchestration(video::PROCESS_VIDEO_WITH_APPROVAL, "holiday")
        .await
        .unwrap();
    assert!(wait_for_wait(&store, &id, video::APPROVAL_EVENT).await);
    client.raise_event(&id, video::APPROVAL_EVENT, video::APPROVED).await.unwrap();

    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert!(matches!(
        outcome(state.output.as_deref()),
        VideoOutcome::Processed { approval: Some(a), .. } if a == video::APPROVED
    ));
    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(
        scheduled_inputs(&events, video::SEND_APPROVAL_REQUEST_EMAIL),
        vec!["holiday-4000kbps.mp4-withintro.mp4"]
    );
    assert_eq!(scheduled_inputs(&events, video::PUBLISH_VIDEO).len(), 1);
    assert!(scheduled_inputs(&events, video::REJECT_VIDEO).is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn any_other_answer_rejects() {
    let store = memory_store();
    let config = VideoConfig::fast().with_approval_timeout(Duration::from_secs(30));
    let rt = start_video(store.clone(), &config).await;
    let client = rt.client();

    let id = client
        .start_orchestration(video::PROCESS_VIDEO_WITH_APPROVAL, "holiday")
        .await
        .unwrap();
    assert!(wait_for_wait(&store, &id, video::APPROVAL_EVENT).await);
    client
        .raise_event(&id, video::APPROVAL_EVENT, r#""Rejected""#)
        .await
        .unwrap();

    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert!(matches!(
        outcome(state.output.as_deref()),
        VideoOutcome::Processed { approval: Some(a), .. } if a == "Rejected"
    ));
    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(scheduled_inputs(&events, video::REJECT_VIDEO).len(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn unanswered_approval_times_out_and_rejects() {
    let store = memory_store();
    let config = VideoConfig::fast().with_approval_timeout(Duration::from_millis(100));
    let rt = start_video(store.clone(), &config).await;
    let client = rt.client();

    let id = client
        .start_orchestration(video::PROCESS_VIDEO_WITH_APPROVAL, "holiday")
        .await
        .unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert!(matches!(
        outcome(state.output.as_deref()),
        VideoOutcome::Processed { approval: Some(a), .. } if a == video::TIMED_OUT
    ));
    let events = client.read_history(&id).await.unwrap().events;
    assert_eq!(scheduled_inputs(&events, video::REJECT_VIDEO).len(), 1);

    // the deadline is decided; a late answer finds nothing running
    assert!(client.raise_event(&id, video::APPROVAL_EVENT, video::APPROVED).await.is_err());
    rt.shutdown().await;
}

#[tokio::test]
async fn periodic_continues_as_new_until_terminated() {
    let store = memory_store();
    let config = VideoConfig::fast().with_periodic_interval(Duration::from_millis(20));
    let rt = start_video(store.clone(), &config).await;
    let client = rt.client();

    let id = client.start_orchestration(video::PERIODIC, "0").await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while store.read(&id).await.unwrap().generation < 3 {
        assert!(tokio::time::Instant::now() < deadline, "periodic did not advance");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.terminate(&id, "enough").await.unwrap();

    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Terminated);
    assert_eq!(
        state.error,
        Some(ErrorDetails::TerminationRequested {
            reason: "enough".into()
        })
    );
    // generation n starts with the count produced by generation n - 1
    assert_eq!(state.input, (state.generation - 1).to_string());

    let previous = client
        .get_generation_status(&id, state.generation - 1)
        .await
        .unwrap();
    assert_eq!(previous.status, OrchestrationStatus::ContinuedAsNew);
    assert_eq!(previous.output.as_deref(), Some(state.input.as_str()));

    // each generation only holds its own few events
    let events = client.read_generation(&id, state.generation - 1).await.unwrap();
    assert!(events.len() <= 6, "{events:?}");
    rt.shutdown().await;
}
