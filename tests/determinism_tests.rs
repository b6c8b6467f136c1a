//! Replay must reach the same decisions from the same history, whatever order
//! the concurrent work happened to finish in.

use std::time::Duration;

use duraflow::patterns::fan_out_fan_in;
use duraflow::runtime::{run_turn, ActivityRegistry, OrchestrationRegistry, TurnOptions, TurnResult};
use duraflow::{Action, Event, EventKind, FanOutPolicy, OrchestrationContext, OrchestrationStatus};
use proptest::prelude::*;

mod common;
use common::*;

const INPUTS: [u64; 5] = [1, 2, 3, 4, 5];

async fn square_then_sum(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    let squares: Vec<u64> = fan_out_fan_in(&ctx, "Square", &INPUTS, FanOutPolicy::WaitAll)
        .await
        .map_err(|f| f.to_string())?;
    let total: u64 = ctx
        .call_activity_typed("Sum", &squares)
        .await
        .map_err(|e| e.to_string())?;
    Ok(total.to_string())
}

fn started(input: &str) -> Event {
    Event::new(
        1,
        0,
        EventKind::OrchestrationStarted {
            name: "SquareThenSum".into(),
            input: input.into(),
            generation: 1,
        },
    )
}

fn push(history: &mut Vec<Event>, timestamp_ms: u64, kind: EventKind) -> u64 {
    let seq = history.len() as u64 + 1;
    history.push(Event::new(seq, timestamp_ms, kind));
    seq
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fan_in_result_ignores_completion_order(order in Just((0..INPUTS.len()).collect::<Vec<_>>()).prop_shuffle()) {
        let mut history = vec![started("")];
        let first = run_turn(&history, TurnOptions::new("p"), square_then_sum);
        prop_assert_eq!(first.actions.len(), INPUTS.len());
        let scheduled: Vec<u64> = first
            .opening_events()
            .into_iter()
            .map(|k| push(&mut history, 0, k))
            .collect();

        for (t, i) in order.iter().enumerate() {
            let output = (INPUTS[*i] * INPUTS[*i]).to_string();
            push(&mut history, t as u64 + 1, EventKind::ActivityCompleted { scheduled: scheduled[*i], output });
        }

        let second = run_turn(&history, TurnOptions::new("p"), square_then_sum);
        prop_assert_eq!(
            second.actions.clone(),
            vec![Action::CallActivity { name: "Sum".into(), input: "[1,4,9,16,25]".into(), retry: None }]
        );
        let sum = push(&mut history, 10, second.opening_events().remove(0));
        push(&mut history, 11, EventKind::ActivityCompleted { scheduled: sum, output: "55".into() });

        let last = run_turn(&history, TurnOptions::new("p"), square_then_sum);
        prop_assert!(last.actions.is_empty());
        prop_assert_eq!(last.result, TurnResult::Completed("55".into()));
    }

    #[test]
    fn event_beats_timeout_only_when_raised_before_the_deadline(raised_at in 0u64..20_000) {
        let wait = |ctx: OrchestrationContext, _input: String| async move {
            match ctx.wait_for_event_with_timeout("Go", Duration::from_secs(10)).await {
                Ok(payload) => Ok::<_, String>(format!("event:{payload}")),
                Err(e) => Ok(format!("timeout:{}", e.message())),
            }
        };
        let mut history = vec![started("")];
        let first = run_turn(&history, TurnOptions::new("p"), wait);
        let opened: Vec<u64> = first.opening_events().into_iter().map(|k| push(&mut history, 0, k)).collect();
        let timer_created = EventKind::TimerCreated { fire_at_ms: 10_000 };
        prop_assert!(history.iter().any(|e| e.kind == timer_created));

        let raise = EventKind::EventRaised { name: "Go".into(), payload: "x".into() };
        let fired = EventKind::TimerFired { created: opened[1] };
        if raised_at < 10_000 {
            push(&mut history, raised_at, raise);
            push(&mut history, 10_000, fired);
        } else {
            push(&mut history, 10_000, fired);
            push(&mut history, raised_at, raise);
        }

        let out = run_turn(&history, TurnOptions::new("p"), wait);
        let again = run_turn(&history, TurnOptions::new("p"), wait);
        prop_assert_eq!(&out, &again);
        match out.result {
            TurnResult::Completed(s) if raised_at < 10_000 => prop_assert_eq!(s, "event:x"),
            TurnResult::Completed(s) => prop_assert!(s.starts_with("timeout:"), "{}", s),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn stored_history_replays_to_the_same_output() {
    let store = memory_store();
    let activities = ActivityRegistry::builder()
        .register_typed("Square", |_ctx, n: u64| async move { Ok(n * n) })
        .register_typed("Sum", |_ctx, xs: Vec<u64>| async move { Ok(xs.iter().sum::<u64>()) })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("SquareThenSum", square_then_sum)
        .build()
        .unwrap();
    let rt = start(store.clone(), activities, orchestrations).await;
    let client = rt.client();

    let id = client.start_orchestration("SquareThenSum", "").await.unwrap();
    let state = client.wait_for_orchestration(&id, WAIT).await.unwrap();
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("55"));

    // everything but the terminal event, as the last turn saw it
    let history = client.read_history(&id).await.unwrap().events;
    let before_close = &history[..history.len() - 1];
    let replay = run_turn(before_close, TurnOptions::new(id.as_str()), square_then_sum);
    assert!(replay.actions.is_empty());
    assert_eq!(replay.result, TurnResult::Completed("55".into()));
    rt.shutdown().await;
}
