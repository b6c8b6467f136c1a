//! Video processing sample built from the patterns in this module.
//!
//! Four orchestrations share one set of simulated media activities:
//!
//! | orchestration              | input            | pattern                                  |
//! |----------------------------|------------------|------------------------------------------|
//! | `ProcessVideo`             | video location   | chaining with cleanup                    |
//! | `ProcessVideoFanOut`       | video location   | fan-out/fan-in, then chaining            |
//! | `ProcessVideoWithApproval` | video location   | fan-out pipeline plus human interaction  |
//! | `Periodic`                 | run count (JSON) | eternal with continue-as-new             |
//!
//! The media activities only sleep and rename; their durations scale with
//! [`VideoConfig::time_scale`] so tests can run them in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::approval::{request_interaction, Interaction};
use super::chaining::{compensate, run_chain, ChainFailure, ChainStep};
use super::eternal::run_generation;
use super::fan_out::{fan_out_fan_in, select_best};
use crate::_typed_codec::{Codec, Json};
use crate::runtime::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use crate::{durable_info, ErrorDetails, FanOutPolicy, OrchestrationContext, RetryPolicy};

pub const PROCESS_VIDEO: &str = "ProcessVideo";
pub const PROCESS_VIDEO_FAN_OUT: &str = "ProcessVideoFanOut";
pub const PROCESS_VIDEO_WITH_APPROVAL: &str = "ProcessVideoWithApproval";
pub const PERIODIC: &str = "Periodic";

pub const TRANSCODE_VIDEO: &str = "TranscodeVideo";
pub const GET_TRANSCODE_BIT_RATES: &str = "GetTranscodeBitRates";
pub const TRANSCODE_VIDEO_WITH_BIT_RATE: &str = "TranscodeVideoWithBitRate";
pub const EXTRACT_THUMBNAIL: &str = "ExtractThumbnail";
pub const PREPEND_INTRO: &str = "PrependIntro";
pub const CLEANUP: &str = "Cleanup";
pub const SEND_APPROVAL_REQUEST_EMAIL: &str = "SendApprovalRequestEmail";
pub const PUBLISH_VIDEO: &str = "PublishVideo";
pub const REJECT_VIDEO: &str = "RejectVideo";
pub const PERIODIC_ACTIVITY: &str = "PeriodicActivity";

/// Event raised by the reviewer of `ProcessVideoWithApproval`.
pub const APPROVAL_EVENT: &str = "ApprovalResult";
pub const APPROVED: &str = "Approved";
pub const TIMED_OUT: &str = "Timed out";

pub const PROCESSING_FAILED: &str = "Failed to process uploaded video";
pub const THUMBNAIL_FAILED: &str = "Failed to extract thumbnail";

/// Bit rates offered by `GetTranscodeBitRates`, in kbps.
pub const BIT_RATES: [u32; 4] = [1000, 2000, 3000, 4000];

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfig {
    pub thumbnail_retry: RetryPolicy,
    pub approval_timeout: Duration,
    pub periodic_interval: Duration,
    /// Multiplier for simulated work; `0.0` skips the sleeps entirely.
    pub time_scale: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            thumbnail_retry: RetryPolicy::new(Duration::from_secs(5), 4),
            approval_timeout: Duration::from_secs(300),
            periodic_interval: Duration::from_secs(10),
            time_scale: 1.0,
        }
    }
}

impl VideoConfig {
    /// Same shape as the default with every delay cut to milliseconds.
    pub fn fast() -> Self {
        Self {
            thumbnail_retry: RetryPolicy::new(Duration::from_millis(10), 4),
            approval_timeout: Duration::from_millis(500),
            periodic_interval: Duration::from_millis(50),
            time_scale: 0.001,
        }
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    fn work(&self, ms: u64) -> Duration {
        // f64 -> u64 casts saturate, NaN becomes 0
        Duration::from_micros((ms as f64 * self.time_scale * 1000.0).round() as u64)
    }

    async fn simulate(&self, ms: u64) {
        let d = self.work(ms);
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

/// A transcoded rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFileInfo {
    pub location: String,
    pub bit_rate: u32,
}

/// Output of the three `ProcessVideo*` orchestrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VideoOutcome {
    Processed {
        transcoded: String,
        thumbnail: String,
        with_intro: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval: Option<String>,
    },
    Failed {
        error: String,
        message: String,
        failed_step: String,
        cleanup: String,
    },
}

impl VideoOutcome {
    fn failed(failed_step: &str, error: &ErrorDetails, cleanup: Result<String, ErrorDetails>) -> Self {
        VideoOutcome::Failed {
            error: PROCESSING_FAILED.to_string(),
            message: error.message().to_string(),
            failed_step: failed_step.to_string(),
            cleanup: match cleanup {
                Ok(result) => result,
                Err(e) => format!("cleanup failed: {e}"),
            },
        }
    }

    fn from_chain(failure: ChainFailure) -> Self {
        Self::failed(&failure.failed_activity, &failure.error, failure.cleanup)
    }

    fn encode(&self) -> Result<String, String> {
        Json::encode(self)
    }
}

struct Processed {
    transcoded: String,
    thumbnail: String,
    with_intro: String,
}

fn thumbnail_and_intro(config: &VideoConfig, transcoded_slot: usize) -> Vec<ChainStep> {
    vec![
        ChainStep::new(EXTRACT_THUMBNAIL)
            .from_output(transcoded_slot)
            .with_retry(config.thumbnail_retry.clone()),
        ChainStep::new(PREPEND_INTRO).from_output(transcoded_slot),
    ]
}

fn processed(outputs: Vec<String>) -> Result<Processed, String> {
    match <[String; 3]>::try_from(outputs) {
        Ok([transcoded, thumbnail, with_intro]) => Ok(Processed {
            transcoded,
            thumbnail,
            with_intro,
        }),
        Err(outputs) => Err(format!("expected 3 chain outputs, got {}", outputs.len())),
    }
}

/// Transcode, extract a thumbnail and prepend the intro, cleaning up on failure.
pub async fn process_video(ctx: OrchestrationContext, video: String, config: VideoConfig) -> Result<String, String> {
    let mut steps = vec![ChainStep::new(TRANSCODE_VIDEO)];
    steps.extend(thumbnail_and_intro(&config, 0));
    let outcome = match run_chain(&ctx, &video, Vec::new(), &steps, CLEANUP).await {
        Ok(outputs) => {
            let p = processed(outputs)?;
            VideoOutcome::Processed {
                transcoded: p.transcoded,
                thumbnail: p.thumbnail,
                with_intro: p.with_intro,
                approval: None,
            }
        }
        Err(failure) => VideoOutcome::from_chain(failure),
    };
    outcome.encode()
}

async fn fan_out_pipeline(
    ctx: &OrchestrationContext,
    video: &str,
    config: &VideoConfig,
) -> Result<Result<Processed, VideoOutcome>, String> {
    let empty = [None, None, None];

    let bit_rates: Vec<u32> = match ctx.call_activity_typed(GET_TRANSCODE_BIT_RATES, &()).await {
        Ok(rates) => rates,
        Err(e) => {
            let cleanup = compensate(ctx, CLEANUP, &empty).await;
            return Ok(Err(VideoOutcome::failed(GET_TRANSCODE_BIT_RATES, &e, cleanup)));
        }
    };
    let renditions: Vec<VideoFileInfo> = bit_rates
        .into_iter()
        .map(|bit_rate| VideoFileInfo {
            location: video.to_string(),
            bit_rate,
        })
        .collect();

    let transcoded: Vec<VideoFileInfo> =
        match fan_out_fan_in(ctx, TRANSCODE_VIDEO_WITH_BIT_RATE, &renditions, FanOutPolicy::FailFast).await {
            Ok(t) => t,
            Err(failure) => {
                let error = failure
                    .first_error()
                    .cloned()
                    .unwrap_or_else(|| ErrorDetails::logic("fan-out failed without an error"));
                let cleanup = compensate(ctx, CLEANUP, &empty).await;
                return Ok(Err(VideoOutcome::failed(TRANSCODE_VIDEO_WITH_BIT_RATE, &error, cleanup)));
            }
        };

    let Some(best) = select_best(&transcoded, |t| (t.bit_rate, t.location.clone())) else {
        let error = ErrorDetails::Application {
            message: "no bit rates to transcode".to_string(),
        };
        let cleanup = compensate(ctx, CLEANUP, &empty).await;
        return Ok(Err(VideoOutcome::failed(GET_TRANSCODE_BIT_RATES, &error, cleanup)));
    };
    durable_info!(ctx, location = %best.location, bit_rate = best.bit_rate, "picked highest bit rate");

    let steps = thumbnail_and_intro(config, 0);
    match run_chain(ctx, video, vec![best.location.clone()], &steps, CLEANUP).await {
        Ok(outputs) => Ok(Ok(processed(outputs)?)),
        Err(failure) => Ok(Err(VideoOutcome::from_chain(failure))),
    }
}

/// Transcode at every offered bit rate in parallel, keep the highest, then
/// finish like [`process_video`].
pub async fn process_video_fan_out(
    ctx: OrchestrationContext,
    video: String,
    config: VideoConfig,
) -> Result<String, String> {
    let outcome = match fan_out_pipeline(&ctx, &video, &config).await? {
        Ok(p) => VideoOutcome::Processed {
            transcoded: p.transcoded,
            thumbnail: p.thumbnail,
            with_intro: p.with_intro,
            approval: None,
        },
        Err(failed) => failed,
    };
    outcome.encode()
}

/// Reviewer answers may arrive as a bare string or a JSON string.
fn approval_answer(payload: String) -> String {
    Json::decode::<String>(&payload).unwrap_or(payload)
}

/// The fan-out pipeline, then ask for approval and publish or reject.
pub async fn process_video_with_approval(
    ctx: OrchestrationContext,
    video: String,
    config: VideoConfig,
) -> Result<String, String> {
    let p = match fan_out_pipeline(&ctx, &video, &config).await? {
        Ok(p) => p,
        Err(failed) => return failed.encode(),
    };
    let slots = [
        Some(p.transcoded.clone()),
        Some(p.thumbnail.clone()),
        Some(p.with_intro.clone()),
    ];

    let approval = match request_interaction(
        &ctx,
        SEND_APPROVAL_REQUEST_EMAIL,
        p.with_intro.clone(),
        APPROVAL_EVENT,
        config.approval_timeout,
    )
    .await
    {
        Ok(Interaction::Responded(payload)) => approval_answer(payload),
        Ok(Interaction::TimedOut) => TIMED_OUT.to_string(),
        Err(e) => {
            let cleanup = compensate(&ctx, CLEANUP, &slots).await;
            return VideoOutcome::failed(SEND_APPROVAL_REQUEST_EMAIL, &e, cleanup).encode();
        }
    };

    let decision = if approval == APPROVED { PUBLISH_VIDEO } else { REJECT_VIDEO };
    durable_info!(ctx, approval = %approval, decision, "review finished");
    if let Err(e) = ctx.call_activity(decision, p.with_intro.clone()).await {
        let cleanup = compensate(&ctx, CLEANUP, &slots).await;
        return VideoOutcome::failed(decision, &e, cleanup).encode();
    }

    VideoOutcome::Processed {
        transcoded: p.transcoded,
        thumbnail: p.thumbnail,
        with_intro: p.with_intro,
        approval: Some(approval),
    }
    .encode()
}

/// Count runs forever, one generation per interval.
pub async fn periodic(ctx: OrchestrationContext, input: String, config: VideoConfig) -> Result<String, String> {
    let times_run: u64 = if input.trim().is_empty() { 0 } else { Json::decode(&input)? };
    let step_ctx = ctx.clone();
    let next = run_generation(&ctx, times_run, config.periodic_interval, move |n| async move {
        let run = n + 1;
        step_ctx.call_activity_typed::<u64, ()>(PERIODIC_ACTIVITY, &run).await?;
        Ok::<_, ErrorDetails>(run)
    })
    .await
    .map_err(|e| e.to_string())?;
    Json::encode(&next)
}

/// Register the four sample orchestrations.
pub fn register_orchestrations(builder: OrchestrationRegistryBuilder, config: &VideoConfig) -> OrchestrationRegistryBuilder {
    let (c1, c2, c3, c4) = (config.clone(), config.clone(), config.clone(), config.clone());
    builder
        .register(PROCESS_VIDEO, move |ctx, input| process_video(ctx, input, c1.clone()))
        .register(PROCESS_VIDEO_FAN_OUT, move |ctx, input| {
            process_video_fan_out(ctx, input, c2.clone())
        })
        .register(PROCESS_VIDEO_WITH_APPROVAL, move |ctx, input| {
            process_video_with_approval(ctx, input, c3.clone())
        })
        .register(PERIODIC, move |ctx, input| periodic(ctx, input, c4.clone()))
}

/// Register the simulated media activities.
pub fn register_activities(builder: ActivityRegistryBuilder, config: &VideoConfig) -> ActivityRegistryBuilder {
    let c = config.clone();
    let transcode = move |ctx: crate::ActivityContext, video: String| {
        let c = c.clone();
        async move {
            info!(target: "duraflow::activity", instance_id = %ctx.instance_id(), video = %video, "transcoding");
            c.simulate(5_000).await;
            Ok(format!("{video}-transcoded.mp4"))
        }
    };

    let c = config.clone();
    let transcode_with_bit_rate = move |_ctx: crate::ActivityContext, info: VideoFileInfo| {
        let c = c.clone();
        async move {
            c.simulate(info.bit_rate as u64 + 1_000).await;
            Ok(VideoFileInfo {
                location: format!("{}-{}kbps.mp4", info.location, info.bit_rate),
                bit_rate: info.bit_rate,
            })
        }
    };

    let c = config.clone();
    let thumbnail = move |ctx: crate::ActivityContext, video: String| {
        let c = c.clone();
        async move {
            if video.contains("error") {
                warn!(target: "duraflow::activity", instance_id = %ctx.instance_id(), attempt = ctx.attempt(), "thumbnail extraction failed");
                return Err(THUMBNAIL_FAILED.to_string());
            }
            c.simulate(5_000).await;
            Ok(format!("{video}-thumbnail.mp4"))
        }
    };

    let c = config.clone();
    let intro = move |_ctx: crate::ActivityContext, video: String| {
        let c = c.clone();
        async move {
            c.simulate(5_000).await;
            Ok(format!("{video}-withintro.mp4"))
        }
    };

    let c = config.clone();
    let cleanup = move |ctx: crate::ActivityContext, files: String| {
        let c = c.clone();
        async move {
            let files: Vec<String> = Json::decode(&files)?;
            for file in files.iter().filter(|f| !f.is_empty()) {
                info!(target: "duraflow::activity", instance_id = %ctx.instance_id(), file = %file, "deleting");
                c.simulate(1_000).await;
            }
            Ok("Cleaned up successfully".to_string())
        }
    };

    let c = config.clone();
    let notify = move |name: &'static str| {
        let c = c.clone();
        move |ctx: crate::ActivityContext, video: String| {
            let c = c.clone();
            async move {
                info!(target: "duraflow::activity", instance_id = %ctx.instance_id(), video = %video, "{name}");
                c.simulate(1_000).await;
                Ok(String::new())
            }
        }
    };

    builder
        .register(TRANSCODE_VIDEO, transcode)
        .register_typed(GET_TRANSCODE_BIT_RATES, |_ctx, _: ()| async move { Ok(BIT_RATES.to_vec()) })
        .register_typed(TRANSCODE_VIDEO_WITH_BIT_RATE, transcode_with_bit_rate)
        .register(EXTRACT_THUMBNAIL, thumbnail)
        .register(PREPEND_INTRO, intro)
        .register(CLEANUP, cleanup)
        .register(SEND_APPROVAL_REQUEST_EMAIL, notify("sending approval request"))
        .register(PUBLISH_VIDEO, notify("publishing"))
        .register(REJECT_VIDEO, notify("rejecting"))
        .register_typed(PERIODIC_ACTIVITY, |ctx: crate::ActivityContext, run: u64| async move {
            warn!(target: "duraflow::activity", instance_id = %ctx.instance_id(), run, "periodic activity");
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{run_turn, TurnOptions, TurnResult};
    use crate::{Action, Event, EventKind};

    #[test]
    fn outcome_json_is_tagged() {
        let processed = VideoOutcome::Processed {
            transcoded: "a".into(),
            thumbnail: "b".into(),
            with_intro: "c".into(),
            approval: None,
        };
        let json = processed.encode().unwrap();
        assert_eq!(
            json,
            r#"{"outcome":"processed","transcoded":"a","thumbnail":"b","with_intro":"c"}"#
        );
        let back: VideoOutcome = Json::decode(&json).unwrap();
        assert_eq!(back, processed);
    }

    #[test]
    fn approval_answers_accept_bare_and_json_strings() {
        assert_eq!(approval_answer("Approved".into()), "Approved");
        assert_eq!(approval_answer(r#""Approved""#.into()), "Approved");
        assert_eq!(approval_answer("Rejected".into()), "Rejected");
    }

    #[test]
    fn work_scales_with_time_scale() {
        let mut config = VideoConfig::fast();
        assert_eq!(config.work(5_000), Duration::from_millis(5));
        config.time_scale = 0.0;
        assert!(config.work(5_000).is_zero());
    }

    #[tokio::test]
    async fn thumbnail_is_an_mp4_next_to_the_video() {
        let activities = register_activities(crate::runtime::ActivityRegistry::builder(), &VideoConfig::fast())
            .build()
            .unwrap();
        let thumbnail = activities.resolve(EXTRACT_THUMBNAIL).unwrap();
        let ctx = crate::ActivityContext::new("i", EXTRACT_THUMBNAIL, 1, 1);
        assert_eq!(
            thumbnail.invoke(ctx.clone(), "clip.mp4".into()).await,
            Ok("clip.mp4-thumbnail.mp4".to_string())
        );
        assert_eq!(
            thumbnail.invoke(ctx, "error.mp4".into()).await,
            Err(THUMBNAIL_FAILED.to_string())
        );
    }

    #[test]
    fn fan_out_schedules_one_transcode_per_rate() {
        let config = VideoConfig::fast();
        let run = |ctx: OrchestrationContext, input: String| process_video_fan_out(ctx, input, config.clone());
        let mut h = vec![Event::new(
            1,
            0,
            EventKind::OrchestrationStarted {
                name: PROCESS_VIDEO_FAN_OUT.into(),
                input: "clip".into(),
                generation: 1,
            },
        )];
        let out = run_turn(&h, TurnOptions::new("i"), run);
        h.push(Event::new(2, 0, out.opening_events().remove(0)));
        h.push(Event::new(
            3,
            0,
            EventKind::ActivityCompleted {
                scheduled: 2,
                output: "[1000,2000]".into(),
            },
        ));
        let out = run_turn(&h, TurnOptions::new("i"), run);
        assert_eq!(
            out.actions,
            vec![
                Action::CallActivity {
                    name: TRANSCODE_VIDEO_WITH_BIT_RATE.into(),
                    input: r#"{"location":"clip","bit_rate":1000}"#.into(),
                    retry: None
                },
                Action::CallActivity {
                    name: TRANSCODE_VIDEO_WITH_BIT_RATE.into(),
                    input: r#"{"location":"clip","bit_rate":2000}"#.into(),
                    retry: None
                },
            ]
        );
        assert_eq!(out.result, TurnResult::Continue);
    }
}
