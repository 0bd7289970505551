//! Daily trigger loop.
//!
//! One ingestion run fires at startup (configurable), then one per day at a
//! fixed local wall-clock time. At most one run is ever in flight: if the
//! daily trigger lands while the previous run is still going, the trigger is
//! skipped with a warning. Runs are spawned so the timer re-arms on schedule
//! regardless of how long a run takes. Ctrl-c stops arming new triggers and
//! waits for an in-flight run to finish.

use crate::pipeline::Pipeline;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Next occurrence of the daily trigger time strictly after `now`.
pub fn next_trigger(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if now < today {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    trigger_at: NaiveTime,
    run_on_start: bool,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, trigger_at: NaiveTime, run_on_start: bool) -> Self {
        Self {
            pipeline,
            trigger_at,
            run_on_start,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut current: Option<JoinHandle<()>> = None;

        if self.run_on_start {
            info!("Startup ingestion run");
            dispatch(&self.pipeline, &mut current);
        }

        loop {
            let now = Local::now().naive_local();
            let next = next_trigger(now, self.trigger_at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!("Next ingestion trigger at {} (in {:.0?})", next, wait);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    dispatch(&self.pipeline, &mut current);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested; no further runs will be scheduled");
                    break;
                }
            }
        }

        if let Some(handle) = current.take() {
            if !handle.is_finished() {
                info!("Waiting for in-flight ingestion run to finish…");
            }
            handle.await.ok();
        }
        Ok(())
    }
}

/// Spawn one run unless the previous one is still in flight. A failed run is
/// logged and never unwinds the scheduling loop.
fn dispatch(pipeline: &Arc<Pipeline>, current: &mut Option<JoinHandle<()>>) {
    if current.as_ref().is_some_and(|h| !h.is_finished()) {
        warn!("Previous ingestion run still in progress — skipping this trigger");
        return;
    }

    let pipeline = Arc::clone(pipeline);
    *current = Some(tokio::spawn(async move {
        match pipeline.run().await {
            Ok(summary) => info!(
                "Scheduled run done: {} attempted | {} succeeded | {} failed",
                summary.attempted, summary.succeeded, summary.failed
            ),
            Err(e) => error!("Scheduled run failed: {:#}", e),
        }
    }));
}
