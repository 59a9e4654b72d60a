//! Cron-driven scheduler (§4.8): re-parses the configured schedule at
//! startup (already validated once by `Config::validate`) and sleeps until
//! each upcoming fire time, enqueueing a full build on every tick.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use docbuilder_config::Config;
use docbuilder_events::{BuildReason, BusEvent, EventBus};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{EnqueueRequest, JobQueue};

pub async fn run_scheduler(config: Arc<arc_swap::ArcSwap<Config>>, queue: JobQueue, bus: EventBus, cancel: CancellationToken) {
    loop {
        let schedule_str = config.load().sync.schedule.clone();
        let Some(schedule_str) = schedule_str else {
            info!("no schedule configured; scheduler idling until shutdown");
            cancel.cancelled().await;
            return;
        };

        let schedule = match Schedule::from_str(&schedule_str) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "scheduler: configured cron expression is invalid, idling");
                cancel.cancelled().await;
                return;
            }
        };

        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("scheduler: cron expression yields no upcoming fire time, idling");
            cancel.cancelled().await;
            return;
        };

        let sleep_for = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(sleep_for) => {}
        }

        bus.publish(BusEvent::BuildRequested {
            reason: BuildReason::Schedule,
            repo_url: None,
            branch: None,
            immediate: false,
        });

        if let Err(err) = queue
            .enqueue(EnqueueRequest {
                kind: docbuilder_types::JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "scheduled".to_string(),
                immediate: false,
            })
            .await
        {
            warn!(error = %err, "scheduler: failed to enqueue scheduled build");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idles_immediately_when_no_schedule_configured() {
        let config = Arc::new(arc_swap::ArcSwap::from_pointee(Config::default()));
        let (queue, _rx) = JobQueue::new(4);
        let bus = EventBus::new(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handle = tokio::spawn(run_scheduler(config, queue, bus, cancel));
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
