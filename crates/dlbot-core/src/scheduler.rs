//! Scheduled broadcasts.
//!
//! - Polls storage on a fixed tick for pending jobs whose time has come
//! - Hands each one to the shared `BroadcastDispatcher` with a fresh user list
//! - Tells the creator how it went (best effort)
//!
//! Overlapping ticks are harmless: the dispatcher re-checks `pending` under its
//! lock, so a job is delivered at most once.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::{BroadcastDispatcher, JobOutcome},
    domain::{ChatId, JobId},
    formatting::escape_html,
    messaging::MessagingPort,
    storage::{BroadcastJob, Storage},
    Result,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub completed: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub skipped: Vec<JobId>,
    /// Jobs the dispatcher could not even look at (storage errors).
    pub errored: Vec<JobId>,
}

#[derive(Clone)]
pub struct SchedulePoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<BroadcastDispatcher>,
    messenger: Arc<dyn MessagingPort>,
    tick: Duration,
    state: tokio::sync::Mutex<PollerState>,
}

#[derive(Default)]
struct PollerState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulePoller {
    pub fn new(
        storage: Arc<dyn Storage>,
        dispatcher: Arc<BroadcastDispatcher>,
        messenger: Arc<dyn MessagingPort>,
        tick: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                storage,
                dispatcher,
                messenger,
                tick,
                state: tokio::sync::Mutex::new(PollerState::default()),
            }),
        }
    }

    /// Spawn the tick loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.handle.is_some() {
            return false;
        }

        let tok = CancellationToken::new();
        st.cancel = Some(tok.clone());
        let poller = self.clone();
        let every = self.inner.tick;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    match poller.run_tick(Utc::now()).await {
                      Ok(r) if r.due > 0 => tracing::info!(
                        due = r.due,
                        completed = r.completed.len(),
                        failed = r.failed.len(),
                        skipped = r.skipped.len(),
                        "schedule tick"
                      ),
                      Ok(_) => {}
                      Err(e) => tracing::warn!(error = %e, "schedule tick failed"),
                    }
                  }
                }
            }
        });

        st.handle = Some(handle);
        tracing::info!(tick_secs = every.as_secs(), "schedule poller started");
        true
    }

    /// Stop ticking. A dispatch already in progress runs to completion.
    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        if let Some(tok) = st.cancel.take() {
            tok.cancel();
        }
        if st.handle.take().is_some() {
            tracing::info!("schedule poller stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.handle.is_some()
    }

    /// One poll: every due job is processed independently.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.inner.storage.list_pending_due_jobs(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for job in due {
            match self.inner.dispatcher.run_job(job.id, None).await {
                Ok(JobOutcome::Completed(done)) => {
                    report.completed.push(done.id);
                    self.notify_creator(&done, None).await;
                }
                Ok(JobOutcome::Failed { job, reason }) => {
                    report.failed.push(job.id);
                    self.notify_creator(&job, Some(&reason)).await;
                }
                Ok(JobOutcome::Skipped { job_id, .. }) => report.skipped.push(job_id),
                Err(e) => {
                    tracing::warn!(job_id = job.id.0, error = %e, "scheduled job not processed");
                    report.errored.push(job.id);
                }
            }
        }

        Ok(report)
    }

    async fn notify_creator(&self, job: &BroadcastJob, failure: Option<&str>) {
        let html = match failure {
            None => format!(
                "✅ Scheduled broadcast {} sent\n✅ Sent: {}\n❌ Failed: {}",
                job.id, job.success_count, job.failed_count
            ),
            Some(reason) => format!(
                "❌ Scheduled broadcast {} failed: {}",
                job.id,
                escape_html(reason)
            ),
        };
        let chat = ChatId::from(job.created_by);
        if let Err(e) = self.inner.messenger.send_html(chat, &html).await {
            tracing::debug!(job_id = job.id.0, error = %e, "creator summary not delivered");
        }
    }
}
