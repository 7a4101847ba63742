//! Broadcast engine: one message to every registered user.
//!
//! Runs are serialized by a single dispatch lock, paced by a leaky bucket and
//! bounded per send. A failed send to one recipient is counted and skipped;
//! only job-level errors (e.g. the recipient list cannot be read) fail a job.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    domain::{ChatId, JobId, MessageRef, UserId},
    messaging::{
        throttled::{wait_for_slot, IntervalLimiter},
        MessagingPort,
    },
    storage::{BroadcastJob, JobStatus, NewBroadcastJob, Storage},
    Error, Result,
};

const FINISH_WRITE_ATTEMPTS: u32 = 3;
const FINISH_WRITE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug)]
pub struct DispatchPolicy {
    /// Minimum spacing between two sends, across all runs.
    pub pace: Duration,
    /// `None` waits on a hung send forever.
    pub send_timeout: Option<Duration>,
    pub progress_every: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(50),
            send_timeout: Some(Duration::from_secs(10)),
            progress_every: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchProgress {
    pub job_id: JobId,
    pub processed: u64,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

/// Receives progress every `progress_every` recipients and after the last one.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: DispatchProgress);
}

/// Keeps one status message up to date. Edit failures are ignored.
pub struct StatusMessageProgress {
    messenger: Arc<dyn MessagingPort>,
    msg: MessageRef,
}

impl StatusMessageProgress {
    pub fn new(messenger: Arc<dyn MessagingPort>, msg: MessageRef) -> Self {
        Self { messenger, msg }
    }
}

#[async_trait]
impl ProgressSink for StatusMessageProgress {
    async fn report(&self, p: DispatchProgress) {
        let html = format!(
            "📢 Sending... {}/{}\n✅ Sent: {}\n❌ Failed: {}",
            p.processed, p.total, p.success, p.failed
        );
        if let Err(e) = self.messenger.edit_html(self.msg, &html).await {
            tracing::debug!(job_id = p.job_id.0, error = %e, "progress edit failed");
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed(BroadcastJob),
    Failed { job: BroadcastJob, reason: String },
    /// Already left `pending` (another run got there first).
    Skipped { job_id: JobId, status: JobStatus },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Completed(job) | JobOutcome::Failed { job, .. } => job.id,
            JobOutcome::Skipped { job_id, .. } => *job_id,
        }
    }
}

// ============== Dispatcher ==============

pub struct BroadcastDispatcher {
    storage: Arc<dyn Storage>,
    messenger: Arc<dyn MessagingPort>,
    policy: DispatchPolicy,
    pacer: Mutex<IntervalLimiter>,
    run_lock: Mutex<()>,
    unsaved: Mutex<HashMap<JobId, BroadcastJob>>,
}

impl BroadcastDispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        messenger: Arc<dyn MessagingPort>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            storage,
            messenger,
            policy,
            pacer: Mutex::new(IntervalLimiter::new(policy.pace)),
            run_lock: Mutex::new(()),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Deliver `job.message` to `recipients` in order and persist the result
    /// as `completed`. Waits for any other run to finish first.
    ///
    /// Delivery has already happened by the time the final write runs, so a
    /// failed write never turns the job into `failed`: the counts are
    /// returned regardless and the write is retried later.
    pub async fn dispatch(
        &self,
        job: BroadcastJob,
        recipients: &[UserId],
        progress: Option<&dyn ProgressSink>,
    ) -> BroadcastJob {
        let _guard = self.run_lock.lock().await;
        let done = self.deliver_all(job, recipients, progress).await;
        self.persist_finished(&done).await;
        done
    }

    /// Run a persisted job if it is still pending: fetch the current user
    /// list, dispatch, and persist `failed` if the list cannot be read.
    pub async fn run_job(
        &self,
        job_id: JobId,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<JobOutcome> {
        let _guard = self.run_lock.lock().await;

        let Some(job) = self.storage.read_job(job_id).await? else {
            return Err(Error::NotFound(format!("broadcast {job_id}")));
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = job_id.0, status = job.status.as_str(), "skip, not pending");
            return Ok(JobOutcome::Skipped {
                job_id,
                status: job.status,
            });
        }

        // Delivered earlier but the final write never landed.
        let unsaved = self.unsaved.lock().await.remove(&job_id);
        if let Some(done) = unsaved {
            tracing::info!(job_id = job_id.0, "retrying final write of delivered broadcast");
            self.persist_finished(&done).await;
            return Ok(JobOutcome::Skipped {
                job_id,
                status: done.status,
            });
        }

        let recipients = match self.recipients(job_id).await {
            Ok(r) => r,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(job_id = job_id.0, error = %reason, "broadcast aborted");
                let mut failed = job;
                failed.status = JobStatus::Failed;
                if let Err(e) = self.storage.write_job(&failed).await {
                    tracing::error!(job_id = job_id.0, error = %e, "could not persist failed status");
                }
                return Ok(JobOutcome::Failed {
                    job: failed,
                    reason,
                });
            }
        };

        let done = self.deliver_all(job, &recipients, progress).await;
        self.persist_finished(&done).await;
        Ok(JobOutcome::Completed(done))
    }

    async fn recipients(&self, job_id: JobId) -> Result<Vec<UserId>> {
        let users = self
            .storage
            .get_users()
            .await
            .map_err(|e| Error::DispatchAborted {
                job_id: job_id.0,
                reason: format!("recipient list: {e}"),
            })?;
        Ok(users.into_iter().map(|u| u.user_id).collect())
    }

    async fn deliver_all(
        &self,
        mut job: BroadcastJob,
        recipients: &[UserId],
        progress: Option<&dyn ProgressSink>,
    ) -> BroadcastJob {
        let total = recipients.len() as u64;
        let every = self.policy.progress_every.max(1) as u64;
        let mut success = 0u64;
        let mut failed = 0u64;

        tracing::info!(job_id = job.id.0, total, "broadcast started");

        for (i, user_id) in recipients.iter().enumerate() {
            wait_for_slot(&self.pacer).await;

            match self.send_one(ChatId::from(*user_id), &job.message).await {
                Ok(()) => success += 1,
                Err(e) => {
                    failed += 1;
                    tracing::debug!(job_id = job.id.0, user_id = user_id.0, error = %e, "delivery failed");
                }
            }

            let processed = i as u64 + 1;
            if processed % every == 0 || processed == total {
                if let Some(sink) = progress {
                    sink.report(DispatchProgress {
                        job_id: job.id,
                        processed,
                        total,
                        success,
                        failed,
                    })
                    .await;
                }
            }
        }

        job.total_users = total;
        job.success_count = success;
        job.failed_count = failed;
        job.status = JobStatus::Completed;
        job.sent_at = Some(Utc::now());

        tracing::info!(job_id = job.id.0, success, failed, "broadcast completed");
        job
    }

    /// Write the finished job, retrying a few times. If every attempt fails
    /// the job is remembered so the next `run_job` for it writes instead of
    /// delivering again.
    async fn persist_finished(&self, job: &BroadcastJob) {
        let mut attempt = 1;
        loop {
            match self.storage.write_job(job).await {
                Ok(()) => return,
                Err(e) if attempt < FINISH_WRITE_ATTEMPTS => {
                    tracing::warn!(job_id = job.id.0, attempt, error = %e, "final broadcast write failed, retrying");
                    tokio::time::sleep(FINISH_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = job.id.0,
                        success = job.success_count,
                        failed = job.failed_count,
                        error = %e,
                        "final broadcast write failed"
                    );
                    self.unsaved.lock().await.insert(job.id, job.clone());
                    return;
                }
            }
        }
    }

    async fn send_one(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let send = self.messenger.send_text(chat_id, text);
        match self.policy.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(res) => res.map(|_| ()),
                Err(_) => Err(Error::Delivery(format!("timed out after {limit:?}"))),
            },
            None => send.await.map(|_| ()),
        }
    }
}

// ============== Submission ==============

pub struct BroadcastService {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<BroadcastDispatcher>,
}

impl BroadcastService {
    pub fn new(storage: Arc<dyn Storage>, dispatcher: Arc<BroadcastDispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<BroadcastDispatcher> {
        &self.dispatcher
    }

    /// Persist a pending job and run it now.
    pub async fn submit_immediate(
        &self,
        created_by: UserId,
        message: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<JobOutcome> {
        let job = self.create_immediate(created_by, message).await?;
        self.dispatcher.run_job(job.id, progress).await
    }

    /// First half of `submit_immediate`, for callers that want the job
    /// (and its audience size) before the run starts.
    pub async fn create_immediate(&self, created_by: UserId, message: &str) -> Result<BroadcastJob> {
        self.create(created_by, message, None).await
    }

    /// Persist a pending job for the poller. Times in the past are due on
    /// the next tick.
    pub async fn submit_scheduled(
        &self,
        created_by: UserId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<BroadcastJob> {
        self.create(created_by, message, Some(at)).await
    }

    async fn create(
        &self,
        created_by: UserId,
        message: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<BroadcastJob> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::InvalidInput("broadcast message is empty".to_string()));
        }
        let total_users = self.storage.get_users().await?.len() as u64;
        let job = self
            .storage
            .create_job(
                NewBroadcastJob {
                    message: message.to_string(),
                    scheduled_at,
                    created_by,
                    total_users,
                },
                Utc::now(),
            )
            .await?;
        tracing::info!(
            job_id = job.id.0,
            created_by = created_by.0,
            scheduled = scheduled_at.is_some(),
            total_users,
            "broadcast submitted"
        );
        Ok(job)
    }
}

/// Split `message|when` on the last `|`. `when` is unix seconds or RFC 3339.
pub fn parse_scheduled(text: &str) -> Result<(String, DateTime<Utc>)> {
    let Some((message, when)) = text.rsplit_once('|') else {
        return Err(Error::InvalidInput(
            "expected `message|time` (unix seconds or RFC 3339)".to_string(),
        ));
    };

    let message = message.trim();
    if message.is_empty() {
        return Err(Error::InvalidInput("broadcast message is empty".to_string()));
    }

    let when = when.trim();
    let at = if let Ok(secs) = when.parse::<i64>() {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {secs}")))?
    } else {
        DateTime::parse_from_rfc3339(when)
            .map_err(|e| Error::InvalidInput(format!("bad time {when:?}: {e}")))?
            .with_timezone(&Utc)
    };

    Ok((message.to_string(), at))
}
