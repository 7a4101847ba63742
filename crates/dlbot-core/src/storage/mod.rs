//! Persistence port.
//!
//! Every method is a point read or write. No transaction spans two calls, so
//! a crash between a read and the matching write can lose a counter update;
//! the admission counters tolerate that.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{JobId, UserId},
    security::Role,
    Result,
};

pub mod records;
pub mod sqlite;

pub use records::*;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Storage: Send + Sync {
    // Users
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    async fn upsert_user(&self, user: UserRecord) -> Result<()>;
    /// All users, newest registration first (ties broken by user id).
    async fn get_users(&self) -> Result<Vec<UserRecord>>;
    async fn touch_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()>;
    async fn set_role(&self, user_id: UserId, role: Role) -> Result<()>;
    async fn ban_user(&self, user_id: UserId, reason: &str, now: DateTime<Utc>) -> Result<()>;
    async fn unban_user(&self, user_id: UserId) -> Result<()>;
    async fn banned_users(&self) -> Result<Vec<UserRecord>>;

    // Admission counters
    async fn read_rate_window(&self, user_id: UserId) -> Result<Option<RateWindow>>;
    async fn write_rate_window(&self, user_id: UserId, window: RateWindow) -> Result<()>;
    async fn read_abuse_record(&self, user_id: UserId) -> Result<Option<AbuseRecord>>;
    async fn write_abuse_record(&self, user_id: UserId, record: AbuseRecord) -> Result<()>;

    // Broadcast jobs
    async fn create_job(&self, job: NewBroadcastJob, now: DateTime<Utc>) -> Result<BroadcastJob>;
    async fn read_job(&self, job_id: JobId) -> Result<Option<BroadcastJob>>;
    async fn write_job(&self, job: &BroadcastJob) -> Result<()>;
    /// Pending scheduled jobs with `scheduled_at <= now`, oldest due first.
    async fn list_pending_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<BroadcastJob>>;

    // Downloads
    async fn add_download(&self, record: DownloadRecord) -> Result<DownloadRecord>;
    async fn user_downloads(&self, user_id: UserId, limit: usize) -> Result<Vec<DownloadRecord>>;
    async fn clear_user_downloads(&self, user_id: UserId) -> Result<usize>;

    // Activity log
    async fn add_log(&self, entry: ActivityLog) -> Result<()>;
    async fn recent_logs(&self, limit: usize) -> Result<Vec<ActivityLog>>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats>;
}
