use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{JobId, UserId},
    security::Role,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub is_banned: bool,
    pub ban_reason: Option<String>,
    pub banned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            username: None,
            first_name: None,
            last_name: None,
            language: "en".to_string(),
            role: Role::User,
            is_banned: false,
            ban_reason: None,
            banned_at: None,
            created_at: now,
            last_active: now,
        }
    }

    /// `@username`, else first name, else the numeric id.
    pub fn display_name(&self) -> String {
        if let Some(u) = &self.username {
            return format!("@{u}");
        }
        if let Some(f) = &self.first_name {
            return f.clone();
        }
        self.user_id.to_string()
    }
}

/// Fixed-window counter for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
}

/// Burst/strike bookkeeping for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbuseRecord {
    pub strike_count: u32,
    pub last_strike: DateTime<Utc>,
    pub banned_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One "send to everyone" request.
///
/// `scheduled_at == None` means immediate: the poller never picks those up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub id: JobId,
    pub message: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub total_users: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub status: JobStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewBroadcastJob {
    pub message: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub total_users: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: u64,
    pub user_id: UserId,
    pub url: String,
    pub title: String,
    pub platform: String,
    pub quality: String,
    pub format: String,
    pub file_size: u64,
    pub download_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub user_id: UserId,
    pub action: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_users: u64,
    pub active_today: u64,
    pub total_downloads: u64,
    pub downloads_today: u64,
    pub banned_count: u64,
}
