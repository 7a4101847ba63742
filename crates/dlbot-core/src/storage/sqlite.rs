//! SQLite-backed store.
//!
//! Every write goes through tokio-rusqlite's single background thread, so the
//! connection is the only writer. Each `Storage` method is one statement (or
//! one short transaction) against its own table.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::{
    domain::{JobId, UserId},
    errors::Error,
    security::Role,
    storage::{
        AbuseRecord, ActivityLog, BroadcastJob, DownloadRecord, JobStatus, NewBroadcastJob,
        RateWindow, Stats, Storage, UserRecord,
    },
    Result,
};

const MAX_LOG_ENTRIES: i64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id     INTEGER PRIMARY KEY,
    username    TEXT,
    first_name  TEXT,
    last_name   TEXT,
    language    TEXT NOT NULL DEFAULT 'en',
    role        TEXT NOT NULL DEFAULT 'user',
    is_banned   INTEGER NOT NULL DEFAULT 0,
    ban_reason  TEXT,
    banned_at   TEXT,
    created_at  TEXT NOT NULL,
    last_active TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_created ON users (created_at DESC, user_id);

CREATE TABLE IF NOT EXISTS rate_windows (
    user_id      INTEGER PRIMARY KEY,
    count        INTEGER NOT NULL,
    window_start TEXT NOT NULL,
    last_request TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS abuse_records (
    user_id      INTEGER PRIMARY KEY,
    strike_count INTEGER NOT NULL,
    last_strike  TEXT NOT NULL,
    banned_until TEXT
);

CREATE TABLE IF NOT EXISTS broadcasts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    message       TEXT NOT NULL,
    scheduled_at  TEXT,
    created_by    INTEGER NOT NULL,
    total_users   INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count  INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'pending',
    sent_at       TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_broadcasts_due ON broadcasts (status, scheduled_at);

CREATE TABLE IF NOT EXISTS downloads (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    url           TEXT NOT NULL,
    title         TEXT NOT NULL,
    platform      TEXT NOT NULL,
    quality       TEXT NOT NULL,
    format        TEXT NOT NULL,
    file_size     INTEGER NOT NULL DEFAULT 0,
    download_type TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_downloads_user ON downloads (user_id, id DESC);
CREATE INDEX IF NOT EXISTS idx_downloads_created ON downloads (created_at);

CREATE TABLE IF NOT EXISTS activity_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL,
    action     TEXT NOT NULL,
    details    TEXT,
    created_at TEXT NOT NULL
);
";

const USER_COLUMNS: &str = "user_id, username, first_name, last_name, language, role, \
     is_banned, ban_reason, banned_at, created_at, last_active";

const JOB_COLUMNS: &str = "id, message, scheduled_at, created_by, total_users, \
     success_count, failed_count, status, sent_at, created_at";

const DOWNLOAD_COLUMNS: &str = "id, user_id, url, title, platform, quality, format, \
     file_size, download_type, status, created_at";

fn storage_err(e: tokio_rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn conversion_err(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {what} {value:?}").into(),
    )
}

fn row_to_user(row: &Row) -> rusqlite::Result<UserRecord> {
    let role: String = row.get(5)?;
    Ok(UserRecord {
        user_id: UserId(row.get(0)?),
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        language: row.get(4)?,
        role: Role::parse(&role).ok_or_else(|| conversion_err(5, "role", &role))?,
        is_banned: row.get(6)?,
        ban_reason: row.get(7)?,
        banned_at: row.get(8)?,
        created_at: row.get(9)?,
        last_active: row.get(10)?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<BroadcastJob> {
    let status: String = row.get(7)?;
    Ok(BroadcastJob {
        id: JobId(row.get::<_, i64>(0)? as u64),
        message: row.get(1)?,
        scheduled_at: row.get(2)?,
        created_by: UserId(row.get(3)?),
        total_users: row.get::<_, i64>(4)? as u64,
        success_count: row.get::<_, i64>(5)? as u64,
        failed_count: row.get::<_, i64>(6)? as u64,
        status: JobStatus::parse(&status).ok_or_else(|| conversion_err(7, "status", &status))?,
        sent_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_download(row: &Row) -> rusqlite::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.get::<_, i64>(0)? as u64,
        user_id: UserId(row.get(1)?),
        url: row.get(2)?,
        title: row.get(3)?,
        platform: row.get(4)?,
        quality: row.get(5)?,
        format: row.get(6)?,
        file_size: row.get::<_, i64>(7)? as u64,
        download_type: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(path.clone())
            .await
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        })
        .await
        .map_err(storage_err)?;
        let store = Self {
            path: Some(path),
            conn,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Private database that disappears with the store.
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let store = Self { path: None, conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    /// Flush the WAL into the main file. Called on shutdown.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn users_where(&self, filter: &'static str) -> Result<Vec<UserRecord>> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {USER_COLUMNS} FROM users {filter} \
                     ORDER BY created_at DESC, user_id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let users = stmt
                    .query_map([], row_to_user)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(users)
            })
            .await
            .map_err(storage_err)
    }
}

fn user_changed(changed: usize, user_id: UserId) -> Result<()> {
    if changed == 0 {
        return Err(Error::NotFound(format!("user {user_id}")));
    }
    Ok(())
}

#[async_trait]
impl Storage for SqliteStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.conn
            .call(move |conn| {
                let user = conn
                    .query_row(
                        &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                        params![user_id.0],
                        row_to_user,
                    )
                    .optional()?;
                Ok(user)
            })
            .await
            .map_err(storage_err)
    }

    async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO users ({USER_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                         ON CONFLICT(user_id) DO UPDATE SET
                            username = excluded.username,
                            first_name = excluded.first_name,
                            last_name = excluded.last_name,
                            language = excluded.language,
                            role = excluded.role,
                            is_banned = excluded.is_banned,
                            ban_reason = excluded.ban_reason,
                            banned_at = excluded.banned_at,
                            created_at = excluded.created_at,
                            last_active = excluded.last_active"
                    ),
                    params![
                        user.user_id.0,
                        user.username,
                        user.first_name,
                        user.last_name,
                        user.language,
                        user.role.as_str(),
                        user.is_banned,
                        user.ban_reason,
                        user.banned_at,
                        user.created_at,
                        user.last_active,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn get_users(&self) -> Result<Vec<UserRecord>> {
        self.users_where("").await
    }

    async fn touch_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET last_active = ?2 WHERE user_id = ?1",
                    params![user_id.0, now],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn set_role(&self, user_id: UserId, role: Role) -> Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE users SET role = ?2 WHERE user_id = ?1",
                    params![user_id.0, role.as_str()],
                )?)
            })
            .await
            .map_err(storage_err)?;
        user_changed(changed, user_id)
    }

    async fn ban_user(&self, user_id: UserId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let reason = reason.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE users SET is_banned = 1, ban_reason = ?2, banned_at = ?3
                     WHERE user_id = ?1",
                    params![user_id.0, reason, now],
                )?)
            })
            .await
            .map_err(storage_err)?;
        user_changed(changed, user_id)
    }

    async fn unban_user(&self, user_id: UserId) -> Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE users SET is_banned = 0, ban_reason = NULL, banned_at = NULL
                     WHERE user_id = ?1",
                    params![user_id.0],
                )?)
            })
            .await
            .map_err(storage_err)?;
        user_changed(changed, user_id)
    }

    async fn banned_users(&self) -> Result<Vec<UserRecord>> {
        self.users_where("WHERE is_banned = 1").await
    }

    async fn read_rate_window(&self, user_id: UserId) -> Result<Option<RateWindow>> {
        self.conn
            .call(move |conn| {
                let window = conn
                    .query_row(
                        "SELECT count, window_start, last_request FROM rate_windows WHERE user_id = ?1",
                        params![user_id.0],
                        |row| {
                            Ok(RateWindow {
                                count: row.get(0)?,
                                window_start: row.get(1)?,
                                last_request: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(window)
            })
            .await
            .map_err(storage_err)
    }

    async fn write_rate_window(&self, user_id: UserId, window: RateWindow) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rate_windows (user_id, count, window_start, last_request)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        count = excluded.count,
                        window_start = excluded.window_start,
                        last_request = excluded.last_request",
                    params![user_id.0, window.count, window.window_start, window.last_request],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn read_abuse_record(&self, user_id: UserId) -> Result<Option<AbuseRecord>> {
        self.conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT strike_count, last_strike, banned_until FROM abuse_records WHERE user_id = ?1",
                        params![user_id.0],
                        |row| {
                            Ok(AbuseRecord {
                                strike_count: row.get(0)?,
                                last_strike: row.get(1)?,
                                banned_until: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(storage_err)
    }

    async fn write_abuse_record(&self, user_id: UserId, record: AbuseRecord) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO abuse_records (user_id, strike_count, last_strike, banned_until)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        strike_count = excluded.strike_count,
                        last_strike = excluded.last_strike,
                        banned_until = excluded.banned_until",
                    params![
                        user_id.0,
                        record.strike_count,
                        record.last_strike,
                        record.banned_until
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn create_job(&self, job: NewBroadcastJob, now: DateTime<Utc>) -> Result<BroadcastJob> {
        let message = job.message.clone();
        let scheduled_at = job.scheduled_at;
        let created_by = job.created_by;
        let total_users = job.total_users as i64;
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO broadcasts (message, scheduled_at, created_by, total_users, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                    params![message, scheduled_at, created_by.0, total_users, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(storage_err)?;

        Ok(BroadcastJob {
            id: JobId(id as u64),
            message: job.message,
            scheduled_at: job.scheduled_at,
            created_by: job.created_by,
            total_users: job.total_users,
            success_count: 0,
            failed_count: 0,
            status: JobStatus::Pending,
            sent_at: None,
            created_at: now,
        })
    }

    async fn read_job(&self, job_id: JobId) -> Result<Option<BroadcastJob>> {
        self.conn
            .call(move |conn| {
                let job = conn
                    .query_row(
                        &format!("SELECT {JOB_COLUMNS} FROM broadcasts WHERE id = ?1"),
                        params![job_id.0 as i64],
                        row_to_job,
                    )
                    .optional()?;
                Ok(job)
            })
            .await
            .map_err(storage_err)
    }

    async fn write_job(&self, job: &BroadcastJob) -> Result<()> {
        let job = job.clone();
        let job_id = job.id;
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE broadcasts SET
                        message = ?2, scheduled_at = ?3, total_users = ?4,
                        success_count = ?5, failed_count = ?6, status = ?7, sent_at = ?8
                     WHERE id = ?1",
                    params![
                        job.id.0 as i64,
                        job.message,
                        job.scheduled_at,
                        job.total_users as i64,
                        job.success_count as i64,
                        job.failed_count as i64,
                        job.status.as_str(),
                        job.sent_at,
                    ],
                )?)
            })
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("broadcast {job_id}")));
        }
        Ok(())
    }

    async fn list_pending_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<BroadcastJob>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM broadcasts
                     WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC, id ASC"
                ))?;
                let jobs = stmt
                    .query_map(params![now], row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(jobs)
            })
            .await
            .map_err(storage_err)
    }

    async fn add_download(&self, mut record: DownloadRecord) -> Result<DownloadRecord> {
        let row = record.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO downloads (user_id, url, title, platform, quality, format,
                        file_size, download_type, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.user_id.0,
                        row.url,
                        row.title,
                        row.platform,
                        row.quality,
                        row.format,
                        row.file_size as i64,
                        row.download_type,
                        row.status,
                        row.created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(storage_err)?;
        record.id = id as u64;
        Ok(record)
    }

    async fn user_downloads(&self, user_id: UserId, limit: usize) -> Result<Vec<DownloadRecord>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOWNLOAD_COLUMNS} FROM downloads
                     WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![user_id.0, limit as i64], row_to_download)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_err)
    }

    async fn clear_user_downloads(&self, user_id: UserId) -> Result<usize> {
        self.conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM downloads WHERE user_id = ?1", params![user_id.0])?)
            })
            .await
            .map_err(storage_err)
    }

    async fn add_log(&self, entry: ActivityLog) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO activity_logs (user_id, action, details, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entry.user_id.0, entry.action, entry.details, entry.created_at],
                )?;
                let newest = tx.last_insert_rowid();
                tx.execute(
                    "DELETE FROM activity_logs WHERE id <= ?1",
                    params![newest - MAX_LOG_ENTRIES],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ActivityLog>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, action, details, created_at FROM activity_logs
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let logs = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok(ActivityLog {
                            user_id: UserId(row.get(0)?),
                            action: row.get(1)?,
                            details: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(logs)
            })
            .await
            .map_err(storage_err)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        let day_ago = now - TimeDelta::hours(24);
        self.conn
            .call(move |conn| {
                let stats = conn.query_row(
                    "SELECT
                        (SELECT COUNT(*) FROM users),
                        (SELECT COUNT(*) FROM users WHERE last_active > ?1),
                        (SELECT COUNT(*) FROM downloads),
                        (SELECT COUNT(*) FROM downloads WHERE created_at > ?1),
                        (SELECT COUNT(*) FROM users WHERE is_banned = 1)",
                    params![day_ago],
                    |row| {
                        Ok(Stats {
                            total_users: row.get::<_, i64>(0)? as u64,
                            active_today: row.get::<_, i64>(1)? as u64,
                            total_downloads: row.get::<_, i64>(2)? as u64,
                            downloads_today: row.get::<_, i64>(3)? as u64,
                            banned_count: row.get::<_, i64>(4)? as u64,
                        })
                    },
                )?;
                Ok(stats)
            })
            .await
            .map_err(storage_err)
    }
}
