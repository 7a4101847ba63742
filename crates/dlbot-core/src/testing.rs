//! Fakes shared by unit tests.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    domain::{ChatId, JobId, MessageId, MessageRef, UserId},
    media::{MediaFile, MediaInfo, MediaSource, Platform, QualityOption},
    messaging::{InlineKeyboard, MessagingCapabilities, MessagingPort},
    security::Role,
    storage::{
        AbuseRecord, ActivityLog, BroadcastJob, DownloadRecord, JobStatus, NewBroadcastJob,
        RateWindow, Stats, Storage, UserRecord,
    },
    Error, Result,
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Sent {
    Text {
        chat_id: ChatId,
        text: String,
    },
    Html {
        chat_id: ChatId,
        html: String,
    },
    Edit {
        msg: MessageRef,
        html: String,
    },
    Keyboard {
        chat_id: ChatId,
        html: String,
        keyboard: InlineKeyboard,
    },
    EditKeyboard {
        msg: MessageRef,
        html: String,
        keyboard: InlineKeyboard,
    },
    Document {
        chat_id: ChatId,
        path: PathBuf,
        caption: Option<String>,
    },
    CallbackAnswer {
        callback_id: String,
        text: Option<String>,
    },
}

impl Sent {
    fn chat(&self) -> Option<ChatId> {
        match self {
            Sent::Text { chat_id, .. }
            | Sent::Html { chat_id, .. }
            | Sent::Keyboard { chat_id, .. }
            | Sent::Document { chat_id, .. } => Some(*chat_id),
            Sent::Edit { msg, .. } | Sent::EditKeyboard { msg, .. } => Some(msg.chat_id),
            Sent::CallbackAnswer { .. } => None,
        }
    }

    fn body(&self) -> Option<&str> {
        match self {
            Sent::Text { text, .. } => Some(text),
            Sent::Html { html, .. }
            | Sent::Edit { html, .. }
            | Sent::Keyboard { html, .. }
            | Sent::EditKeyboard { html, .. } => Some(html),
            Sent::Document { caption, .. } => caption.as_deref(),
            Sent::CallbackAnswer { text, .. } => text.as_deref(),
        }
    }
}

/// Records every outbound call. Sends to chats in `failing` return
/// `Error::Delivery`; sends to chats in `hanging` never complete.
#[derive(Default)]
pub(crate) struct RecordingMessenger {
    sent: Mutex<Vec<Sent>>,
    failing: HashSet<i64>,
    hanging: HashSet<i64>,
    next_id: AtomicI32,
}

impl RecordingMessenger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing(mut self, chats: impl IntoIterator<Item = i64>) -> Self {
        self.failing.extend(chats);
        self
    }

    pub(crate) fn hanging(mut self, chats: impl IntoIterator<Item = i64>) -> Self {
        self.hanging.extend(chats);
        self
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every text body that reached `chat`, in order.
    pub(crate) fn bodies_to(&self, chat: i64) -> Vec<String> {
        self.sent()
            .iter()
            .filter(|s| s.chat() == Some(ChatId(chat)))
            .filter_map(|s| s.body().map(str::to_string))
            .collect()
    }

    pub(crate) fn last_body_to(&self, chat: i64) -> Option<String> {
        self.bodies_to(chat).pop()
    }

    /// Plain-text sends only (broadcast deliveries), as `(chat, text)`.
    pub(crate) fn texts(&self) -> Vec<(i64, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { chat_id, text } => Some((chat_id.0, text)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn keyboards_to(&self, chat: i64) -> Vec<InlineKeyboard> {
        self.sent()
            .into_iter()
            .filter(|s| s.chat() == Some(ChatId(chat)))
            .filter_map(|s| match s {
                Sent::Keyboard { keyboard, .. } | Sent::EditKeyboard { keyboard, .. } => {
                    Some(keyboard)
                }
                _ => None,
            })
            .collect()
    }

    async fn deliver(&self, chat_id: ChatId, entry: Sent) -> Result<MessageRef> {
        if self.hanging.contains(&chat_id.0) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(&chat_id.0) {
            return Err(Error::Delivery(format!("chat {} unreachable", chat_id.0)));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(entry);
        }
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        })
    }
}

#[async_trait]
impl MessagingPort for RecordingMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_edit: true,
            supports_inline_keyboards: true,
            supports_documents: true,
            max_message_len: 4096,
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let entry = Sent::Text {
            chat_id,
            text: text.to_string(),
        };
        self.deliver(chat_id, entry).await
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let entry = Sent::Html {
            chat_id,
            html: html.to_string(),
        };
        self.deliver(chat_id, entry).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        let entry = Sent::Edit {
            msg,
            html: html.to_string(),
        };
        self.deliver(msg.chat_id, entry).await.map(|_| ())
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let entry = Sent::Keyboard {
            chat_id,
            html: html.to_string(),
            keyboard,
        };
        self.deliver(chat_id, entry).await
    }

    async fn edit_inline_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        let entry = Sent::EditKeyboard {
            msg,
            html: html.to_string(),
            keyboard,
        };
        self.deliver(msg.chat_id, entry).await.map(|_| ())
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let entry = Sent::Document {
            chat_id,
            path: path.to_path_buf(),
            caption: caption.map(str::to_string),
        };
        self.deliver(chat_id, entry).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Sent::CallbackAnswer {
                callback_id: callback_id.to_string(),
                text: text.map(str::to_string),
            });
        }
        Ok(())
    }
}

/// Media source that answers every inspection with the same info and "fetches"
/// without touching the network or the filesystem.
pub(crate) struct StaticMediaSource {
    info: MediaInfo,
    fail_inspect: bool,
    fail_fetch: bool,
    fetched: Mutex<Vec<(String, String)>>,
}

impl StaticMediaSource {
    pub(crate) fn new() -> Self {
        Self {
            info: MediaInfo {
                title: "Test clip".to_string(),
                platform: Platform::YouTube,
                duration: Some("1:05".to_string()),
                qualities: vec![
                    QualityOption {
                        label: "720p".to_string(),
                        format: "mp4".to_string(),
                        size: 10 * 1024 * 1024,
                    },
                    QualityOption {
                        label: "360p".to_string(),
                        format: "mp4".to_string(),
                        size: 3 * 1024 * 1024,
                    },
                ],
                direct_url: Some("https://cdn.example.org/clip.mp4".to_string()),
            },
            fail_inspect: false,
            fail_fetch: false,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_inspect(mut self) -> Self {
        self.fail_inspect = true;
        self
    }

    pub(crate) fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    /// `(url, quality)` of every fetch.
    pub(crate) fn fetched(&self) -> Vec<(String, String)> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn inspect(&self, _url: &str) -> Result<MediaInfo> {
        if self.fail_inspect {
            return Err(Error::External("inspection failed".to_string()));
        }
        Ok(self.info.clone())
    }

    async fn fetch(
        &self,
        url: &str,
        quality: &str,
        dest_dir: &Path,
        _max_bytes: u64,
    ) -> Result<MediaFile> {
        if let Ok(mut f) = self.fetched.lock() {
            f.push((url.to_string(), quality.to_string()));
        }
        if self.fail_fetch {
            return Err(Error::External("fetch failed".to_string()));
        }
        let file_name = "1_test_clip.mp4".to_string();
        Ok(MediaFile {
            path: dest_dir.join(&file_name),
            file_name,
            title: self.info.title.clone(),
            size: 1234,
        })
    }
}

// ============== Stores ==============

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, UserRecord>,
    rate_windows: BTreeMap<i64, RateWindow>,
    abuse: BTreeMap<i64, AbuseRecord>,
    jobs: BTreeMap<u64, BroadcastJob>,
    downloads: Vec<DownloadRecord>,
    next_download_id: u64,
    logs: Vec<ActivityLog>,
}

/// Map-backed `Storage` with the same ordering rules as `SqliteStore`.
/// Never blocks on I/O, which keeps paused-clock tests deterministic.
#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        f(&mut self.tables.lock().unwrap())
    }
}

fn newest_first(mut users: Vec<UserRecord>) -> Vec<UserRecord> {
    users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.user_id.cmp(&b.user_id)));
    users
}

fn user_mut(t: &mut Tables, user_id: UserId) -> Result<&mut UserRecord> {
    t.users
        .get_mut(&user_id.0)
        .ok_or_else(|| Error::NotFound(format!("user {user_id}")))
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.with(|t| t.users.get(&user_id.0).cloned()))
    }
    async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        self.with(|t| t.users.insert(user.user_id.0, user));
        Ok(())
    }
    async fn get_users(&self) -> Result<Vec<UserRecord>> {
        Ok(newest_first(self.with(|t| t.users.values().cloned().collect())))
    }
    async fn touch_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.with(|t| {
            if let Some(u) = t.users.get_mut(&user_id.0) {
                u.last_active = now;
            }
        });
        Ok(())
    }
    async fn set_role(&self, user_id: UserId, role: Role) -> Result<()> {
        self.with(|t| user_mut(t, user_id).map(|u| u.role = role))
    }
    async fn ban_user(&self, user_id: UserId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.with(|t| {
            let u = user_mut(t, user_id)?;
            u.is_banned = true;
            u.ban_reason = Some(reason.to_string());
            u.banned_at = Some(now);
            Ok(())
        })
    }
    async fn unban_user(&self, user_id: UserId) -> Result<()> {
        self.with(|t| {
            let u = user_mut(t, user_id)?;
            u.is_banned = false;
            u.ban_reason = None;
            u.banned_at = None;
            Ok(())
        })
    }
    async fn banned_users(&self) -> Result<Vec<UserRecord>> {
        Ok(newest_first(self.with(|t| {
            t.users.values().filter(|u| u.is_banned).cloned().collect()
        })))
    }
    async fn read_rate_window(&self, user_id: UserId) -> Result<Option<RateWindow>> {
        Ok(self.with(|t| t.rate_windows.get(&user_id.0).copied()))
    }
    async fn write_rate_window(&self, user_id: UserId, window: RateWindow) -> Result<()> {
        self.with(|t| t.rate_windows.insert(user_id.0, window));
        Ok(())
    }
    async fn read_abuse_record(&self, user_id: UserId) -> Result<Option<AbuseRecord>> {
        Ok(self.with(|t| t.abuse.get(&user_id.0).copied()))
    }
    async fn write_abuse_record(&self, user_id: UserId, record: AbuseRecord) -> Result<()> {
        self.with(|t| t.abuse.insert(user_id.0, record));
        Ok(())
    }
    async fn create_job(&self, job: NewBroadcastJob, now: DateTime<Utc>) -> Result<BroadcastJob> {
        Ok(self.with(|t| {
            let created = BroadcastJob {
                id: JobId(t.jobs.len() as u64 + 1),
                message: job.message,
                scheduled_at: job.scheduled_at,
                created_by: job.created_by,
                total_users: job.total_users,
                success_count: 0,
                failed_count: 0,
                status: JobStatus::Pending,
                sent_at: None,
                created_at: now,
            };
            t.jobs.insert(created.id.0, created.clone());
            created
        }))
    }
    async fn read_job(&self, job_id: JobId) -> Result<Option<BroadcastJob>> {
        Ok(self.with(|t| t.jobs.get(&job_id.0).cloned()))
    }
    async fn write_job(&self, job: &BroadcastJob) -> Result<()> {
        self.with(|t| match t.jobs.get_mut(&job.id.0) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("broadcast {}", job.id))),
        })
    }
    async fn list_pending_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<BroadcastJob>> {
        let mut due: Vec<BroadcastJob> = self.with(|t| {
            t.jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending)
                .filter(|j| j.scheduled_at.is_some_and(|at| at <= now))
                .cloned()
                .collect()
        });
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }
    async fn add_download(&self, mut record: DownloadRecord) -> Result<DownloadRecord> {
        Ok(self.with(|t| {
            t.next_download_id += 1;
            record.id = t.next_download_id;
            t.downloads.push(record.clone());
            record
        }))
    }
    async fn user_downloads(&self, user_id: UserId, limit: usize) -> Result<Vec<DownloadRecord>> {
        Ok(self.with(|t| {
            t.downloads
                .iter()
                .rev()
                .filter(|d| d.user_id == user_id)
                .take(limit)
                .cloned()
                .collect()
        }))
    }
    async fn clear_user_downloads(&self, user_id: UserId) -> Result<usize> {
        Ok(self.with(|t| {
            let before = t.downloads.len();
            t.downloads.retain(|d| d.user_id != user_id);
            before - t.downloads.len()
        }))
    }
    async fn add_log(&self, entry: ActivityLog) -> Result<()> {
        self.with(|t| t.logs.push(entry));
        Ok(())
    }
    async fn recent_logs(&self, limit: usize) -> Result<Vec<ActivityLog>> {
        Ok(self.with(|t| t.logs.iter().rev().take(limit).cloned().collect()))
    }
    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        let day_ago = now - TimeDelta::hours(24);
        Ok(self.with(|t| Stats {
            total_users: t.users.len() as u64,
            active_today: t.users.values().filter(|u| u.last_active > day_ago).count() as u64,
            total_downloads: t.downloads.len() as u64,
            downloads_today: t.downloads.iter().filter(|d| d.created_at > day_ago).count() as u64,
            banned_count: t.users.values().filter(|u| u.is_banned).count() as u64,
        }))
    }
}

/// `MemoryStore` with injectable failures: the next `get_users` calls, or
/// the next writes that finish a job.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    get_users_failures: AtomicUsize,
    finish_write_failures: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            get_users_failures: AtomicUsize::new(0),
            finish_write_failures: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_next_get_users(&self, times: usize) {
        self.get_users_failures.store(times, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_finish_writes(&self, times: usize) {
        self.finish_write_failures.store(times, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Storage for FlakyStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.inner.get_user(user_id).await
    }
    async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        self.inner.upsert_user(user).await
    }
    async fn get_users(&self) -> Result<Vec<UserRecord>> {
        if take_failure(&self.get_users_failures) {
            return Err(Error::Storage("users table unavailable".to_string()));
        }
        self.inner.get_users().await
    }
    async fn touch_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<()> {
        self.inner.touch_user(user_id, now).await
    }
    async fn set_role(&self, user_id: UserId, role: Role) -> Result<()> {
        self.inner.set_role(user_id, role).await
    }
    async fn ban_user(&self, user_id: UserId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.inner.ban_user(user_id, reason, now).await
    }
    async fn unban_user(&self, user_id: UserId) -> Result<()> {
        self.inner.unban_user(user_id).await
    }
    async fn banned_users(&self) -> Result<Vec<UserRecord>> {
        self.inner.banned_users().await
    }
    async fn read_rate_window(&self, user_id: UserId) -> Result<Option<RateWindow>> {
        self.inner.read_rate_window(user_id).await
    }
    async fn write_rate_window(&self, user_id: UserId, window: RateWindow) -> Result<()> {
        self.inner.write_rate_window(user_id, window).await
    }
    async fn read_abuse_record(&self, user_id: UserId) -> Result<Option<AbuseRecord>> {
        self.inner.read_abuse_record(user_id).await
    }
    async fn write_abuse_record(&self, user_id: UserId, record: AbuseRecord) -> Result<()> {
        self.inner.write_abuse_record(user_id, record).await
    }
    async fn create_job(&self, job: NewBroadcastJob, now: DateTime<Utc>) -> Result<BroadcastJob> {
        self.inner.create_job(job, now).await
    }
    async fn read_job(&self, job_id: JobId) -> Result<Option<BroadcastJob>> {
        self.inner.read_job(job_id).await
    }
    async fn write_job(&self, job: &BroadcastJob) -> Result<()> {
        if job.status != JobStatus::Pending && take_failure(&self.finish_write_failures) {
            return Err(Error::Storage("broadcasts table locked".to_string()));
        }
        self.inner.write_job(job).await
    }
    async fn list_pending_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<BroadcastJob>> {
        self.inner.list_pending_due_jobs(now).await
    }
    async fn add_download(&self, record: DownloadRecord) -> Result<DownloadRecord> {
        self.inner.add_download(record).await
    }
    async fn user_downloads(&self, user_id: UserId, limit: usize) -> Result<Vec<DownloadRecord>> {
        self.inner.user_downloads(user_id, limit).await
    }
    async fn clear_user_downloads(&self, user_id: UserId) -> Result<usize> {
        self.inner.clear_user_downloads(user_id).await
    }
    async fn add_log(&self, entry: ActivityLog) -> Result<()> {
        self.inner.add_log(entry).await
    }
    async fn recent_logs(&self, limit: usize) -> Result<Vec<ActivityLog>> {
        self.inner.recent_logs(limit).await
    }
    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        self.inner.stats(now).await
    }
}

/// Register `ids` in order, one second apart, so `get_users` returns them
/// reversed.
pub(crate) async fn seed_users(storage: &dyn Storage, ids: &[i64]) {
    let t0 = Utc::now() - chrono::TimeDelta::hours(1);
    for (i, id) in ids.iter().enumerate() {
        let at = t0 + chrono::TimeDelta::seconds(i as i64);
        storage
            .upsert_user(UserRecord::new(UserId(*id), at))
            .await
            .unwrap();
    }
}
