use chrono::Utc;

use crate::{
    domain::MessageRef,
    formatting::{escape_html, format_file_size, format_timestamp, truncate_text},
    messaging::CallbackQuery,
    security::{Permission, Role},
    session::{DownloadSession, SessionTag, UserSession},
    storage::DownloadRecord,
    Error, Result,
};

use super::{keyboards, Actor, Interaction};

const LIST_LIMIT: usize = 20;
const EXPIRED: &str = "⌛ This download has expired. Send the link again.";

/// Toast text for the callback answer; `None` just stops the spinner.
type Toast = Option<&'static str>;

impl Interaction {
    /// Every callback gets answered, even when handling fails.
    pub(super) async fn on_callback(&self, actor: &Actor, q: CallbackQuery) -> Result<()> {
        let result = self.route_callback(actor, &q).await;

        let toast = match &result {
            Ok(toast) => *toast,
            Err(_) => Some("❌ Something went wrong"),
        };
        if let Err(e) = self
            .messenger
            .answer_callback_query(&q.callback_id, toast)
            .await
        {
            tracing::debug!(callback_id = %q.callback_id, error = %e, "callback answer failed");
        }

        result.map(|_| ())
    }

    async fn route_callback(&self, actor: &Actor, q: &CallbackQuery) -> Result<Toast> {
        let msg = q.message;
        let (kind, arg) = q.data.split_once(':').unwrap_or((q.data.as_str(), ""));
        tracing::debug!(user_id = actor.id().0, data = %q.data, "callback");

        match kind {
            "quality" if !arg.is_empty() => self.pick_quality(actor, msg, arg).await,
            "format" => match arg {
                "file" => self.deliver_file(actor, msg).await,
                "link" => self.deliver_link(actor, msg).await,
                _ => Ok(Some("Unknown action")),
            },
            "admin" => self.admin_action(actor, msg, arg).await,
            "broadcast" => {
                let (tag, question) = match arg {
                    "now" => (
                        SessionTag::AwaitingBroadcast,
                        "📢 Send the message to broadcast to every user:",
                    ),
                    "schedule" => (
                        SessionTag::AwaitingScheduledBroadcast,
                        "🗓 Send <code>message|time</code> (unix seconds or RFC 3339):",
                    ),
                    _ => return Ok(Some("Unknown action")),
                };
                self.prompt(actor, Permission::Broadcast, tag, question)
                    .await?;
                Ok(None)
            }
            "role" => self.pick_role(actor, arg).await,
            "history" if arg == "clear" => {
                let removed = self.storage.clear_user_downloads(actor.id()).await?;
                self.show(actor.chat_id, msg, "🗑 History cleared.").await?;
                self.log(
                    actor.id(),
                    "history_cleared",
                    Some(format!("Removed {removed} entries")),
                )
                .await;
                Ok(None)
            }
            "cancel" => {
                self.cancel(actor, msg).await?;
                Ok(None)
            }
            _ => Ok(Some("Unknown action")),
        }
    }

    // ============== Download ==============

    async fn pick_quality(
        &self,
        actor: &Actor,
        msg: Option<MessageRef>,
        quality: &str,
    ) -> Result<Toast> {
        let Some(session) = self.downloads.select_quality(actor.id(), quality).await else {
            self.show(actor.chat_id, msg, EXPIRED).await?;
            return Ok(None);
        };
        self.show_with(
            actor.chat_id,
            msg,
            &format!(
                "🎬 <b>{}</b>\nQuality: {}\n\nHow do you want it?",
                escape_html(&session.title),
                escape_html(quality)
            ),
            keyboards::delivery_format(),
        )
        .await?;
        Ok(None)
    }

    async fn deliver_file(&self, actor: &Actor, msg: Option<MessageRef>) -> Result<Toast> {
        let Some(session) = self.downloads.get(actor.id()).await else {
            self.show(actor.chat_id, msg, EXPIRED).await?;
            return Ok(None);
        };
        let quality = session.selected_quality.clone().unwrap_or_else(|| "best".to_string());

        self.show(actor.chat_id, msg, "⏬ Downloading...").await?;
        let file = match self
            .media
            .fetch(
                &session.url,
                &quality,
                &self.cfg.temp_dir,
                self.cfg.max_file_size,
            )
            .await
        {
            Ok(f) => f,
            Err(e) => return self.download_failed(actor, msg, &e).await,
        };

        let caption = format!("🎬 {}", truncate_text(&file.title, 200));
        let sent = self
            .messenger
            .send_document(actor.chat_id, &file.path, Some(&caption))
            .await;
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            tracing::debug!(path = %file.path.display(), error = %e, "temp file not removed");
        }
        if let Err(e) = sent {
            return self.download_failed(actor, msg, &e).await;
        }

        self.record_download(
            actor,
            &session,
            &quality,
            &file.extension(),
            file.size,
            "file",
        )
        .await?;
        self.show(
            actor.chat_id,
            msg,
            &format!("✅ Sent ({}).", format_file_size(file.size)),
        )
        .await?;
        Ok(None)
    }

    async fn deliver_link(&self, actor: &Actor, msg: Option<MessageRef>) -> Result<Toast> {
        let Some(session) = self.downloads.get(actor.id()).await else {
            self.show(actor.chat_id, msg, EXPIRED).await?;
            return Ok(None);
        };
        let Some(link) = session.direct_url.clone() else {
            let e = Error::NotFound("no direct link for this video".to_string());
            return self.download_failed(actor, msg, &e).await;
        };
        let quality = session.selected_quality.clone().unwrap_or_else(|| "best".to_string());

        self.show(
            actor.chat_id,
            msg,
            &format!(
                "🔗 <b>{}</b>\n<a href=\"{}\">Download link</a>",
                escape_html(&session.title),
                escape_html(&link)
            ),
        )
        .await?;
        self.record_download(actor, &session, &quality, "link", 0, "link")
            .await?;
        Ok(None)
    }

    async fn download_failed(
        &self,
        actor: &Actor,
        msg: Option<MessageRef>,
        e: &Error,
    ) -> Result<Toast> {
        tracing::warn!(user_id = actor.id().0, error = %e, "download failed");
        self.downloads.clear(actor.id()).await;
        self.show(
            actor.chat_id,
            msg,
            &format!("❌ Download failed: {}", escape_html(&e.to_string())),
        )
        .await?;
        Ok(None)
    }

    async fn record_download(
        &self,
        actor: &Actor,
        session: &DownloadSession,
        quality: &str,
        format: &str,
        size: u64,
        download_type: &str,
    ) -> Result<()> {
        self.downloads.clear(actor.id()).await;
        self.storage
            .add_download(DownloadRecord {
                id: 0,
                user_id: actor.id(),
                url: session.url.clone(),
                title: session.title.clone(),
                platform: session.platform.clone(),
                quality: quality.to_string(),
                format: format.to_string(),
                file_size: size,
                download_type: download_type.to_string(),
                status: "completed".to_string(),
                created_at: Utc::now(),
            })
            .await?;
        self.log(
            actor.id(),
            "download_completed",
            Some(format!("{} ({quality}, {download_type})", session.title)),
        )
        .await;
        Ok(())
    }

    // ============== Admin ==============

    async fn admin_action(
        &self,
        actor: &Actor,
        msg: Option<MessageRef>,
        action: &str,
    ) -> Result<Toast> {
        let needs = match action {
            "stats" => Permission::Stats,
            "broadcast" => Permission::Broadcast,
            "users" => Permission::ManageUsers,
            "banned" | "ban" => Permission::Ban,
            "unban" => Permission::Unban,
            "logs" => Permission::ViewLogs,
            _ => return Ok(Some("Unknown action")),
        };
        if !actor.can(needs) {
            return Ok(Some("⛔ Not authorized"));
        }

        match action {
            "stats" => {
                let html = self.stats_html().await?;
                self.show(actor.chat_id, msg, &html).await?;
            }
            "broadcast" => {
                self.show_with(
                    actor.chat_id,
                    msg,
                    "📢 <b>Broadcast</b>\nSend now or schedule for later?",
                    keyboards::broadcast_mode(),
                )
                .await?;
            }
            "users" => {
                let users = self.storage.get_users().await?;
                let mut html = format!("👥 <b>Users</b> ({})\n\n", users.len());
                for u in users.iter().take(LIST_LIMIT) {
                    html.push_str(&format!(
                        "<code>{}</code> {} · {}\n",
                        u.user_id,
                        escape_html(&u.display_name()),
                        u.role.as_str()
                    ));
                }
                self.show_with(actor.chat_id, msg, &html, keyboards::user_management())
                    .await?;
            }
            "banned" => {
                let banned = self.storage.banned_users().await?;
                let html = if banned.is_empty() {
                    "✅ No banned users.".to_string()
                } else {
                    let mut html = format!("🚫 <b>Banned users</b> ({})\n\n", banned.len());
                    for u in banned.iter().take(LIST_LIMIT) {
                        html.push_str(&format!(
                            "<code>{}</code> {} · {}\n",
                            u.user_id,
                            escape_html(&u.display_name()),
                            escape_html(u.ban_reason.as_deref().unwrap_or("-"))
                        ));
                    }
                    html
                };
                self.show(actor.chat_id, msg, &html).await?;
            }
            "logs" => {
                let logs = self.storage.recent_logs(LIST_LIMIT).await?;
                let mut html = String::from("📝 <b>Recent activity</b>\n\n");
                if logs.is_empty() {
                    html.push_str("Nothing yet.");
                }
                for l in &logs {
                    html.push_str(&format!(
                        "{} <code>{}</code> {}",
                        format_timestamp(l.created_at),
                        l.user_id,
                        escape_html(&l.action)
                    ));
                    if let Some(d) = &l.details {
                        html.push_str(&format!(": {}", escape_html(&truncate_text(d, 80))));
                    }
                    html.push('\n');
                }
                self.show(actor.chat_id, msg, &html).await?;
            }
            "ban" => {
                self.prompt(
                    actor,
                    Permission::Ban,
                    SessionTag::AwaitingBanUserId,
                    "🆔 Send the user id to ban:",
                )
                .await?;
            }
            _ => {
                self.prompt(
                    actor,
                    Permission::Unban,
                    SessionTag::AwaitingUnbanUserId,
                    "🆔 Send the user id to unban:",
                )
                .await?;
            }
        }
        Ok(None)
    }

    async fn pick_role(&self, actor: &Actor, role: &str) -> Result<Toast> {
        let Some(role) = Role::parse(role).filter(|r| *r != Role::Owner) else {
            return Ok(Some("Unknown action"));
        };
        if !actor.can(Permission::ManageUsers) {
            return Ok(Some("⛔ Not authorized"));
        }
        self.sessions
            .put(
                actor.id(),
                UserSession::new(SessionTag::AwaitingRoleUserId).with("role", role.as_str()),
            )
            .await;
        self.reply_with(
            actor.chat_id,
            &format!("🆔 Send the user id to make <b>{}</b>:", role.as_str()),
            keyboards::cancel_only(),
        )
        .await?;
        Ok(None)
    }
}
