use chrono::Utc;

use crate::{
    domain::MessageRef,
    formatting::{escape_html, format_file_size},
    security::Permission,
    session::{SessionTag, UserSession},
    Result,
};

use super::{keyboards, Actor, Interaction};

const HELP: &str = "<b>How to use</b>\n\n\
1. Send /download or paste a video link\n\
2. Pick a quality\n\
3. Choose file or link\n\n\
Supported: YouTube, Instagram, TikTok, Facebook, Twitter/X and direct links.\n\n\
/history - your last downloads\n\
/cancel - abort the current step";

const HISTORY_LIMIT: usize = 10;

impl Interaction {
    pub(super) async fn on_command(&self, actor: &Actor, name: &str, args: &str) -> Result<()> {
        tracing::debug!(user_id = actor.id().0, command = name, "command");
        match name {
            "start" => self.cmd_start(actor).await,
            "help" => self.reply(actor.chat_id, HELP).await,
            "download" => self.cmd_download(actor, args.trim()).await,
            "history" => self.cmd_history(actor).await,
            "cancel" => self.cancel(actor, None).await,
            "admin" => self.cmd_admin(actor).await,
            "stats" => self.cmd_stats(actor).await,
            "broadcast" => {
                self.prompt(
                    actor,
                    Permission::Broadcast,
                    SessionTag::AwaitingBroadcast,
                    "📢 Send the message to broadcast to every user:",
                )
                .await
            }
            "ban" => {
                self.prompt(
                    actor,
                    Permission::Ban,
                    SessionTag::AwaitingBanUserId,
                    "🆔 Send the user id to ban:",
                )
                .await
            }
            "unban" => {
                self.prompt(
                    actor,
                    Permission::Unban,
                    SessionTag::AwaitingUnbanUserId,
                    "🆔 Send the user id to unban:",
                )
                .await
            }
            _ => {
                self.reply(actor.chat_id, "Unknown command. See /help.")
                    .await
            }
        }
    }

    async fn cmd_start(&self, actor: &Actor) -> Result<()> {
        let name = actor
            .user
            .first_name
            .as_deref()
            .map(escape_html)
            .unwrap_or_else(|| "there".to_string());
        self.reply(
            actor.chat_id,
            &format!("👋 Hi {name}! Send me a video link to download it.\n\n{HELP}"),
        )
        .await
    }

    /// `/download <url>` skips the prompt.
    async fn cmd_download(&self, actor: &Actor, url: &str) -> Result<()> {
        if !self.admit(actor).await? {
            return Ok(());
        }
        if !url.is_empty() {
            return self.start_download(actor, url).await;
        }
        self.sessions
            .put(actor.id(), UserSession::new(SessionTag::AwaitingUrl))
            .await;
        self.reply_with(
            actor.chat_id,
            "🔗 Send the video link:",
            keyboards::cancel_only(),
        )
        .await
    }

    async fn cmd_history(&self, actor: &Actor) -> Result<()> {
        let downloads = self
            .storage
            .user_downloads(actor.id(), HISTORY_LIMIT)
            .await?;
        if downloads.is_empty() {
            return self.reply(actor.chat_id, "📭 No downloads yet.").await;
        }

        let mut html = String::from("📁 <b>Your downloads</b>\n\n");
        for (i, d) in downloads.iter().enumerate() {
            html.push_str(&format!(
                "{}. {}\n   {} · {} · {}\n",
                i + 1,
                escape_html(&d.title),
                escape_html(&d.quality),
                escape_html(&d.format),
                format_file_size(d.file_size),
            ));
        }
        self.reply_with(actor.chat_id, &html, keyboards::history())
            .await
    }

    async fn cmd_admin(&self, actor: &Actor) -> Result<()> {
        if !actor.role.is_staff() {
            return self.deny(actor).await;
        }
        self.reply_with(
            actor.chat_id,
            &format!("🛠 <b>Admin panel</b> ({})", actor.role.as_str()),
            keyboards::admin_panel(actor.role),
        )
        .await
    }

    async fn cmd_stats(&self, actor: &Actor) -> Result<()> {
        if !actor.can(Permission::Stats) {
            return self.deny(actor).await;
        }
        let html = self.stats_html().await?;
        self.reply(actor.chat_id, &html).await
    }

    pub(super) async fn stats_html(&self) -> Result<String> {
        let s = self.storage.stats(Utc::now()).await?;
        Ok(format!(
            "📊 <b>Statistics</b>\n\n\
             Total users: {}\n\
             Active today: {}\n\
             Total downloads: {}\n\
             Downloads today: {}\n\
             Banned: {}",
            s.total_users, s.active_today, s.total_downloads, s.downloads_today, s.banned_count
        ))
    }

    /// Permission check, then park the user in `tag` and ask for input.
    pub(super) async fn prompt(
        &self,
        actor: &Actor,
        permission: Permission,
        tag: SessionTag,
        question: &str,
    ) -> Result<()> {
        if !actor.can(permission) {
            return self.deny(actor).await;
        }
        self.sessions
            .put(actor.id(), UserSession::new(tag))
            .await;
        self.reply_with(actor.chat_id, question, keyboards::cancel_only())
            .await
    }

    /// Drop any pending step and download. `msg` is the message the cancel
    /// button sat on, if any.
    pub(super) async fn cancel(
        &self,
        actor: &Actor,
        msg: Option<MessageRef>,
    ) -> Result<()> {
        let had_session = self.sessions.clear(actor.id()).await;
        let had_download = self.downloads.clear(actor.id()).await;
        tracing::debug!(
            user_id = actor.id().0,
            had_session,
            had_download,
            "cancelled"
        );
        self.show(actor.chat_id, msg, "❌ Cancelled.").await
    }
}
