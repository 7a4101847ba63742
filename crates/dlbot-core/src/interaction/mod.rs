//! Update handling: admission, authorization, session routing.
//!
//! `Interaction::handle` is the single entry point the transport adapter
//! calls. Everything here talks to the outside world only through the ports
//! (`Storage`, `MessagingPort`, `MediaSource`).

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;

use crate::{
    broadcast::BroadcastService,
    config::Config,
    domain::{ChatId, MessageRef, UserId},
    formatting::{format_timestamp, wait_seconds},
    media::MediaSource,
    messaging::{IncomingUpdate, InlineKeyboard, MessagingPort, Sender},
    security::{effective_role, Admission, AdmissionGate, Permission, Role},
    session::{DownloadSessions, SessionStateStore},
    storage::{ActivityLog, Storage, UserRecord},
    Result,
};

mod callback;
mod commands;
pub mod keyboards;
mod text;

#[derive(Clone, Debug)]
pub struct InteractionConfig {
    pub admin_ids: Vec<i64>,
    pub temp_dir: PathBuf,
    pub max_file_size: u64,
}

impl From<&Config> for InteractionConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            admin_ids: cfg.admin_ids.clone(),
            temp_dir: cfg.temp_dir.clone(),
            max_file_size: cfg.max_file_size,
        }
    }
}

pub struct Interaction {
    cfg: InteractionConfig,
    storage: Arc<dyn Storage>,
    messenger: Arc<dyn MessagingPort>,
    media: Arc<dyn MediaSource>,
    gate: AdmissionGate,
    broadcasts: Arc<BroadcastService>,
    sessions: SessionStateStore,
    downloads: DownloadSessions,
}

/// Who is acting, resolved once per update.
struct Actor {
    chat_id: ChatId,
    user: UserRecord,
    role: Role,
}

impl Actor {
    fn id(&self) -> UserId {
        self.user.user_id
    }

    fn can(&self, permission: Permission) -> bool {
        self.role.allows(permission)
    }
}

impl Interaction {
    pub fn new(
        cfg: InteractionConfig,
        storage: Arc<dyn Storage>,
        messenger: Arc<dyn MessagingPort>,
        media: Arc<dyn MediaSource>,
        gate: AdmissionGate,
        broadcasts: Arc<BroadcastService>,
    ) -> Self {
        Self {
            cfg,
            storage,
            messenger,
            media,
            gate,
            broadcasts,
            sessions: SessionStateStore::new(),
            downloads: DownloadSessions::new(),
        }
    }

    pub fn sessions(&self) -> &SessionStateStore {
        &self.sessions
    }

    pub fn downloads(&self) -> &DownloadSessions {
        &self.downloads
    }

    pub async fn handle(&self, update: IncomingUpdate) -> Result<()> {
        let chat_id = update.chat_id();
        let user = self.ensure_user(update.sender()).await?;

        if user.is_banned {
            tracing::debug!(user_id = user.user_id.0, "ignoring banned user");
            let notice = "🚫 You are not allowed to use this bot.";
            return match &update {
                IncomingUpdate::Callback(q) => {
                    self.messenger
                        .answer_callback_query(&q.callback_id, Some(notice))
                        .await
                }
                _ => self.reply(chat_id, notice).await,
            };
        }

        let role = effective_role(user.user_id, Some(user.role), &self.cfg.admin_ids);
        let actor = Actor {
            chat_id,
            user,
            role,
        };

        match update {
            IncomingUpdate::Command(cmd) => self.on_command(&actor, &cmd.name, &cmd.args).await,
            IncomingUpdate::Text(msg) => self.on_text(&actor, &msg.text).await,
            IncomingUpdate::Callback(q) => self.on_callback(&actor, q).await,
        }
    }

    /// Register unknown senders, otherwise refresh `last_active`.
    async fn ensure_user(&self, sender: &Sender) -> Result<UserRecord> {
        let now = Utc::now();
        if let Some(mut user) = self.storage.get_user(sender.user_id).await? {
            self.storage.touch_user(sender.user_id, now).await?;
            user.last_active = now;
            return Ok(user);
        }

        let mut user = UserRecord::new(sender.user_id, now);
        user.username = sender.username.clone();
        user.first_name = sender.first_name.clone();
        user.last_name = sender.last_name.clone();
        if let Some(lang) = &sender.language_code {
            user.language = lang.clone();
        }
        self.storage.upsert_user(user.clone()).await?;
        self.log(user.user_id, "user_registered", None).await;
        tracing::info!(user_id = user.user_id.0, "user registered");
        Ok(user)
    }

    /// Rate limit + abuse check. Tells the user and returns `false` when the
    /// event must be dropped.
    async fn admit(&self, actor: &Actor) -> Result<bool> {
        match self.gate.check(actor.id()).await? {
            Admission::Admitted => Ok(true),
            Admission::RateLimited { reset_in } => {
                let secs = wait_seconds(reset_in);
                self.reply(
                    actor.chat_id,
                    &format!("⏳ Too many requests. Try again in {secs} seconds."),
                )
                .await?;
                Ok(false)
            }
            Admission::Banned { until } => {
                self.reply(
                    actor.chat_id,
                    &format!(
                        "🚫 Spam detected. You are blocked until {}.",
                        format_timestamp(until)
                    ),
                )
                .await?;
                Ok(false)
            }
        }
    }

    async fn deny(&self, actor: &Actor) -> Result<()> {
        self.reply(actor.chat_id, "⛔ You are not authorized to do that.")
            .await
    }

    async fn reply(&self, chat_id: ChatId, html: &str) -> Result<()> {
        self.messenger.send_html(chat_id, html).await.map(|_| ())
    }

    async fn reply_with(&self, chat_id: ChatId, html: &str, kb: InlineKeyboard) -> Result<()> {
        self.messenger
            .send_inline_keyboard(chat_id, html, kb)
            .await
            .map(|_| ())
    }

    /// Edit the message a button was pressed on, or send a new one.
    async fn show(&self, chat_id: ChatId, msg: Option<MessageRef>, html: &str) -> Result<()> {
        match msg {
            Some(m) => self.messenger.edit_html(m, html).await,
            None => self.reply(chat_id, html).await,
        }
    }

    async fn show_with(
        &self,
        chat_id: ChatId,
        msg: Option<MessageRef>,
        html: &str,
        kb: InlineKeyboard,
    ) -> Result<()> {
        match msg {
            Some(m) => self.messenger.edit_inline_keyboard(m, html, kb).await,
            None => self.reply_with(chat_id, html, kb).await,
        }
    }

    /// Activity log writes never fail the interaction.
    async fn log(&self, user_id: UserId, action: &str, details: Option<String>) {
        let entry = ActivityLog {
            user_id,
            action: action.to_string(),
            details,
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.add_log(entry).await {
            tracing::warn!(user_id = user_id.0, action, error = %e, "activity log write failed");
        }
    }
}

#[cfg(test)]
mod tests;
