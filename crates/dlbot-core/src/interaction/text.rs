use chrono::Utc;

use crate::{
    broadcast::{parse_scheduled, JobOutcome, StatusMessageProgress},
    domain::{ChatId, UserId},
    formatting::{escape_html, format_timestamp},
    media::is_valid_url,
    security::{effective_role, Permission, Role},
    session::{DownloadSession, SessionTag, UserSession},
    storage::UserRecord,
    Error, Result,
};

use super::{keyboards, Actor, Interaction};

impl Interaction {
    pub(super) async fn on_text(&self, actor: &Actor, text: &str) -> Result<()> {
        let text = text.trim();

        let Some(pending) = self.sessions.get(actor.id()).await else {
            if is_valid_url(text) {
                if !self.admit(actor).await? {
                    return Ok(());
                }
                return self.start_download(actor, text).await;
            }
            return self
                .reply(
                    actor.chat_id,
                    "Send me a video link, or use /download. See /help.",
                )
                .await;
        };

        // Admission comes before the session is touched: a refused event
        // leaves the pending step as it was.
        if pending.tag == SessionTag::AwaitingUrl && !self.admit(actor).await? {
            return Ok(());
        }
        // Consumed before any slow work, so a repeat message can't run the
        // same step twice.
        let Some(session) = self.sessions.take(actor.id()).await else {
            return Ok(());
        };

        match session.tag {
            SessionTag::AwaitingUrl => self.start_download(actor, text).await,
            SessionTag::AwaitingBroadcast => self.broadcast_now(actor, text).await,
            SessionTag::AwaitingScheduledBroadcast => self.broadcast_later(actor, text).await,
            SessionTag::AwaitingBanUserId => self.ban_pick_user(actor, text).await,
            SessionTag::AwaitingBanReason => self.ban_with_reason(actor, &session, text).await,
            SessionTag::AwaitingUnbanUserId => self.unban(actor, text).await,
            SessionTag::AwaitingRoleUserId => self.assign_role(actor, &session, text).await,
        }
    }

    // ============== Download ==============

    /// Probe `url` and offer qualities. The caller has already passed the
    /// admission gate.
    pub(super) async fn start_download(&self, actor: &Actor, url: &str) -> Result<()> {
        if !is_valid_url(url) {
            return self
                .reply(actor.chat_id, "❌ That doesn't look like a valid link.")
                .await;
        }

        let status = self
            .messenger
            .send_html(actor.chat_id, "🔍 Fetching video info...")
            .await?;

        let info = match self.media.inspect(url).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(user_id = actor.id().0, error = %e, "media inspection failed");
                self.downloads.clear(actor.id()).await;
                return self
                    .messenger
                    .edit_html(
                        status,
                        &format!("❌ Could not fetch video info: {}", escape_html(&e.to_string())),
                    )
                    .await;
            }
        };

        self.downloads
            .set(
                actor.id(),
                DownloadSession {
                    url: url.to_string(),
                    platform: info.platform.as_str().to_string(),
                    title: info.title.clone(),
                    direct_url: info.direct_url.clone(),
                    selected_quality: None,
                },
            )
            .await;

        let mut html = format!("🎬 <b>{}</b>\n", escape_html(&info.title));
        if let Some(d) = &info.duration {
            html.push_str(&format!("⏱ {}\n", escape_html(d)));
        }
        html.push_str("\nChoose a quality:");

        self.messenger
            .edit_inline_keyboard(status, &html, keyboards::quality(&info.qualities))
            .await?;
        self.log(
            actor.id(),
            "video_info_fetched",
            Some(format!("Platform: {}", info.platform.as_str())),
        )
        .await;
        Ok(())
    }

    // ============== Broadcast ==============

    async fn broadcast_now(&self, actor: &Actor, message: &str) -> Result<()> {
        if !actor.can(Permission::Broadcast) {
            return self.deny(actor).await;
        }
        let job = match self.broadcasts.create_immediate(actor.id(), message).await {
            Ok(job) => job,
            Err(Error::InvalidInput(why)) => {
                self.messenger
                    .send_html(actor.chat_id, &format!("❌ {}", escape_html(&why)))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let status = self
            .messenger
            .send_html(
                actor.chat_id,
                &format!("📢 Sending... 0/{}", job.total_users),
            )
            .await?;
        let progress = StatusMessageProgress::new(self.messenger.clone(), status);
        let outcome = self
            .broadcasts
            .dispatcher()
            .run_job(job.id, Some(&progress))
            .await?;

        match outcome {
            JobOutcome::Completed(job) => {
                self.messenger
                    .edit_html(
                        status,
                        &format!(
                            "✅ Broadcast {} sent to {} users.\n❌ Failed: {}",
                            job.id, job.success_count, job.failed_count
                        ),
                    )
                    .await?;
                self.log(
                    actor.id(),
                    "broadcast_sent",
                    Some(format!("Sent to {} users", job.success_count)),
                )
                .await;
            }
            JobOutcome::Failed { job, reason } => {
                self.messenger
                    .edit_html(
                        status,
                        &format!("❌ Broadcast {} failed: {}", job.id, escape_html(&reason)),
                    )
                    .await?;
            }
            JobOutcome::Skipped { job_id, status: s } => {
                tracing::warn!(job_id = job_id.0, status = s.as_str(), "fresh broadcast was not pending");
            }
        }
        Ok(())
    }

    async fn broadcast_later(&self, actor: &Actor, text: &str) -> Result<()> {
        if !actor.can(Permission::Broadcast) {
            return self.deny(actor).await;
        }
        let (message, at) = match parse_scheduled(text) {
            Ok(v) => v,
            Err(e) => {
                let example = Utc::now().timestamp() + 3600;
                return self
                    .reply(
                        actor.chat_id,
                        &format!(
                            "❌ {}\nFormat: <code>message|time</code>\nExample: <code>Hello|{example}</code>",
                            escape_html(&e.to_string())
                        ),
                    )
                    .await;
            }
        };

        let job = self
            .broadcasts
            .submit_scheduled(actor.id(), &message, at)
            .await?;
        self.reply(
            actor.chat_id,
            &format!(
                "🗓 Broadcast {} scheduled for {}.",
                job.id,
                format_timestamp(at)
            ),
        )
        .await?;
        self.log(
            actor.id(),
            "broadcast_scheduled",
            Some(format!("Job {} for {}", job.id, at.to_rfc3339())),
        )
        .await;
        Ok(())
    }

    // ============== Moderation ==============

    /// Parse a user id and make sure the user exists. Replies and returns
    /// `None` otherwise.
    async fn target_user(&self, actor: &Actor, text: &str) -> Result<Option<UserRecord>> {
        let Ok(id) = text.trim().parse::<i64>() else {
            self.reply(actor.chat_id, "❌ Invalid user id.").await?;
            return Ok(None);
        };
        let Some(user) = self.storage.get_user(UserId(id)).await? else {
            self.reply(actor.chat_id, "❌ User not found.").await?;
            return Ok(None);
        };
        Ok(Some(user))
    }

    /// Only strictly lower roles can be banned, which also rules out the
    /// actor themselves and every owner.
    fn can_ban(&self, actor: &Actor, target: &UserRecord) -> bool {
        let target_role = effective_role(target.user_id, Some(target.role), &self.cfg.admin_ids);
        actor.role.outranks(target_role)
    }

    async fn ban_pick_user(&self, actor: &Actor, text: &str) -> Result<()> {
        if !actor.can(Permission::Ban) {
            return self.deny(actor).await;
        }
        let Some(target) = self.target_user(actor, text).await? else {
            return Ok(());
        };
        if !self.can_ban(actor, &target) {
            return self.reply(actor.chat_id, "❌ That user can't be banned.").await;
        }

        self.sessions
            .put(
                actor.id(),
                UserSession::new(SessionTag::AwaitingBanReason)
                    .with("target_user_id", target.user_id.0),
            )
            .await;
        self.reply_with(
            actor.chat_id,
            "✍️ Send the ban reason:",
            keyboards::cancel_only(),
        )
        .await
    }

    async fn ban_with_reason(
        &self,
        actor: &Actor,
        session: &UserSession,
        reason: &str,
    ) -> Result<()> {
        if !actor.can(Permission::Ban) {
            return self.deny(actor).await;
        }
        let Some(target) = session.get_i64("target_user_id").map(UserId) else {
            return self
                .reply(actor.chat_id, "⌛ That ban has expired. Start again with /ban.")
                .await;
        };
        // Roles may have changed since the id was picked.
        match self.storage.get_user(target).await? {
            Some(user) if self.can_ban(actor, &user) => {}
            Some(_) => return self.reply(actor.chat_id, "❌ That user can't be banned.").await,
            None => return self.reply(actor.chat_id, "❌ User not found.").await,
        }

        self.storage.ban_user(target, reason, Utc::now()).await?;
        self.reply(actor.chat_id, &format!("✅ User {target} banned."))
            .await?;
        self.notify(
            ChatId::from(target),
            &format!("🚫 You have been banned.\nReason: {reason}"),
        )
        .await;
        self.log(
            actor.id(),
            "user_banned",
            Some(format!("Banned user {target}: {reason}")),
        )
        .await;
        tracing::info!(by = actor.id().0, target = target.0, "user banned");
        Ok(())
    }

    async fn unban(&self, actor: &Actor, text: &str) -> Result<()> {
        if !actor.can(Permission::Unban) {
            return self.deny(actor).await;
        }
        let Some(target) = self.target_user(actor, text).await? else {
            return Ok(());
        };
        let target = target.user_id;

        self.storage.unban_user(target).await?;
        self.reply(actor.chat_id, &format!("✅ User {target} unbanned."))
            .await?;
        self.notify(
            ChatId::from(target),
            "✅ Your ban was lifted. You can use the bot again.",
        )
        .await;
        self.log(
            actor.id(),
            "user_unbanned",
            Some(format!("Unbanned user {target}")),
        )
        .await;
        Ok(())
    }

    async fn assign_role(&self, actor: &Actor, session: &UserSession, text: &str) -> Result<()> {
        if !actor.can(Permission::ManageUsers) {
            return self.deny(actor).await;
        }
        let Some(role) = session
            .get_str("role")
            .and_then(Role::parse)
            .filter(|r| *r != Role::Owner)
        else {
            return self
                .reply(actor.chat_id, "⌛ Pick the role again from /admin.")
                .await;
        };
        let Some(target) = self.target_user(actor, text).await? else {
            return Ok(());
        };
        let target = target.user_id;

        self.storage.set_role(target, role).await?;
        self.reply(
            actor.chat_id,
            &format!("✅ Role <b>{}</b> assigned to {target}.", role.as_str()),
        )
        .await?;
        self.log(
            actor.id(),
            "role_assigned",
            Some(format!("Assigned {} to user {target}", role.as_str())),
        )
        .await;
        Ok(())
    }

    /// Plain-text message to someone other than the actor. They may have
    /// blocked the bot, so failures are only logged.
    async fn notify(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.messenger.send_text(chat_id, text).await {
            tracing::debug!(chat_id = chat_id.0, error = %e, "notification not delivered");
        }
    }
}
