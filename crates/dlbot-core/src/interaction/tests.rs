use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};

use super::*;
use crate::{
    broadcast::{BroadcastDispatcher, DispatchPolicy},
    domain::MessageId,
    messaging::{CallbackQuery, Command, TextMessage},
    security::{AbusePolicy, RateLimitPolicy},
    session::SessionTag,
    testing::{MemoryStore, RecordingMessenger, Sent, StaticMediaSource},
};

const OWNER: i64 = 100;
const URL: &str = "https://youtu.be/abc123";

struct Fixture {
    storage: Arc<dyn Storage>,
    messenger: Arc<RecordingMessenger>,
    media: Arc<StaticMediaSource>,
    bot: Interaction,
}

fn fixture_with(media: StaticMediaSource, rate: RateLimitPolicy) -> Fixture {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let messenger = Arc::new(RecordingMessenger::new());
    let media = Arc::new(media);
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        storage.clone(),
        messenger.clone(),
        DispatchPolicy::default(),
    ));
    let broadcasts = Arc::new(BroadcastService::new(storage.clone(), dispatcher));
    let gate = AdmissionGate::from_policies(rate, AbusePolicy::default(), storage.clone());
    let bot = Interaction::new(
        InteractionConfig {
            admin_ids: vec![OWNER],
            temp_dir: std::env::temp_dir().join("dlbot-interaction-tests"),
            max_file_size: 50 * 1024 * 1024,
        },
        storage.clone(),
        messenger.clone(),
        media.clone(),
        gate,
        broadcasts,
    );
    Fixture {
        storage,
        messenger,
        media,
        bot,
    }
}

fn fixture() -> Fixture {
    fixture_with(StaticMediaSource::new(), RateLimitPolicy::default())
}

fn cmd(user: i64, name: &str, args: &str) -> IncomingUpdate {
    IncomingUpdate::Command(Command {
        chat_id: ChatId(user),
        from: Sender::new(UserId(user)),
        name: name.to_string(),
        args: args.to_string(),
    })
}

fn text(user: i64, body: &str) -> IncomingUpdate {
    IncomingUpdate::Text(TextMessage {
        chat_id: ChatId(user),
        from: Sender::new(UserId(user)),
        text: body.to_string(),
    })
}

fn press(user: i64, data: &str) -> IncomingUpdate {
    IncomingUpdate::Callback(CallbackQuery {
        chat_id: ChatId(user),
        from: Sender::new(UserId(user)),
        callback_id: format!("cb-{data}"),
        data: data.to_string(),
        message: Some(MessageRef {
            chat_id: ChatId(user),
            message_id: MessageId(1),
        }),
    })
}

fn callback_answers(m: &RecordingMessenger) -> Vec<(String, Option<String>)> {
    m.sent()
        .into_iter()
        .filter_map(|s| match s {
            Sent::CallbackAnswer { callback_id, text } => Some((callback_id, text)),
            _ => None,
        })
        .collect()
}

fn last(m: &RecordingMessenger, chat: i64) -> String {
    m.last_body_to(chat).unwrap_or_default()
}

impl Fixture {
    async fn send(&self, update: IncomingUpdate) {
        self.bot.handle(update).await.unwrap();
    }

    async fn session_tag(&self, user: i64) -> Option<SessionTag> {
        self.bot.sessions().get(UserId(user)).await.map(|s| s.tag)
    }
}

#[tokio::test]
async fn start_registers_the_user() {
    let f = fixture();
    f.send(cmd(1, "start", "")).await;

    assert!(f.storage.get_user(UserId(1)).await.unwrap().is_some());
    assert!(last(&f.messenger, 1).contains("Hi there"));
    let logs = f.storage.recent_logs(10).await.unwrap();
    assert!(logs.iter().any(|l| l.action == "user_registered"));

    // Second contact only touches the record.
    f.send(cmd(1, "help", "")).await;
    let registrations = f
        .storage
        .recent_logs(10)
        .await
        .unwrap()
        .iter()
        .filter(|l| l.action == "user_registered")
        .count();
    assert_eq!(registrations, 1);
}

#[tokio::test]
async fn download_flow_delivers_file_and_records_it() {
    let f = fixture();
    f.send(cmd(1, "download", "")).await;
    assert_eq!(f.session_tag(1).await, Some(SessionTag::AwaitingUrl));

    f.send(text(1, URL)).await;
    assert_eq!(f.session_tag(1).await, None);
    let pending = f.bot.downloads().get(UserId(1)).await.unwrap();
    assert_eq!(pending.platform, "youtube");
    let kb = f.messenger.keyboards_to(1).pop().unwrap();
    assert_eq!(kb.rows[0][0].callback_data, "quality:720p");

    f.send(press(1, "quality:720p")).await;
    let pending = f.bot.downloads().get(UserId(1)).await.unwrap();
    assert_eq!(pending.selected_quality.as_deref(), Some("720p"));

    f.send(press(1, "format:file")).await;
    assert_eq!(
        f.media.fetched(),
        vec![(URL.to_string(), "720p".to_string())]
    );
    assert!(f
        .messenger
        .sent()
        .iter()
        .any(|s| matches!(s, Sent::Document { chat_id, .. } if *chat_id == ChatId(1))));

    let history = f.storage.user_downloads(UserId(1), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].quality, "720p");
    assert_eq!(history[0].format, "mp4");
    assert_eq!(history[0].download_type, "file");
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());

    let logs = f.storage.recent_logs(20).await.unwrap();
    assert!(logs.iter().any(|l| l.action == "video_info_fetched"));
    assert!(logs.iter().any(|l| l.action == "download_completed"));
    assert_eq!(callback_answers(&f.messenger).len(), 2);
}

#[tokio::test]
async fn link_delivery_hands_out_the_direct_url() {
    let f = fixture();
    f.send(text(1, URL)).await;
    f.send(press(1, "quality:360p")).await;
    f.send(press(1, "format:link")).await;

    assert!(last(&f.messenger, 1).contains("https://cdn.example.org/clip.mp4"));
    assert!(f.media.fetched().is_empty());
    let history = f.storage.user_downloads(UserId(1), 10).await.unwrap();
    assert_eq!(history[0].format, "link");
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
}

#[tokio::test]
async fn quality_pick_without_download_reports_expiry() {
    let f = fixture();
    f.send(press(1, "quality:720p")).await;
    assert!(last(&f.messenger, 1).contains("expired"));
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
}

#[tokio::test]
async fn failed_inspection_clears_download() {
    let f = fixture_with(
        StaticMediaSource::new().failing_inspect(),
        RateLimitPolicy::default(),
    );
    f.send(text(1, URL)).await;
    assert!(last(&f.messenger, 1).contains("Could not fetch"));
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
}

#[tokio::test]
async fn fetch_failure_clears_download() {
    let f = fixture_with(
        StaticMediaSource::new().failing_fetch(),
        RateLimitPolicy::default(),
    );
    f.send(text(1, URL)).await;
    f.send(press(1, "quality:720p")).await;
    f.send(press(1, "format:file")).await;

    assert!(last(&f.messenger, 1).contains("Download failed"));
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
    assert!(f.storage.user_downloads(UserId(1), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn refused_event_leaves_pending_step_untouched() {
    let f = fixture_with(
        StaticMediaSource::new(),
        RateLimitPolicy {
            enabled: true,
            max_requests: 1,
            window: Duration::from_secs(60),
        },
    );
    f.send(cmd(1, "download", "")).await;
    f.send(text(1, URL)).await;

    assert!(last(&f.messenger, 1).contains("Too many requests"));
    assert_eq!(f.session_tag(1).await, Some(SessionTag::AwaitingUrl));
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
}

#[tokio::test]
async fn non_url_text_gets_a_hint() {
    let f = fixture();
    f.send(text(1, "hello")).await;
    assert!(last(&f.messenger, 1).contains("/help"));
}

#[tokio::test]
async fn cancel_clears_both_stores() {
    let f = fixture();
    f.send(text(1, URL)).await;
    f.send(cmd(1, "download", "")).await;
    assert!(f.bot.downloads().get(UserId(1)).await.is_some());

    f.send(press(1, "cancel")).await;
    assert_eq!(f.session_tag(1).await, None);
    assert!(f.bot.downloads().get(UserId(1)).await.is_none());
    assert!(last(&f.messenger, 1).contains("Cancelled"));
}

#[tokio::test]
async fn ban_flow_moves_from_id_to_reason() {
    let f = fixture();
    f.send(cmd(1, "start", "")).await;

    f.send(cmd(OWNER, "ban", "")).await;
    assert_eq!(f.session_tag(OWNER).await, Some(SessionTag::AwaitingBanUserId));

    f.send(text(OWNER, "1")).await;
    let s = f.bot.sessions().get(UserId(OWNER)).await.unwrap();
    assert_eq!(s.tag, SessionTag::AwaitingBanReason);
    assert_eq!(s.get_i64("target_user_id"), Some(1));

    f.send(text(OWNER, "spam")).await;
    assert_eq!(f.session_tag(OWNER).await, None);
    let banned = f.storage.get_user(UserId(1)).await.unwrap().unwrap();
    assert!(banned.is_banned);
    assert_eq!(banned.ban_reason.as_deref(), Some("spam"));
    assert!(f
        .messenger
        .texts()
        .iter()
        .any(|(chat, t)| *chat == 1 && t.contains("banned")));

    f.send(cmd(1, "help", "")).await;
    assert!(last(&f.messenger, 1).contains("not allowed"));

    f.send(cmd(OWNER, "unban", "")).await;
    f.send(text(OWNER, "1")).await;
    assert!(!f.storage.get_user(UserId(1)).await.unwrap().unwrap().is_banned);
}

#[tokio::test]
async fn owners_cannot_be_banned() {
    let f = fixture();
    f.send(cmd(OWNER, "ban", "")).await;
    f.send(text(OWNER, &OWNER.to_string())).await;

    assert!(last(&f.messenger, OWNER).contains("can't be banned"));
    assert_eq!(f.session_tag(OWNER).await, None);
}

#[tokio::test]
async fn ban_of_unknown_user_is_refused() {
    let f = fixture();
    f.send(cmd(OWNER, "ban", "")).await;
    f.send(text(OWNER, "4242")).await;
    assert!(last(&f.messenger, OWNER).contains("User not found"));

    f.send(cmd(OWNER, "ban", "")).await;
    f.send(text(OWNER, "abc")).await;
    assert!(last(&f.messenger, OWNER).contains("Invalid user id"));
}

#[tokio::test]
async fn moderators_only_ban_lower_roles() {
    let f = fixture();
    for user in [1, 2, 3, 4] {
        f.send(cmd(user, "start", "")).await;
    }
    f.send(press(OWNER, "role:moderator")).await;
    f.send(text(OWNER, "1")).await;
    f.send(press(OWNER, "role:moderator")).await;
    f.send(text(OWNER, "3")).await;
    f.send(press(OWNER, "role:admin")).await;
    f.send(text(OWNER, "2")).await;

    let owner = OWNER.to_string();
    for target in ["2", "3", owner.as_str()] {
        f.send(cmd(1, "ban", "")).await;
        f.send(text(1, target)).await;
        assert!(last(&f.messenger, 1).contains("can't be banned"), "target {target}");
        assert_eq!(f.session_tag(1).await, None);
    }

    f.send(cmd(1, "ban", "")).await;
    f.send(text(1, "4")).await;
    assert_eq!(f.session_tag(1).await, Some(SessionTag::AwaitingBanReason));
}

#[tokio::test]
async fn promotion_between_ban_steps_blocks_the_ban() {
    let f = fixture();
    f.send(cmd(1, "start", "")).await;
    f.send(cmd(4, "start", "")).await;
    f.send(press(OWNER, "role:moderator")).await;
    f.send(text(OWNER, "1")).await;

    f.send(cmd(1, "ban", "")).await;
    f.send(text(1, "4")).await;
    f.send(press(OWNER, "role:admin")).await;
    f.send(text(OWNER, "4")).await;
    f.send(text(1, "spam")).await;

    assert!(last(&f.messenger, 1).contains("can't be banned"));
    assert!(!f.storage.get_user(UserId(4)).await.unwrap().unwrap().is_banned);
}

#[tokio::test]
async fn regular_users_cannot_use_admin_actions() {
    let f = fixture();
    f.send(cmd(1, "broadcast", "")).await;
    assert!(last(&f.messenger, 1).contains("not authorized"));
    assert_eq!(f.session_tag(1).await, None);

    f.send(press(1, "admin:stats")).await;
    let answers = callback_answers(&f.messenger);
    assert_eq!(answers.last().unwrap().1.as_deref(), Some("⛔ Not authorized"));
}

#[tokio::test]
async fn moderator_panel_is_filtered() {
    let f = fixture();
    f.send(cmd(1, "start", "")).await;
    f.send(press(OWNER, "role:moderator")).await;
    assert_eq!(f.session_tag(OWNER).await, Some(SessionTag::AwaitingRoleUserId));
    f.send(text(OWNER, "1")).await;
    assert_eq!(
        f.storage.get_user(UserId(1)).await.unwrap().unwrap().role,
        Role::Moderator
    );

    f.send(cmd(1, "admin", "")).await;
    let kb = f.messenger.keyboards_to(1).pop().unwrap();
    let data: Vec<_> = kb.buttons().map(|b| b.callback_data.as_str()).collect();
    assert!(data.contains(&"admin:ban"));
    assert!(!data.contains(&"admin:broadcast"));
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_every_user() {
    let f = fixture();
    f.send(cmd(1, "start", "")).await;
    f.send(cmd(2, "start", "")).await;

    f.send(cmd(OWNER, "broadcast", "")).await;
    f.send(text(OWNER, "hello everyone")).await;

    let got: Vec<i64> = f
        .messenger
        .texts()
        .into_iter()
        .filter(|(_, t)| t == "hello everyone")
        .map(|(chat, _)| chat)
        .collect();
    assert_eq!(got.len(), 3);
    assert!(f
        .messenger
        .bodies_to(OWNER)
        .iter()
        .any(|b| b == "📢 Sending... 0/3"));
    assert!(last(&f.messenger, OWNER).contains("sent to 3 users"));
    assert_eq!(f.session_tag(OWNER).await, None);
    let logs = f.storage.recent_logs(20).await.unwrap();
    assert!(logs.iter().any(|l| l.action == "broadcast_sent"));
}

#[tokio::test]
async fn scheduled_broadcast_is_stored_for_the_poller() {
    let f = fixture();
    f.send(press(OWNER, "broadcast:schedule")).await;
    assert_eq!(
        f.session_tag(OWNER).await,
        Some(SessionTag::AwaitingScheduledBroadcast)
    );

    let at = Utc::now() + TimeDelta::hours(2);
    f.send(text(OWNER, &format!("later|{}", at.timestamp()))).await;
    assert!(last(&f.messenger, OWNER).contains("scheduled"));

    let due = f
        .storage
        .list_pending_due_jobs(at + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].message, "later");
    assert!(f
        .storage
        .list_pending_due_jobs(Utc::now())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn malformed_schedule_gets_format_hint() {
    let f = fixture();
    f.send(press(OWNER, "broadcast:schedule")).await;
    f.send(text(OWNER, "no time here")).await;
    assert!(last(&f.messenger, OWNER).contains("Format"));
    assert_eq!(f.session_tag(OWNER).await, None);
}

#[tokio::test]
async fn history_can_be_cleared() {
    let f = fixture();
    f.send(text(1, URL)).await;
    f.send(press(1, "quality:720p")).await;
    f.send(press(1, "format:link")).await;

    f.send(cmd(1, "history", "")).await;
    assert!(last(&f.messenger, 1).contains("Test clip"));

    f.send(press(1, "history:clear")).await;
    assert!(f.storage.user_downloads(UserId(1), 10).await.unwrap().is_empty());
    f.send(cmd(1, "history", "")).await;
    assert!(last(&f.messenger, 1).contains("No downloads"));
}

#[tokio::test]
async fn unknown_callback_is_still_answered() {
    let f = fixture();
    f.send(press(1, "bogus")).await;
    let answers = callback_answers(&f.messenger);
    assert_eq!(
        answers,
        vec![("cb-bogus".to_string(), Some("Unknown action".to_string()))]
    );
}
