use std::{sync::Arc, time::Duration};

use anyhow::Context;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use dlbot_core::{
    broadcast::{BroadcastDispatcher, BroadcastService},
    config::Config,
    interaction::{Interaction, InteractionConfig},
    media::{spawn_janitor, MediaSource},
    messaging::{
        throttled::{ThrottleConfig, ThrottledMessenger},
        MessagingPort,
    },
    scheduler::SchedulePoller,
    security::AdmissionGate,
    storage::{SqliteStore, Storage},
};
use dlbot_http::HttpMediaSource;
use dlbot_telegram::TelegramMessenger;

const JANITOR_EVERY: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dlbot_core::logging::init("dlbot")?;

    let cfg = Config::load().context("loading config")?;
    tracing::info!(
        admins = cfg.admin_ids.len(),
        data = %cfg.data_path.display(),
        temp = %cfg.temp_dir.display(),
        "config loaded"
    );

    let db = Arc::new(
        SqliteStore::open(&cfg.data_path)
            .await
            .context("opening database")?,
    );
    let storage: Arc<dyn Storage> = db.clone();

    let bot = Bot::new(cfg.bot_token.clone());
    // Throttle in front of the raw adapter to stay under Telegram's flood
    // limits; the adapter still retries once on RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let media: Arc<dyn MediaSource> = Arc::new(HttpMediaSource::new(cfg.download_timeout)?);

    let dispatcher = Arc::new(BroadcastDispatcher::new(
        storage.clone(),
        messenger.clone(),
        cfg.dispatch_policy(),
    ));
    let broadcasts = Arc::new(BroadcastService::new(storage.clone(), dispatcher.clone()));
    let gate = AdmissionGate::from_policies(
        cfg.rate_limit_policy(),
        cfg.abuse_policy(),
        storage.clone(),
    );

    let poller = SchedulePoller::new(
        storage.clone(),
        dispatcher,
        messenger.clone(),
        cfg.schedule_tick,
    );
    poller.start().await;

    let shutdown = CancellationToken::new();
    let janitor = spawn_janitor(
        cfg.temp_dir.clone(),
        cfg.auto_cleanup_age,
        JANITOR_EVERY,
        shutdown.clone(),
    );

    let interaction = Arc::new(Interaction::new(
        InteractionConfig::from(&cfg),
        storage,
        messenger,
        media,
        gate,
        broadcasts,
    ));

    let result = dlbot_telegram::router::run_polling(bot, interaction)
        .await
        .context("telegram polling failed");

    tracing::info!("shutting down");
    poller.stop().await;
    shutdown.cancel();
    let _ = janitor.await;
    if let Err(e) = db.checkpoint().await {
        tracing::warn!(error = %e, "database checkpoint failed");
    }

    result
}
