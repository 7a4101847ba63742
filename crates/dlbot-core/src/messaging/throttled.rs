use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

/// Chat limiters are swept once the map reaches this size.
const PRUNE_AT: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between two outbound calls of any kind.
    pub global_min_interval: Duration,
    /// Spacing between two calls into the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        // Telegram allows roughly 30 messages a second overall and one a
        // second per chat.
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Leaky bucket with a capacity of one: every caller reserves the next free
/// slot, slots are `interval` apart.
#[derive(Debug)]
pub struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take the next slot; returns how long the caller must wait for it.
    pub fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = self.next.max(now);
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }

    /// No slot is booked past `now`, so a fresh limiter behaves the same.
    fn is_idle(&self, now: Instant) -> bool {
        self.next <= now
    }
}

/// Reserve a slot on a shared limiter and sleep until it comes up. The lock
/// is released before sleeping.
pub async fn wait_for_slot(limiter: &Mutex<IntervalLimiter>) {
    let wait = { limiter.lock().await.reserve() };
    if !wait.is_zero() {
        sleep(wait).await;
    }
}

/// Spaces outbound calls globally and per chat so bursts (a broadcast, a
/// chatty admin panel) stay under the platform's flood limits. The wrapped
/// adapter may still see the odd `RetryAfter`.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    chats: Mutex<HashMap<i64, IntervalLimiter>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            chats: Mutex::new(HashMap::new()),
        }
    }

    async fn reserve_chat(&self, chat_id: ChatId) -> Duration {
        let mut chats = self.chats.lock().await;
        if chats.len() >= PRUNE_AT && !chats.contains_key(&chat_id.0) {
            let now = Instant::now();
            chats.retain(|_, lim| !lim.is_idle(now));
        }
        chats
            .entry(chat_id.0)
            .or_insert_with(|| IntervalLimiter::new(self.cfg.per_chat_min_interval))
            .reserve()
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = self.reserve_chat(chat_id).await;
        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    #[cfg(test)]
    async fn tracked_chats(&self) -> usize {
        self.chats.lock().await.len()
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_text(chat_id, text).await
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.throttle_chat(msg.chat_id).await;
        self.inner.edit_html(msg, html).await
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_inline_keyboard(chat_id, html, keyboard).await
    }

    async fn edit_inline_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        self.throttle_chat(msg.chat_id).await;
        self.inner.edit_inline_keyboard(msg, html, keyboard).await
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_document(chat_id, path, caption).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // No chat id here; global spacing only.
        wait_for_slot(&self.global).await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}
