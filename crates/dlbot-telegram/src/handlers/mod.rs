//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - converts the teloxide update into a core `IncomingUpdate`
//! - serializes work per chat
//! - hands it to `Interaction::handle` and logs whatever comes back

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message, User},
};

use dlbot_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::{self, Command, IncomingUpdate, Sender, TextMessage},
};

use crate::router::AppState;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(update) = message_update(&msg) else {
        // Stickers, photos, service messages: nothing to do.
        return Ok(());
    };
    dispatch(update, state).await;
    Ok(())
}

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(update) = callback_update(&q) else {
        // Inline-mode callbacks carry no chat; still stop the spinner.
        let _ = state.bot.answer_callback_query(q.id).await;
        return Ok(());
    };
    dispatch(update, state).await;
    Ok(())
}

async fn dispatch(update: IncomingUpdate, state: Arc<AppState>) {
    let chat_id = update.chat_id();
    let user_id = update.sender().user_id;
    let _guard = state.chat_locks.lock_chat(chat_id.0).await;
    if let Err(e) = state.interaction.handle(update).await {
        tracing::error!(chat_id = chat_id.0, user_id = user_id.0, error = %e, "update failed");
    }
}

fn sender(user: &User) -> Sender {
    Sender {
        user_id: UserId(user.id.0 as i64),
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()).filter(|s| !s.is_empty()),
        last_name: user.last_name.clone(),
        language_code: user.language_code.clone(),
    }
}

fn message_update(msg: &Message) -> Option<IncomingUpdate> {
    let from = sender(msg.from()?);
    let text = msg.text()?;
    let chat_id = ChatId(msg.chat.id.0);

    Some(match parse_command(text) {
        Some((name, args)) => IncomingUpdate::Command(Command {
            chat_id,
            from,
            name,
            args,
        }),
        None => IncomingUpdate::Text(TextMessage {
            chat_id,
            from,
            text: text.to_string(),
        }),
    })
}

fn callback_update(q: &CallbackQuery) -> Option<IncomingUpdate> {
    let msg = q.message.as_ref()?;
    let chat_id = ChatId(msg.chat.id.0);
    Some(IncomingUpdate::Callback(messaging::CallbackQuery {
        chat_id,
        from: sender(&q.from),
        callback_id: q.id.clone(),
        data: q.data.clone().unwrap_or_default(),
        message: Some(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }),
    }))
}

/// `/name@bot rest` -> `("name", "rest")`. Returns `None` for anything that
/// isn't a command.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((h, a)) => (h, a.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or_default();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name.to_ascii_lowercase(), args.to_string()))
}
