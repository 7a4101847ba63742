//! Transport abstractions. Telegram is the only implementation.

pub mod port;
pub mod throttled;
pub mod types;

pub use port::MessagingPort;
pub use types::{
    CallbackQuery, Command, IncomingUpdate, InlineButton, InlineKeyboard, MessagingCapabilities,
    Sender, TextMessage,
};
