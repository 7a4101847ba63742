//! Core domain + application logic for the video download bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the HTTP media
//! source live behind ports (traits) implemented in adapter crates.

pub mod broadcast;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod interaction;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
