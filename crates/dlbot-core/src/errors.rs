/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the core can
/// tell a per-recipient delivery failure apart from a whole-job failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    /// A single send to one recipient failed. Causes (blocked by user,
    /// network, flood control) are intentionally opaque to the core.
    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("broadcast {job_id} aborted: {reason}")]
    DispatchAborted { job_id: u64, reason: String },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
