use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    broadcast::DispatchPolicy,
    errors::Error,
    security::{AbusePolicy, RateLimitPolicy},
    Result,
};

/// Typed configuration for the bot.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub admin_ids: Vec<i64>,
    pub data_path: PathBuf,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Abuse detection
    pub spam_threshold: u32,
    pub spam_ban_duration: Duration,
    pub spam_post_ban_grace: Option<Duration>,

    // Broadcasts
    pub broadcast_pace: Duration,
    pub broadcast_send_timeout: Option<Duration>,
    pub broadcast_progress_every: usize,
    pub schedule_tick: Duration,

    // Media
    pub max_file_size: u64,
    pub temp_dir: PathBuf,
    pub auto_cleanup_age: Duration,
    pub download_timeout: Duration,
}

impl Config {
    /// Load from the process environment (after an optional `.env`) and make
    /// sure the directories we write to exist.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        let cfg = Self::from_lookup(|key| env::var(key).ok())?;

        fs::create_dir_all(&cfg.temp_dir)?;
        if let Some(parent) = cfg.data_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(cfg)
    }

    /// Build a config from an arbitrary key lookup. Pure: touches neither the
    /// environment nor the filesystem.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|s| s.trim().to_string());

        let bot_token = get("BOT_TOKEN").unwrap_or_default();
        if bot_token.is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_ids = parse_csv_i64(get("ADMIN_IDS"));
        let data_path = PathBuf::from(get("DB_PATH").unwrap_or("./data/bot.db".to_string()));

        let rate_limit_enabled = get("RATE_LIMIT_ENABLED")
            .map(|s| parse_bool(&s))
            .unwrap_or(true);
        let rate_limit_requests = parse_num(get("RATE_LIMIT_MAX_REQUESTS")).unwrap_or(10);
        let rate_limit_window =
            Duration::from_millis(parse_num(get("RATE_LIMIT_WINDOW")).unwrap_or(60_000));

        let spam_threshold = parse_num(get("SPAM_THRESHOLD")).unwrap_or(5);
        let spam_ban_duration =
            Duration::from_millis(parse_num(get("SPAM_BAN_DURATION")).unwrap_or(3_600_000));
        let spam_post_ban_grace =
            parse_num::<u64>(get("SPAM_POST_BAN_GRACE")).map(Duration::from_millis);

        let broadcast_pace =
            Duration::from_millis(parse_num(get("BROADCAST_PACE_MS")).unwrap_or(50));
        let broadcast_send_timeout =
            match parse_num::<u64>(get("BROADCAST_SEND_TIMEOUT_MS")).unwrap_or(10_000) {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            };
        let broadcast_progress_every = parse_num(get("BROADCAST_PROGRESS_EVERY"))
            .filter(|n: &usize| *n > 0)
            .unwrap_or(10);
        let schedule_tick = Duration::from_secs(
            parse_num(get("SCHEDULE_TICK_SECS"))
                .filter(|n: &u64| *n > 0)
                .unwrap_or(60),
        );

        let max_file_size = parse_num(get("MAX_FILE_SIZE")).unwrap_or(2_000_000_000);
        let temp_dir = PathBuf::from(get("TEMP_DIR").unwrap_or("./temp".to_string()));
        let auto_cleanup_age =
            Duration::from_secs(3600 * parse_num::<u64>(get("AUTO_CLEANUP_HOURS")).unwrap_or(24));
        let download_timeout = Duration::from_secs(
            parse_num(get("DOWNLOAD_TIMEOUT_SECS"))
                .filter(|n: &u64| *n > 0)
                .unwrap_or(600),
        );

        Ok(Self {
            bot_token,
            admin_ids,
            data_path,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
            spam_threshold,
            spam_ban_duration,
            spam_post_ban_grace,
            broadcast_pace,
            broadcast_send_timeout,
            broadcast_progress_every,
            schedule_tick,
            max_file_size,
            temp_dir,
            auto_cleanup_age,
            download_timeout,
        })
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            enabled: self.rate_limit_enabled,
            max_requests: self.rate_limit_requests,
            window: self.rate_limit_window,
        }
    }

    pub fn abuse_policy(&self) -> AbusePolicy {
        AbusePolicy {
            threshold: self.spam_threshold,
            ban_duration: self.spam_ban_duration,
            post_ban_grace: self.spam_post_ban_grace,
            ..AbusePolicy::default()
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            pace: self.broadcast_pace,
            send_timeout: self.broadcast_send_timeout,
            progress_every: self.broadcast_progress_every,
        }
    }

    pub fn is_admin_id(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return &s[1..s.len() - 1];
    }
    s
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_num<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
    v.and_then(|s| s.parse::<T>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}
