use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    domain::{add_duration, elapsed_between, UserId},
    storage::{AbuseRecord, Storage},
    Result,
};

/// Events closer together than this count toward a strike.
pub const BURST_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct AbusePolicy {
    pub threshold: u32,
    pub ban_duration: Duration,
    pub burst_window: Duration,
    /// Post-ban grace reset window.
    ///
    /// `None` keeps the strike counter untouched when a ban lapses, so one
    /// burst event right after expiry can re-ban immediately. `Some(g)` makes
    /// every event within `g` after a lapsed ban restart the counter at 1.
    pub post_ban_grace: Option<Duration>,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            ban_duration: Duration::from_secs(3600),
            burst_window: BURST_WINDOW,
            post_ban_grace: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbuseDecision {
    pub blocked: bool,
    pub banned_until: Option<DateTime<Utc>>,
}

impl AbuseDecision {
    fn admit() -> Self {
        Self {
            blocked: false,
            banned_until: None,
        }
    }

    fn block(until: DateTime<Utc>) -> Self {
        Self {
            blocked: true,
            banned_until: Some(until),
        }
    }
}

/// Burst detector that escalates to a temporary ban.
pub struct AbuseDetector {
    policy: AbusePolicy,
    storage: Arc<dyn Storage>,
}

impl AbuseDetector {
    pub fn new(policy: AbusePolicy, storage: Arc<dyn Storage>) -> Self {
        Self { policy, storage }
    }

    pub fn policy(&self) -> AbusePolicy {
        self.policy
    }

    pub async fn check(&self, user_id: UserId) -> Result<AbuseDecision> {
        self.check_at(user_id, Utc::now()).await
    }

    pub async fn check_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<AbuseDecision> {
        let Some(mut rec) = self.storage.read_abuse_record(user_id).await? else {
            self.storage
                .write_abuse_record(
                    user_id,
                    AbuseRecord {
                        strike_count: 1,
                        last_strike: now,
                        banned_until: None,
                    },
                )
                .await?;
            return Ok(AbuseDecision::admit());
        };

        // A standing ban wins over everything and is not extended by activity.
        if let Some(until) = rec.banned_until {
            if now < until {
                return Ok(AbuseDecision::block(until));
            }
        }

        if let (Some(grace), Some(until)) = (self.policy.post_ban_grace, rec.banned_until) {
            if elapsed_between(until, now) < grace {
                rec.strike_count = 1;
                rec.last_strike = now;
                self.storage.write_abuse_record(user_id, rec).await?;
                return Ok(AbuseDecision::admit());
            }
        }

        if elapsed_between(rec.last_strike, now) < self.policy.burst_window {
            rec.strike_count = rec.strike_count.saturating_add(1);
            rec.last_strike = now;

            if rec.strike_count >= self.policy.threshold {
                let until = add_duration(now, self.policy.ban_duration);
                rec.banned_until = Some(until);
                self.storage.write_abuse_record(user_id, rec).await?;
                tracing::warn!(
                    user_id = user_id.0,
                    strikes = rec.strike_count,
                    banned_until = %until,
                    "abuse threshold reached, temporary ban"
                );
                return Ok(AbuseDecision::block(until));
            }

            self.storage.write_abuse_record(user_id, rec).await?;
            return Ok(AbuseDecision::admit());
        }

        rec.strike_count = 1;
        rec.last_strike = now;
        self.storage.write_abuse_record(user_id, rec).await?;
        Ok(AbuseDecision::admit())
    }
}
