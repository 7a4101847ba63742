use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    domain::{elapsed_between, UserId},
    storage::{RateWindow, Storage},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { reset_in: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Fixed-window admission control for expensive actions.
///
/// Windows are not aligned to the wall clock: a new window starts at the
/// first request after the previous one expired (`now - window_start >
/// window`), and its count restarts at 1.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    storage: Arc<dyn Storage>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, storage: Arc<dyn Storage>) -> Self {
        Self { policy, storage }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn check(&self, user_id: UserId) -> Result<RateDecision> {
        self.check_at(user_id, Utc::now()).await
    }

    pub async fn check_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<RateDecision> {
        let max = self.policy.max_requests;
        if !self.policy.enabled {
            return Ok(RateDecision::Allowed { remaining: max });
        }

        let fresh = RateWindow {
            count: 1,
            window_start: now,
            last_request: now,
        };

        let Some(mut window) = self.storage.read_rate_window(user_id).await? else {
            self.storage.write_rate_window(user_id, fresh).await?;
            return Ok(RateDecision::Allowed {
                remaining: max.saturating_sub(1),
            });
        };

        let elapsed = elapsed_between(window.window_start, now);
        if elapsed > self.policy.window {
            self.storage.write_rate_window(user_id, fresh).await?;
            return Ok(RateDecision::Allowed {
                remaining: max.saturating_sub(1),
            });
        }

        if window.count >= max {
            // At elapsed == window the window is still active, so the earliest
            // admissible instant is strictly later.
            let reset_in = (self.policy.window - elapsed).max(Duration::from_millis(1));
            return Ok(RateDecision::Limited { reset_in });
        }

        window.count += 1;
        window.last_request = now;
        self.storage.write_rate_window(user_id, window).await?;

        Ok(RateDecision::Allowed {
            remaining: max.saturating_sub(window.count),
        })
    }
}
