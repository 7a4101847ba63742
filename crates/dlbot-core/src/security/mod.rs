use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::UserId, Result};

pub mod abuse;
pub mod rate_limit;

pub use abuse::{AbuseDecision, AbuseDetector, AbusePolicy, BURST_WINDOW};
pub use rate_limit::{RateDecision, RateLimitPolicy, RateLimiter};

// ============== Authorization ==============

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Moderator,
    #[default]
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Broadcast,
    Stats,
    Ban,
    Unban,
    ViewLogs,
    ManageUsers,
    Download,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "moderator" => Some(Role::Moderator),
            "user" => Some(Role::User),
            _ => None,
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Role::Owner => true,
            Role::Admin => matches!(
                permission,
                Broadcast | Stats | Ban | Unban | ViewLogs | ManageUsers
            ),
            Role::Moderator => matches!(permission, Ban | Unban | ViewLogs),
            Role::User => matches!(permission, Download),
        }
    }

    fn rank(self) -> u8 {
        match self {
            Role::Owner => 3,
            Role::Admin => 2,
            Role::Moderator => 1,
            Role::User => 0,
        }
    }

    /// Strictly higher in the owner > admin > moderator > user order.
    pub fn outranks(self, other: Role) -> bool {
        self.rank() > other.rank()
    }

    /// Anyone allowed to open the admin panel.
    pub fn is_staff(self) -> bool {
        !matches!(self, Role::User)
    }
}

/// Stored role, promoted to owner for ids listed in `ADMIN_IDS`.
pub fn effective_role(user_id: UserId, stored: Option<Role>, admin_ids: &[i64]) -> Role {
    if admin_ids.contains(&user_id.0) {
        return Role::Owner;
    }
    stored.unwrap_or_default()
}

// ============== Admission Gate ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    RateLimited { reset_in: Duration },
    Banned { until: DateTime<Utc> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Rate limit first, then abuse detection. A rate-limited event does not
/// count as an abuse strike.
pub struct AdmissionGate {
    rate: RateLimiter,
    abuse: AbuseDetector,
}

impl AdmissionGate {
    pub fn new(rate: RateLimiter, abuse: AbuseDetector) -> Self {
        Self { rate, abuse }
    }

    pub fn from_policies(
        rate: RateLimitPolicy,
        abuse: AbusePolicy,
        storage: Arc<dyn crate::storage::Storage>,
    ) -> Self {
        Self::new(
            RateLimiter::new(rate, storage.clone()),
            AbuseDetector::new(abuse, storage),
        )
    }

    pub async fn check(&self, user_id: UserId) -> Result<Admission> {
        self.check_at(user_id, Utc::now()).await
    }

    pub async fn check_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Admission> {
        if let RateDecision::Limited { reset_in } = self.rate.check_at(user_id, now).await? {
            tracing::debug!(user_id = user_id.0, ?reset_in, "rate limited");
            return Ok(Admission::RateLimited { reset_in });
        }

        let abuse = self.abuse.check_at(user_id, now).await?;
        match (abuse.blocked, abuse.banned_until) {
            (true, Some(until)) => Ok(Admission::Banned { until }),
            _ => Ok(Admission::Admitted),
        }
    }
}
