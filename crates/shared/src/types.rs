//! Core domain types shared across the Botforge platform

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Plan catalog
// =============================================================================

/// Sentinel meaning "no limit" for a plan resource
pub const UNLIMITED: i64 = -1;

/// Subscription plan for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Professional,
    Business,
    Enterprise,
}

impl PlanTier {
    /// Maximum assistants for this plan
    /// Starter (1) → Professional (3) → Business (10) → Enterprise (unlimited)
    pub fn max_assistants(&self) -> i64 {
        match self {
            Self::Starter => 1,
            Self::Professional => 3,
            Self::Business => 10,
            Self::Enterprise => UNLIMITED,
        }
    }

    /// Maximum knowledgebase documents for this plan
    pub fn max_documents(&self) -> i64 {
        match self {
            Self::Starter => 25,
            Self::Professional => 200,
            Self::Business => 1_000,
            Self::Enterprise => UNLIMITED,
        }
    }

    /// Maximum crawled websites for this plan
    pub fn max_websites(&self) -> i64 {
        match self {
            Self::Starter => 3,
            Self::Professional => 10,
            Self::Business => 50,
            Self::Enterprise => UNLIMITED,
        }
    }

    /// Monthly conversation limit for this plan
    pub fn max_conversations(&self) -> i64 {
        match self {
            Self::Starter => 500,
            Self::Professional => 5_000,
            Self::Business => 25_000,
            Self::Enterprise => UNLIMITED,
        }
    }

    /// Monthly price in cents, for display purposes
    /// Enterprise is custom-priced (None)
    pub fn monthly_price_cents(&self) -> Option<i64> {
        match self {
            Self::Starter => Some(2_900),
            Self::Professional => Some(9_900),
            Self::Business => Some(29_900),
            Self::Enterprise => None,
        }
    }

    /// Whether this plan can be purchased through self-serve checkout
    /// Enterprise is sales-led only
    pub fn is_purchasable(&self) -> bool {
        !matches!(self, Self::Enterprise)
    }

    /// The full limit table for this plan
    pub fn limits(&self) -> PlanLimits {
        PlanLimits {
            assistants: self.max_assistants(),
            documents: self.max_documents(),
            websites: self.max_websites(),
            conversations: self.max_conversations(),
        }
    }

    /// Limit for a single resource kind
    pub fn limit_for(&self, resource: ResourceKind) -> i64 {
        match resource {
            ResourceKind::Assistants => self.max_assistants(),
            ResourceKind::Documents => self.max_documents(),
            ResourceKind::Websites => self.max_websites(),
            ResourceKind::Conversations => self.max_conversations(),
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starter => write!(f, "starter"),
            Self::Professional => write!(f, "professional"),
            Self::Business => write!(f, "business"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "professional" => Ok(Self::Professional),
            "business" => Ok(Self::Business),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

/// Per-plan usage limits, `UNLIMITED` (-1) meaning no cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub assistants: i64,
    pub documents: i64,
    pub websites: i64,
    pub conversations: i64,
}

impl PlanLimits {
    /// Whether a resource with `current` existing instances may grow by one.
    /// A limit of `UNLIMITED` always allows; otherwise creation is denied once
    /// `current >= limit`.
    pub fn allows(limit: i64, current: i64) -> bool {
        limit == UNLIMITED || current < limit
    }
}

/// Gated resource kinds counted against plan limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Assistants,
    Documents,
    Websites,
    Conversations,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Assistants,
        ResourceKind::Documents,
        ResourceKind::Websites,
        ResourceKind::Conversations,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assistants => write!(f, "assistants"),
            Self::Documents => write!(f, "documents"),
            Self::Websites => write!(f, "websites"),
            Self::Conversations => write!(f, "conversations"),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Subscription status for a billing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Canceled,
    PastDue,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Trial
    }
}

impl SubscriptionStatus {
    /// Terminal statuses are never reopened by payment failures; only a new
    /// subscription created through the reconciler exits them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Statuses that recover to Active on a successful payment
    pub fn is_delinquent(&self) -> bool {
        matches!(self, Self::PastDue | Self::Unpaid)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Active => write!(f, "active"),
            Self::Canceled => write!(f, "canceled"),
            Self::PastDue => write!(f, "past_due"),
            Self::Unpaid => write!(f, "unpaid"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::IncompleteExpired => write!(f, "incomplete_expired"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" | "trialing" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "past_due" => Ok(Self::PastDue),
            "unpaid" => Ok(Self::Unpaid),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// The persisted subscription record, one row per company
///
/// Mutated only by the webhook reconciler (or explicit admin action); read on
/// every gated request. All reconciler writes are absolute single-statement
/// assignments so a concurrent reader never observes a half-applied event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub company_id: Uuid,
    pub status: SubscriptionStatus,
    /// Unset while on trial
    pub plan: Option<PlanTier>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub subscription_start: Option<OffsetDateTime>,
    pub subscription_end: Option<OffsetDateTime>,
    /// Scheduled future cancellation, if any
    pub subscription_cancel_at: Option<OffsetDateTime>,
    /// A cancellation has been scheduled or finalized (distinct from
    /// `status == Canceled`)
    pub subscription_canceled: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// The expiry date relevant to access gating: the trial end while on
    /// trial, the paid period end otherwise
    pub fn relevant_expiry(&self) -> Option<OffsetDateTime> {
        match self.status {
            SubscriptionStatus::Trial => self.trial_end,
            _ => self.subscription_end,
        }
    }
}

// =============================================================================
// Companies and users
// =============================================================================

/// A company (tenant) account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// User role within a company
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    Member,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Member
    }
}

impl UserRole {
    /// Owner and Admin can change billing settings
    pub fn can_manage_billing(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }

    /// Parse a role from string (case insensitive), unknown roles default to
    /// Member
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            _ => Self::Member,
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Admin => write!(f, "admin"),
            Self::Member => write!(f, "member"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_plan_tier_round_trip() {
        for tier in [
            PlanTier::Starter,
            PlanTier::Professional,
            PlanTier::Business,
            PlanTier::Enterprise,
        ] {
            let parsed = PlanTier::from_str(&tier.to_string()).unwrap();
            assert_eq!(parsed, tier);
        }
        assert!(PlanTier::from_str("platinum").is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Paused,
        ] {
            let parsed = SubscriptionStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        // Stripe spells trials "trialing"
        assert_eq!(
            SubscriptionStatus::from_str("trialing").unwrap(),
            SubscriptionStatus::Trial
        );
    }

    #[test]
    fn test_plan_limits_table() {
        assert_eq!(PlanTier::Starter.max_assistants(), 1);
        assert_eq!(PlanTier::Business.max_documents(), 1_000);
        assert_eq!(PlanTier::Enterprise.max_conversations(), UNLIMITED);
        assert_eq!(
            PlanTier::Professional.limit_for(ResourceKind::Websites),
            10
        );
    }

    #[test]
    fn test_quota_allows_at_limit() {
        // At the limit, creation is denied
        assert!(!PlanLimits::allows(5, 5));
        assert!(PlanLimits::allows(5, 4));
        // Unlimited sentinel allows regardless of count
        assert!(PlanLimits::allows(UNLIMITED, 1_000_000));
    }

    #[test]
    fn test_purchasable_plans() {
        assert!(PlanTier::Starter.is_purchasable());
        assert!(PlanTier::Business.is_purchasable());
        assert!(!PlanTier::Enterprise.is_purchasable());
    }

    #[test]
    fn test_terminal_and_delinquent_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
        assert!(SubscriptionStatus::PastDue.is_delinquent());
        assert!(SubscriptionStatus::Unpaid.is_delinquent());
        assert!(!SubscriptionStatus::Active.is_delinquent());
    }
}
