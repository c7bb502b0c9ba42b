//! Grace period calculation
//!
//! Pure, clock-injected derivation of access state from a subscription record.
//! This gates revenue-affecting decisions, so it is total (no panics, no
//! fallible paths) and deterministic for fixed inputs. Callers pass `now`
//! explicitly; nothing in this module reads the system clock.

use botforge_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Days of continued access after a trial or paid period expires
pub const GRACE_PERIOD_DAYS: i64 = 3;

/// How close to expiry an active subscription starts warning
const EXPIRY_WARNING_DAYS: i64 = 3;

/// Banner urgency for the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    None,
    Info,
    Warning,
    Critical,
}

/// Structured reason codes; the presentation layer owns the copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceReason {
    TrialActive,
    TrialEndingSoon,
    TrialGracePeriod,
    TrialExpired,
    SubscriptionActive,
    SubscriptionEndingSoon,
    SubscriptionGracePeriod,
    SubscriptionExpired,
    SubscriptionCanceled,
    PaymentPastDue,
    PaymentIncomplete,
    CollectionPaused,
}

impl GraceReason {
    /// Stable wire code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::TrialActive => "TRIAL_ACTIVE",
            Self::TrialEndingSoon => "TRIAL_ENDING_SOON",
            Self::TrialGracePeriod => "TRIAL_GRACE_PERIOD",
            Self::TrialExpired => "TRIAL_EXPIRED",
            Self::SubscriptionActive => "SUBSCRIPTION_ACTIVE",
            Self::SubscriptionEndingSoon => "SUBSCRIPTION_ENDING_SOON",
            Self::SubscriptionGracePeriod => "SUBSCRIPTION_GRACE_PERIOD",
            Self::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            Self::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            Self::PaymentPastDue => "PAYMENT_PAST_DUE",
            Self::PaymentIncomplete => "PAYMENT_INCOMPLETE",
            Self::CollectionPaused => "COLLECTION_PAUSED",
        }
    }
}

/// Result of a grace period calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePeriod {
    /// The relevant expiry is in the past but within the grace window
    pub is_in_grace_period: bool,
    /// Whole days of grace left, ceiling of the remaining window, never negative
    pub days_remaining_in_grace: i64,
    /// Access to gated features must be denied
    pub should_block_access: bool,
    pub urgency: Urgency,
    /// Expiry plus the grace window; None while not expired or no expiry known
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub reason: GraceReason,
}

impl GracePeriod {
    fn allowed(urgency: Urgency, reason: GraceReason) -> Self {
        Self {
            is_in_grace_period: false,
            days_remaining_in_grace: 0,
            should_block_access: false,
            urgency,
            reason,
            grace_period_ends_at: None,
        }
    }

    fn blocked(reason: GraceReason, grace_period_ends_at: Option<OffsetDateTime>) -> Self {
        Self {
            is_in_grace_period: false,
            days_remaining_in_grace: 0,
            should_block_access: true,
            urgency: Urgency::Critical,
            reason,
            grace_period_ends_at,
        }
    }
}

/// Compute the access state for a subscription at a given instant.
///
/// The relevant expiry is `trial_end` while on trial, `subscription_end`
/// otherwise. An expiry in the past keeps access open through a grace window
/// of [`GRACE_PERIOD_DAYS`]; the window boundary is inclusive, so access is
/// blocked only strictly after `expiry + grace`. Statuses Canceled, Unpaid and
/// IncompleteExpired block immediately once no grace window is active.
pub fn compute_grace_period(
    status: SubscriptionStatus,
    trial_end: Option<OffsetDateTime>,
    subscription_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> GracePeriod {
    let on_trial = status == SubscriptionStatus::Trial;
    let expiry = if on_trial { trial_end } else { subscription_end };

    let hard_blocked_status = matches!(
        status,
        SubscriptionStatus::Canceled
            | SubscriptionStatus::Unpaid
            | SubscriptionStatus::IncompleteExpired
    );

    let expiry = match expiry {
        Some(expiry) => expiry,
        None => {
            // No expiry on record: blocked statuses have no window to grant,
            // everything else stays open until the reconciler says otherwise
            return if hard_blocked_status {
                GracePeriod::blocked(reason_for_blocked(status, on_trial), None)
            } else {
                GracePeriod::allowed(open_urgency(status), open_reason(status, on_trial))
            };
        }
    };

    if expiry > now {
        // Not expired yet; warn when an expiry is close
        let days_until_expiry = ceil_days(expiry - now);
        let ending_soon = days_until_expiry <= EXPIRY_WARNING_DAYS;
        let (urgency, reason) = if hard_blocked_status {
            // Paid-through date still ahead despite a terminal/unpaid status
            match status {
                SubscriptionStatus::Unpaid => (Urgency::Warning, GraceReason::PaymentPastDue),
                _ => (Urgency::Info, GraceReason::SubscriptionCanceled),
            }
        } else if ending_soon {
            let reason = if on_trial {
                GraceReason::TrialEndingSoon
            } else {
                GraceReason::SubscriptionEndingSoon
            };
            (Urgency::Warning, reason)
        } else {
            (open_urgency(status), open_reason(status, on_trial))
        };
        return GracePeriod::allowed(urgency, reason);
    }

    let grace_period_ends_at = expiry + Duration::days(GRACE_PERIOD_DAYS);
    let elapsed = now - expiry;

    if elapsed <= Duration::days(GRACE_PERIOD_DAYS) {
        let days_remaining = ceil_days(grace_period_ends_at - now);
        let urgency = if days_remaining == 0 {
            Urgency::Critical
        } else {
            Urgency::Warning
        };
        GracePeriod {
            is_in_grace_period: true,
            days_remaining_in_grace: days_remaining,
            should_block_access: false,
            urgency,
            reason: if on_trial {
                GraceReason::TrialGracePeriod
            } else {
                GraceReason::SubscriptionGracePeriod
            },
            grace_period_ends_at: Some(grace_period_ends_at),
        }
    } else {
        GracePeriod::blocked(
            reason_for_blocked(status, on_trial),
            Some(grace_period_ends_at),
        )
    }
}

/// Ceiling of a duration in whole days, floored at zero
fn ceil_days(remaining: Duration) -> i64 {
    let secs = remaining.whole_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + 86_399) / 86_400
}

fn open_urgency(status: SubscriptionStatus) -> Urgency {
    match status {
        SubscriptionStatus::PastDue => Urgency::Warning,
        SubscriptionStatus::Incomplete | SubscriptionStatus::Paused => Urgency::Info,
        _ => Urgency::None,
    }
}

fn open_reason(status: SubscriptionStatus, on_trial: bool) -> GraceReason {
    match status {
        SubscriptionStatus::PastDue => GraceReason::PaymentPastDue,
        SubscriptionStatus::Incomplete => GraceReason::PaymentIncomplete,
        SubscriptionStatus::Paused => GraceReason::CollectionPaused,
        _ if on_trial => GraceReason::TrialActive,
        _ => GraceReason::SubscriptionActive,
    }
}

fn reason_for_blocked(status: SubscriptionStatus, on_trial: bool) -> GraceReason {
    match status {
        SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired => {
            GraceReason::SubscriptionCanceled
        }
        _ if on_trial => GraceReason::TrialExpired,
        _ => GraceReason::SubscriptionExpired,
    }
}
