//! Access gating for subscription state and plan quotas
//!
//! The guard answers two independent questions before a gated feature runs:
//! is the subscription in a state that permits access at all (time-based
//! gating through the grace calculator), and does the plan's quota leave room
//! for one more of the requested resource.

use botforge_shared::{PlanLimits, PlanTier, ResourceKind, Subscription, SubscriptionStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::grace::{compute_grace_period, GracePeriod, GraceReason, Urgency};

/// Plan whose limits apply while a company is on trial (no plan chosen yet)
pub const TRIAL_LIMITS_PLAN: PlanTier = PlanTier::Professional;

/// Outcome of the time-based access check
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub status: SubscriptionStatus,
    pub plan: Option<PlanTier>,
    pub grace: GracePeriod,
}

/// Outcome of a quota check for one resource kind
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaStatus {
    pub resource: ResourceKind,
    /// -1 means unlimited
    pub limit: i64,
    pub current: i64,
    pub allowed: bool,
}

/// Access guard evaluating subscription state and quotas per request
pub struct AccessGuard {
    pool: PgPool,
}

impl AccessGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pure decision from a record and an instant. A company without any
    /// subscription record is treated as expired, not as an error.
    pub fn evaluate(record: Option<&Subscription>, now: OffsetDateTime) -> AccessDecision {
        match record {
            Some(sub) => {
                let grace = compute_grace_period(
                    sub.status,
                    sub.trial_end,
                    sub.subscription_end,
                    now,
                );
                AccessDecision {
                    allowed: !grace.should_block_access,
                    status: sub.status,
                    plan: sub.plan,
                    grace,
                }
            }
            None => AccessDecision {
                allowed: false,
                status: SubscriptionStatus::Canceled,
                plan: None,
                grace: GracePeriod {
                    is_in_grace_period: false,
                    days_remaining_in_grace: 0,
                    should_block_access: true,
                    urgency: Urgency::Critical,
                    grace_period_ends_at: None,
                    reason: GraceReason::SubscriptionExpired,
                },
            },
        }
    }

    /// Load the record and evaluate it at `now`
    pub async fn access_decision(
        &self,
        company_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<AccessDecision> {
        let record: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT company_id, status, plan, trial_start, trial_end,
                   subscription_start, subscription_end, subscription_cancel_at,
                   subscription_canceled, stripe_customer_id, stripe_subscription_id,
                   created_at, updated_at
            FROM subscriptions
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(Self::evaluate(record.as_ref(), now))
    }

    /// Check whether one more instance of `resource` fits the company's plan
    pub async fn check_resource_quota(
        &self,
        company_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<QuotaStatus> {
        let plan: Option<(Option<PlanTier>,)> =
            sqlx::query_as("SELECT plan FROM subscriptions WHERE company_id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;

        let plan = match plan {
            Some((plan,)) => effective_plan(plan),
            None => {
                return Err(BillingError::SubscriptionNotFound(company_id.to_string()))
            }
        };

        let limit = plan.limit_for(resource);
        let current = self.count_resource(company_id, resource).await?;

        Ok(QuotaStatus {
            resource,
            limit,
            current,
            allowed: PlanLimits::allows(limit, current),
        })
    }

    /// Quota status for every gated resource, as served by the usage endpoint
    pub async fn usage_summary(&self, company_id: Uuid) -> BillingResult<Vec<QuotaStatus>> {
        let mut statuses = Vec::with_capacity(ResourceKind::ALL.len());
        for resource in ResourceKind::ALL {
            statuses.push(self.check_resource_quota(company_id, resource).await?);
        }
        Ok(statuses)
    }

    /// Current count for a resource. Conversations are a monthly quota, so
    /// only the current calendar month counts against the limit.
    async fn count_resource(
        &self,
        company_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<i64> {
        let query = match resource {
            ResourceKind::Assistants => {
                "SELECT COUNT(*) FROM assistants WHERE company_id = $1"
            }
            ResourceKind::Documents => {
                "SELECT COUNT(*) FROM documents WHERE company_id = $1"
            }
            ResourceKind::Websites => "SELECT COUNT(*) FROM websites WHERE company_id = $1",
            ResourceKind::Conversations => {
                "SELECT COUNT(*) FROM conversations \
                 WHERE company_id = $1 AND created_at >= date_trunc('month', NOW())"
            }
        };

        let count: (i64,) = sqlx::query_as(query)
            .bind(company_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}

/// The plan whose limits govern quota checks. Trials (and records that lost
/// their plan) run with the trial plan's limits.
pub fn effective_plan(plan: Option<PlanTier>) -> PlanTier {
    plan.unwrap_or(TRIAL_LIMITS_PLAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(
        status: SubscriptionStatus,
        trial_end: Option<OffsetDateTime>,
        subscription_end: Option<OffsetDateTime>,
    ) -> Subscription {
        Subscription {
            company_id: Uuid::new_v4(),
            status,
            plan: None,
            trial_start: None,
            trial_end,
            subscription_start: None,
            subscription_end,
            subscription_cancel_at: None,
            subscription_canceled: false,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: datetime!(2024-01-01 00:00 UTC),
            updated_at: datetime!(2024-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_missing_record_is_denied() {
        let decision = AccessGuard::evaluate(None, datetime!(2024-03-15 10:00 UTC));
        assert!(!decision.allowed);
        assert!(decision.grace.should_block_access);
        assert_eq!(decision.grace.reason, GraceReason::SubscriptionExpired);
    }

    #[test]
    fn test_active_record_is_allowed() {
        let sub = record(
            SubscriptionStatus::Active,
            None,
            Some(datetime!(2024-06-01 00:00 UTC)),
        );
        let decision = AccessGuard::evaluate(Some(&sub), datetime!(2024-03-15 10:00 UTC));
        assert!(decision.allowed);
        assert!(!decision.grace.is_in_grace_period);
    }

    #[test]
    fn test_trial_in_grace_is_allowed_with_metadata() {
        let sub = record(
            SubscriptionStatus::Trial,
            Some(datetime!(2024-01-31 23:59:59 UTC)),
            None,
        );
        let decision = AccessGuard::evaluate(Some(&sub), datetime!(2024-02-02 12:00 UTC));
        assert!(decision.allowed);
        assert!(decision.grace.is_in_grace_period);
        assert_eq!(decision.grace.days_remaining_in_grace, 2);
        assert_eq!(decision.grace.urgency, Urgency::Warning);
    }

    #[test]
    fn test_expired_trial_is_denied() {
        let sub = record(
            SubscriptionStatus::Trial,
            Some(datetime!(2024-01-31 23:59:59 UTC)),
            None,
        );
        let decision = AccessGuard::evaluate(Some(&sub), datetime!(2024-02-10 12:00 UTC));
        assert!(!decision.allowed);
        assert_eq!(decision.grace.reason, GraceReason::TrialExpired);
    }

    #[test]
    fn test_effective_plan_defaults_to_trial_plan() {
        assert_eq!(effective_plan(None), TRIAL_LIMITS_PLAN);
        assert_eq!(effective_plan(Some(PlanTier::Starter)), PlanTier::Starter);
    }
}
