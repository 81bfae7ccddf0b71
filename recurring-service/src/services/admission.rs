//! Plan-tier admission checks consulted before generating.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::services::memory::InMemoryStore;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::usage_period;

/// Answers whether a tenant may use recurring invoices and create another invoice.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn can_use_recurring(&self, tenant_id: Uuid) -> Result<bool, AppError>;

    /// `today` selects the usage period the quota applies to.
    async fn can_create_invoice(&self, tenant_id: Uuid, today: NaiveDate) -> Result<bool, AppError>;

    /// Invoices the tenant may create per period; `None` is unlimited.
    ///
    /// Stores enforce it again when committing, so concurrent generations for
    /// one tenant cannot overshoot it.
    async fn invoice_limit(&self, tenant_id: Uuid) -> Result<Option<i32>, AppError>;
}

/// Capabilities of a tenant's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantPolicy {
    pub recurring_enabled: bool,
    /// Invoices per calendar month; `None` is unlimited.
    pub monthly_invoice_limit: Option<i32>,
}

impl TenantPolicy {
    /// Free tier: no recurring invoices, no quota.
    pub const FREE: TenantPolicy = TenantPolicy {
        recurring_enabled: false,
        monthly_invoice_limit: None,
    };

    pub const UNLIMITED: TenantPolicy = TenantPolicy {
        recurring_enabled: true,
        monthly_invoice_limit: None,
    };

    pub fn allows_another(&self, used: i32) -> bool {
        self.monthly_invoice_limit.is_none_or(|limit| used < limit)
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    recurring_enabled: bool,
    monthly_invoice_limit: Option<i32>,
}

/// Gate backed by `tenant_plans` and `tenant_invoice_usage`.
///
/// Tenants without a plan row get [`TenantPolicy::FREE`].
#[derive(Clone)]
pub struct PlanAdmissionGate {
    pool: PgPool,
}

impl PlanAdmissionGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn policy(&self, tenant_id: Uuid) -> Result<TenantPolicy, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_tenant_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT recurring_enabled, monthly_invoice_limit
            FROM tenant_plans
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get tenant plan: {}", e)))?;

        timer.observe_duration();

        Ok(row.map_or(TenantPolicy::FREE, |row| TenantPolicy {
            recurring_enabled: row.recurring_enabled,
            monthly_invoice_limit: row.monthly_invoice_limit,
        }))
    }
}

#[async_trait]
impl AdmissionGate for PlanAdmissionGate {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn can_use_recurring(&self, tenant_id: Uuid) -> Result<bool, AppError> {
        Ok(self.policy(tenant_id).await?.recurring_enabled)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn can_create_invoice(&self, tenant_id: Uuid, today: NaiveDate) -> Result<bool, AppError> {
        let policy = self.policy(tenant_id).await?;
        if policy.monthly_invoice_limit.is_none() {
            return Ok(true);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period_usage"])
            .start_timer();

        let used = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT invoice_count
            FROM tenant_invoice_usage
            WHERE tenant_id = $1 AND period_start = $2
            "#,
        )
        .bind(tenant_id)
        .bind(usage_period(today))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get usage: {}", e)))?
        .unwrap_or(0);

        timer.observe_duration();

        Ok(policy.allows_another(used))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn invoice_limit(&self, tenant_id: Uuid) -> Result<Option<i32>, AppError> {
        Ok(self.policy(tenant_id).await?.monthly_invoice_limit)
    }
}

/// Gate with per-tenant policies held in memory.
///
/// Quotas are enforced against an [`InMemoryStore`]'s period counters when one
/// is attached; otherwise only the recurring capability is checked.
pub struct StaticAdmissionGate {
    default_policy: TenantPolicy,
    policies: DashMap<Uuid, TenantPolicy>,
    usage: Option<Arc<InMemoryStore>>,
}

impl StaticAdmissionGate {
    pub fn new(default_policy: TenantPolicy) -> Self {
        Self {
            default_policy,
            policies: DashMap::new(),
            usage: None,
        }
    }

    /// Every tenant may use recurring invoices without a quota.
    pub fn allow_all() -> Self {
        Self::new(TenantPolicy::UNLIMITED)
    }

    pub fn with_usage(mut self, store: Arc<InMemoryStore>) -> Self {
        self.usage = Some(store);
        self
    }

    pub fn set_policy(&self, tenant_id: Uuid, policy: TenantPolicy) {
        self.policies.insert(tenant_id, policy);
    }

    fn policy(&self, tenant_id: Uuid) -> TenantPolicy {
        self.policies
            .get(&tenant_id)
            .map(|p| *p)
            .unwrap_or(self.default_policy)
    }
}

#[async_trait]
impl AdmissionGate for StaticAdmissionGate {
    async fn can_use_recurring(&self, tenant_id: Uuid) -> Result<bool, AppError> {
        Ok(self.policy(tenant_id).recurring_enabled)
    }

    async fn can_create_invoice(&self, tenant_id: Uuid, today: NaiveDate) -> Result<bool, AppError> {
        let policy = self.policy(tenant_id);
        let used = match &self.usage {
            Some(store) => store.period_invoice_count(tenant_id, today).await,
            None => 0,
        };
        Ok(policy.allows_another(used))
    }

    async fn invoice_limit(&self, tenant_id: Uuid) -> Result<Option<i32>, AppError> {
        Ok(self.policy(tenant_id).monthly_invoice_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn limit_is_exclusive() {
        let policy = TenantPolicy {
            recurring_enabled: true,
            monthly_invoice_limit: Some(2),
        };
        assert!(policy.allows_another(1));
        assert!(!policy.allows_another(2));
        assert!(TenantPolicy::FREE.allows_another(10_000));
    }

    #[tokio::test]
    async fn per_tenant_policy_overrides_default() {
        let gate = StaticAdmissionGate::allow_all();
        let downgraded = Uuid::new_v4();
        gate.set_policy(downgraded, TenantPolicy::FREE);

        assert!(gate.can_use_recurring(Uuid::new_v4()).await.unwrap());
        assert!(!gate.can_use_recurring(downgraded).await.unwrap());
    }

    #[tokio::test]
    async fn quota_without_usage_source_only_blocks_zero_limits() {
        let gate = StaticAdmissionGate::allow_all();
        let tenant = Uuid::new_v4();
        gate.set_policy(
            tenant,
            TenantPolicy {
                recurring_enabled: true,
                monthly_invoice_limit: Some(0),
            },
        );

        assert!(!gate.can_create_invoice(tenant, today()).await.unwrap());
        assert!(gate.can_create_invoice(Uuid::new_v4(), today()).await.unwrap());
    }

    #[tokio::test]
    async fn invoice_limit_follows_policy() {
        let gate = StaticAdmissionGate::allow_all();
        let limited = Uuid::new_v4();
        gate.set_policy(
            limited,
            TenantPolicy {
                recurring_enabled: true,
                monthly_invoice_limit: Some(3),
            },
        );

        assert_eq!(gate.invoice_limit(limited).await.unwrap(), Some(3));
        assert_eq!(gate.invoice_limit(Uuid::new_v4()).await.unwrap(), None);
    }
}
