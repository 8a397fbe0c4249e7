//! Validated bucket configuration and per-key limit policy.

use crate::error::ConfigError;
use crate::tenant::TenantId;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Default burst size for AI-backed features.
pub const DEFAULT_CAPACITY: u32 = 20;
/// Default number of tokens restored per [`DEFAULT_REFILL_INTERVAL`].
pub const DEFAULT_REFILL_TOKENS: f64 = 10.0;
/// Default refill window.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(60);

/// Validated configuration for one token bucket.
///
/// The refill rate is kept as `refill_tokens` per `refill_interval` rather than
/// a pre-divided tokens-per-second figure, so rates like "10 per minute" are
/// computed without accumulated rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    capacity: u32,
    refill_tokens: f64,
    interval_nanos: u64,
}

impl BucketConfig {
    /// Create a config with validation.
    pub fn new(
        capacity: u32,
        refill_tokens: f64,
        refill_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity { provided: capacity });
        }
        if !refill_tokens.is_finite() || refill_tokens <= 0.0 {
            return Err(ConfigError::InvalidRefillTokens { provided: refill_tokens });
        }
        let interval_nanos = u64::try_from(refill_interval.as_nanos()).unwrap_or(u64::MAX);
        if interval_nanos == 0 {
            return Err(ConfigError::InvalidRefillInterval(refill_interval));
        }
        Ok(Self { capacity, refill_tokens, interval_nanos })
    }

    /// `rate` tokens restored every second.
    pub fn per_second(capacity: u32, rate: f64) -> Result<Self, ConfigError> {
        Self::new(capacity, rate, Duration::from_secs(1))
    }

    /// `tokens` restored every minute.
    pub fn per_minute(capacity: u32, tokens: f64) -> Result<Self, ConfigError> {
        Self::new(capacity, tokens, Duration::from_secs(60))
    }

    /// Maximum burst size in whole tokens.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_tokens(&self) -> f64 {
        self.refill_tokens
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    /// Steady-state replenishment rate.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_tokens * 1_000_000_000.0 / self.interval_nanos as f64
    }

    /// Tokens restored over `elapsed_nanos`.
    pub(crate) fn refill_amount(&self, elapsed_nanos: u64) -> f64 {
        elapsed_nanos as f64 * self.refill_tokens / self.interval_nanos as f64
    }

    /// Time needed to restore `missing` tokens, rounded up to the nanosecond.
    pub(crate) fn time_to_restore(&self, missing: f64) -> Duration {
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        let nanos = (missing * self.interval_nanos as f64 / self.refill_tokens).ceil();
        if nanos >= u64::MAX as f64 {
            Duration::from_nanos(u64::MAX)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Time for an empty bucket to fill completely.
    pub fn full_refill_time(&self) -> Duration {
        self.time_to_restore(f64::from(self.capacity))
    }
}

impl Default for BucketConfig {
    /// Burst of 20, refilled at 10 per minute.
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_tokens: DEFAULT_REFILL_TOKENS,
            interval_nanos: DEFAULT_REFILL_INTERVAL.as_nanos() as u64,
        }
    }
}

/// Resolves the [`BucketConfig`] for a (tenant, feature) pair.
///
/// Precedence: tenant-specific feature override, then feature override, then
/// the default.
#[derive(Debug, Clone, Default)]
pub struct LimitPolicy {
    default: BucketConfig,
    features: HashMap<String, BucketConfig>,
    tenants: HashMap<String, HashMap<String, BucketConfig>>,
}

impl LimitPolicy {
    /// Every key uses `default`.
    pub fn uniform(default: BucketConfig) -> Self {
        Self { default, features: HashMap::new(), tenants: HashMap::new() }
    }

    /// Override the config for one feature across all tenants.
    pub fn with_feature(mut self, feature: impl Into<String>, config: BucketConfig) -> Self {
        let feature = feature.into();
        if self.features.insert(feature.clone(), config).is_some() {
            warn!(target: "tenantguard::rate_limit", feature = %feature, "feature limit replaced; last override wins");
        }
        self
    }

    /// Override the config for one feature of one tenant.
    pub fn with_tenant_override(
        mut self,
        tenant_id: &TenantId,
        feature: impl Into<String>,
        config: BucketConfig,
    ) -> Self {
        let feature = feature.into();
        let per_feature = self.tenants.entry(tenant_id.as_str().to_owned()).or_default();
        if per_feature.insert(feature.clone(), config).is_some() {
            warn!(target: "tenantguard::rate_limit", tenant_id = %tenant_id, feature = %feature, "tenant limit replaced; last override wins");
        }
        self
    }

    pub fn default_config(&self) -> &BucketConfig {
        &self.default
    }

    /// Config that applies to `feature` for `tenant_id`.
    pub fn resolve(&self, tenant_id: &TenantId, feature: &str) -> &BucketConfig {
        self.tenants
            .get(tenant_id.as_str())
            .and_then(|per_feature| per_feature.get(feature))
            .or_else(|| self.features.get(feature))
            .unwrap_or(&self.default)
    }

    /// Parse a JSON policy document.
    ///
    /// ```json
    /// {
    ///   "default":  { "capacity": 20, "refill_tokens": 10, "refill_interval_ms": 60000 },
    ///   "features": { "ai_clinical_note": { "capacity": 5, "refill_tokens": 1 } },
    ///   "tenants":  { "clinic-7": { "ai_clinical_note": { "capacity": 50, "refill_tokens": 50, "refill_interval_ms": 60000 } } }
    /// }
    /// ```
    ///
    /// `refill_interval_ms` defaults to one second.
    #[cfg(feature = "config")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let doc: schema::LimitPolicyDoc =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        doc.try_into()
    }
}

#[cfg(feature = "config")]
pub mod schema {
    //! Serializable mirror of [`LimitPolicy`](super::LimitPolicy).

    use super::{BucketConfig, LimitPolicy};
    use crate::error::ConfigError;
    use crate::tenant::TenantId;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::time::Duration;

    fn one_second_ms() -> u64 {
        1_000
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct BucketConfigDoc {
        pub capacity: u32,
        pub refill_tokens: f64,
        #[serde(default = "one_second_ms")]
        pub refill_interval_ms: u64,
    }

    impl TryFrom<BucketConfigDoc> for BucketConfig {
        type Error = ConfigError;

        fn try_from(doc: BucketConfigDoc) -> Result<Self, Self::Error> {
            BucketConfig::new(
                doc.capacity,
                doc.refill_tokens,
                Duration::from_millis(doc.refill_interval_ms),
            )
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct LimitPolicyDoc {
        #[serde(default)]
        pub default: Option<BucketConfigDoc>,
        #[serde(default)]
        pub features: HashMap<String, BucketConfigDoc>,
        #[serde(default)]
        pub tenants: HashMap<String, HashMap<String, BucketConfigDoc>>,
    }

    impl TryFrom<LimitPolicyDoc> for LimitPolicy {
        type Error = ConfigError;

        fn try_from(doc: LimitPolicyDoc) -> Result<Self, Self::Error> {
            let default = match doc.default {
                Some(cfg) => cfg.try_into()?,
                None => BucketConfig::default(),
            };
            let mut policy = LimitPolicy::uniform(default);
            for (feature, cfg) in doc.features {
                policy = policy.with_feature(feature, cfg.try_into()?);
            }
            for (tenant, per_feature) in doc.tenants {
                let tenant_id =
                    TenantId::new(&tenant).map_err(|e| ConfigError::Parse(e.to_string()))?;
                for (feature, cfg) in per_feature {
                    policy = policy.with_tenant_override(&tenant_id, feature, cfg.try_into()?);
                }
            }
            Ok(policy)
        }
    }
}

/// Sizing for the keyed bucket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterOptions {
    max_buckets: usize,
    idle_ttl: Duration,
}

impl LimiterOptions {
    pub fn new(max_buckets: usize, idle_ttl: Duration) -> Result<Self, ConfigError> {
        if max_buckets == 0 {
            return Err(ConfigError::ZeroMaxBuckets);
        }
        if idle_ttl.is_zero() {
            return Err(ConfigError::ZeroIdleTtl);
        }
        Ok(Self { max_buckets, idle_ttl })
    }

    /// Soft upper bound on live buckets. Past it, an insert evicts one bucket
    /// that has refilled to capacity, or grows the table if none has.
    pub fn max_buckets(&self) -> usize {
        self.max_buckets
    }

    /// Buckets untouched for this long are dropped by [`sweep`](super::KeyedRateLimiter::sweep).
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self { max_buckets: 100_000, idle_ttl: Duration::from_secs(15 * 60) }
    }
}
