use once_cell::sync::Lazy;

use crate::store::retry::RetryPolicy;

/// Shared secret used to verify payment-provider webhook signatures. Must be
/// set via the `PAYMENT_WEBHOOK_SECRET` env variable.
pub static PAYMENT_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("PAYMENT_WEBHOOK_SECRET").expect("PAYMENT_WEBHOOK_SECRET must be set")
});

/// Token presented by the admin dashboard in `x-admin-token`. When unset,
/// admin endpoints fail closed.
pub static ADMIN_API_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("ADMIN_API_TOKEN"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even
/// if database migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: points-config -> free units per (user, module) per month without a plan
pub static FREE_QUOTA_PER_MODULE: Lazy<i64> = Lazy::new(|| {
    std::env::var("FREE_QUOTA_PER_MODULE")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(10)
});

/// key: points-config -> ttl of the internal hold taken by `charge`
pub static CHARGE_HOLD_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("CHARGE_HOLD_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// key: points-config -> pending orders older than this are swept to expired
pub static ORDER_PENDING_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("ORDER_PENDING_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1800)
});

/// key: points-config -> sweep cadence; advisory only, never load-bearing
pub static SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// key: points-config -> age after which a pending idempotency placeholder is
/// treated as abandoned and taken over
pub static IDEMPOTENCY_TAKEOVER_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("IDEMPOTENCY_TAKEOVER_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

pub static STORE_RETRY_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("STORE_RETRY_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

pub static STORE_RETRY_BASE_DELAY_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("STORE_RETRY_BASE_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(50)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Explicit settings handle passed into every engine constructor. Components
/// never read the process environment themselves.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub webhook_secret: String,
    pub admin_token: Option<String>,
    pub default_free_cap: i64,
    pub charge_hold_ttl_secs: i64,
    pub order_pending_ttl_secs: i64,
    pub idempotency_takeover_secs: i64,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            webhook_secret: PAYMENT_WEBHOOK_SECRET.clone(),
            admin_token: ADMIN_API_TOKEN.clone(),
            default_free_cap: *FREE_QUOTA_PER_MODULE,
            charge_hold_ttl_secs: *CHARGE_HOLD_TTL_SECS,
            order_pending_ttl_secs: *ORDER_PENDING_TTL_SECS,
            idempotency_takeover_secs: *IDEMPOTENCY_TAKEOVER_SECS,
            retry: RetryPolicy {
                max_attempts: *STORE_RETRY_MAX_ATTEMPTS,
                base_delay: std::time::Duration::from_millis(*STORE_RETRY_BASE_DELAY_MS),
            },
        }
    }
}
