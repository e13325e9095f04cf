use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: points-models -> wallet,ledger,holds,orders

/// Cached per-user balance. The ledger is authoritative; this row is a
/// recomputable materialization of `sum(point_ledger.amount)` for the user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Grant,
    Purchase,
    Consume,
    Refund,
    AdminAdjust,
    SubscriptionGrant,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Grant => "grant",
            EntryKind::Purchase => "purchase",
            EntryKind::Consume => "consume",
            EntryKind::Refund => "refund",
            EntryKind::AdminAdjust => "admin_adjust",
            EntryKind::SubscriptionGrant => "subscription_grant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "grant" => Some(EntryKind::Grant),
            "purchase" => Some(EntryKind::Purchase),
            "consume" => Some(EntryKind::Consume),
            "refund" => Some(EntryKind::Refund),
            "admin_adjust" => Some(EntryKind::AdminAdjust),
            "subscription_grant" => Some(EntryKind::SubscriptionGrant),
            _ => None,
        }
    }
}

/// Append-only record of one balance-affecting event. Rows are never updated
/// or deleted; corrections are new entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub kind: EntryKind,
    /// Signed delta: credits positive, debits negative.
    pub amount: i64,
    pub balance_after: i64,
    pub idempotency_key: String,
    pub ref_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by callers of `WalletStore::apply_entry`.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub user_id: String,
    pub kind: EntryKind,
    pub amount: i64,
    pub idempotency_key: String,
    pub ref_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Consumed,
    Released,
    Expired,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Consumed => "consumed",
            HoldStatus::Released => "released",
            HoldStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(HoldStatus::Active),
            "consumed" => Some(HoldStatus::Consumed),
            "released" => Some(HoldStatus::Released),
            "expired" => Some(HoldStatus::Expired),
            _ => None,
        }
    }
}

/// Temporary reservation of credits. Leaves `active` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub id: Uuid,
    pub user_id: String,
    pub module: String,
    pub amount_authorized: i64,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PointPack {
    pub id: String,
    pub name: String,
    pub points: i64,
    pub price_cents: i64,
    pub currency: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Expired,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Expired => "expired",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "failed" => Some(OrderStatus::Failed),
            "expired" => Some(OrderStatus::Expired),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// `pending` is the only non-terminal status; `paid` is immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: String,
    pub pack_id: String,
    /// Price in minor units of `currency`.
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub provider_order_ref: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub monthly_points: i64,
    /// Free chargeable units per module per period for subscribers.
    pub batch_cap: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserSubscription {
    pub user_id: String,
    pub plan_id: Uuid,
    pub last_granted_period: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserSubscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(end) => end > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub user_id: String,
    pub module: String,
    pub period: String,
    pub used_count: i64,
    pub free_cap: i64,
}

/// Calendar-month key used for quota and subscription periods.
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}
