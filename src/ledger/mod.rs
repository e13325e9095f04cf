use std::sync::Arc;

use crate::audit::AuditSink;
use crate::config::EngineSettings;
use crate::store::LedgerStore;

pub mod admin;
pub mod checkout;
pub mod consumption;
pub mod holds;
pub mod idempotency;
pub mod quota;
pub mod subscription;
pub mod sweeper;
pub mod wallet;
pub mod webhook;

use admin::AdminAdjustmentApi;
use checkout::PackCatalogAndCheckout;
use consumption::ConsumptionProcessor;
use holds::AuthorizationHoldManager;
use idempotency::IdempotencyGuard;
use quota::QuotaPolicyEngine;
use subscription::SubscriptionPlanEngine;
use wallet::WalletStore;
use webhook::PaymentWebhookProcessor;

/// Everything the HTTP layer needs, wired over one store and one audit sink.
/// Cheap to clone; components share the store through `Arc`.
#[derive(Clone)]
pub struct PointsEngine {
    store: Arc<dyn LedgerStore>,
    settings: EngineSettings,
    wallet: WalletStore,
    quota: QuotaPolicyEngine,
    holds: AuthorizationHoldManager,
    charges: ConsumptionProcessor,
    catalog: PackCatalogAndCheckout,
    webhooks: PaymentWebhookProcessor,
    subscriptions: SubscriptionPlanEngine,
    admin: AdminAdjustmentApi,
}

impl PointsEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        let retry = settings.retry;
        let wallet = WalletStore::new(store.clone(), retry);
        let quota = QuotaPolicyEngine::new(store.clone(), settings.default_free_cap, retry);
        let holds = AuthorizationHoldManager::new(store.clone(), retry);
        let guard =
            IdempotencyGuard::new(store.clone(), settings.idempotency_takeover_secs, retry);
        let charges = ConsumptionProcessor::new(
            quota.clone(),
            holds.clone(),
            guard,
            settings.charge_hold_ttl_secs,
        );
        let catalog = PackCatalogAndCheckout::new(store.clone(), retry);
        let webhooks =
            PaymentWebhookProcessor::new(store.clone(), settings.webhook_secret.clone(), retry);
        let subscriptions = SubscriptionPlanEngine::new(store.clone(), retry);
        let admin = AdminAdjustmentApi::new(wallet.clone(), audit);

        Self {
            store,
            settings,
            wallet,
            quota,
            holds,
            charges,
            catalog,
            webhooks,
            subscriptions,
            admin,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn wallet(&self) -> &WalletStore {
        &self.wallet
    }

    pub fn quota(&self) -> &QuotaPolicyEngine {
        &self.quota
    }

    pub fn holds(&self) -> &AuthorizationHoldManager {
        &self.holds
    }

    pub fn charges(&self) -> &ConsumptionProcessor {
        &self.charges
    }

    pub fn catalog(&self) -> &PackCatalogAndCheckout {
        &self.catalog
    }

    pub fn webhooks(&self) -> &PaymentWebhookProcessor {
        &self.webhooks
    }

    pub fn subscriptions(&self) -> &SubscriptionPlanEngine {
        &self.subscriptions
    }

    pub fn admin(&self) -> &AdminAdjustmentApi {
        &self.admin
    }
}
