//! Campaign dispatch engine.
//!
//! One `run_cycle` call is one dispatch pass: scan eligible campaigns,
//! admit them against customer quotas, fan out workers, send, then settle
//! every campaign's status. An external scheduler invokes it on a fixed
//! interval; the lock layer makes overlapping invocations harmless.

pub mod batch;
pub mod completion;
pub mod dispatcher;
pub mod guard;
pub mod precheck;
pub mod scanner;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    content::ContentRenderer,
    engine_config::EngineConfig,
    error::{EngineError, EngineResult},
    observability::{CycleSummary, CycleTracker},
    rate::SendPacer,
    servers::ServerPool,
    store::Store,
    sync::{EphemeralCache, LockRegistry},
    transport::DeliveryTransport,
};

pub use crate::store::DispatchFilters;
pub use guard::ActiveSet;

/// Everything a dispatch worker needs, cheap to clone across tasks.
#[derive(Clone)]
pub struct EngineState {
    pub store: Arc<dyn Store>,
    pub cache: EphemeralCache,
    pub locks: LockRegistry,
    pub pool: Arc<ServerPool>,
    pub renderer: Arc<dyn ContentRenderer>,
    pub transport: Arc<dyn DeliveryTransport>,
    pub pacer: SendPacer,
    pub settings: Arc<EngineConfig>,
    pub tracker: CycleTracker,
}

impl EngineState {
    pub fn step_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.locks.step_ttl_secs)
    }

    pub fn step_wait(&self) -> Duration {
        Duration::from_millis(self.settings.locks.step_wait_ms)
    }

    pub fn campaign_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.locks.campaign_ttl_secs)
    }
}

#[derive(Clone)]
pub struct DispatchEngine {
    state: EngineState,
    shutdown: CancellationToken,
    active: ActiveSet,
}

impl DispatchEngine {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            shutdown: CancellationToken::new(),
            active: ActiveSet::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// One dispatch pass. Holding the run lock for the whole pass keeps a
    /// second concurrent invocation down to a clean no-op.
    pub async fn run_cycle(&self, filters: &DispatchFilters) -> EngineResult<CycleSummary> {
        let _run_lock = self
            .state
            .locks
            .acquire(
                "dispatch:run",
                Duration::from_secs(self.state.settings.locks.run_ttl_secs),
            )
            .ok_or(EngineError::RunLockBusy)?;

        self.state.tracker.reset();
        let now = Utc::now();
        let in_flight = self.active.lock().unwrap().len();

        let campaigns = scanner::eligible_campaigns(&self.state, filters, now, in_flight)
            .await
            .map_err(EngineError::from)?;
        self.state.tracker.record_scanned(campaigns.len());

        if campaigns.is_empty() {
            tracing::info!("No campaigns eligible for sending");
            return Ok(self.state.tracker.summary());
        }
        tracing::info!("Picked up {} campaigns for dispatch", campaigns.len());

        let admitted = precheck::admit(&self.state, campaigns, now).await;
        self.state.tracker.record_admitted(admitted.len());

        dispatcher::run(&self.state, admitted, &self.active, &self.shutdown).await;

        // run-scoped shared state dies with the run
        self.state.cache.delete_prefix("send-group:");
        self.state.cache.delete_prefix("allowance:");
        self.state.cache.prune_expired();

        let summary = self.state.tracker.summary();
        tracing::info!("{}", self.state.tracker.status_line());
        Ok(summary)
    }

    /// Cancel in-flight workers and restore every claimed campaign to a
    /// resumable status. Runs on signal-driven shutdown and must complete
    /// even mid-send.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let claimed: Vec<_> = self.active.lock().unwrap().iter().copied().collect();
        for id in claimed {
            guard::restore_processing(&self.state, id).await;
        }
        let flushed = self.state.cache.delete_prefix("send-group:");
        if flushed > 0 {
            tracing::info!("Flushed {flushed} send-group dedup keys on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CampaignStatus, DeliveryStatus, DomainPolicy};
    use crate::store::{CampaignStore, CustomerStore, DeliveryLogStore};
    use crate::testing::{
        confirmed_subscriber, engine, engine_state, sample_campaign, sample_customer,
        sample_server,
    };
    use crate::transport::mock::MockBehavior;

    /// Scenario: 10 subscribers, unbounded quota, one cycle delivers all and
    /// finalizes.
    #[tokio::test]
    async fn test_e2e_single_cycle_sends_everything() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=10 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@d{}.com", i % 3)));
        }

        let summary = engine.run_cycle(&DispatchFilters::default()).await.unwrap();

        assert_eq!(summary.sent, 10);
        assert_eq!(transport.calls(), 10);
        assert_eq!(
            store.count_logs_by_status(1, DeliveryStatus::Success).await.unwrap(),
            10
        );
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
    }

    /// Scenario: 100 subscribers against a 30-send quota, replenished
    /// between cycles, drains in 30/30/30/10 steps.
    #[tokio::test]
    async fn test_e2e_quota_bounded_cycles() {
        let (engine, store, _transport) = engine(vec![sample_server(1)]);
        let mut customer = sample_customer();
        customer.sending_quota = Some(30);
        store.add_customer(customer);
        store.add_campaign(sample_campaign());
        for i in 1..=100 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@d{}.com", i % 4)));
        }

        let summary = engine.run_cycle(&DispatchFilters::default()).await.unwrap();
        assert_eq!(summary.sent, 30);
        assert_eq!(store.count_logs(1).await.unwrap(), 30);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );

        for expected in [60, 90, 100] {
            store.reset_quota_usage(1);
            engine.run_cycle(&DispatchFilters::default()).await.unwrap();
            assert_eq!(store.count_logs(1).await.unwrap(), expected);
        }
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
        // every recipient got exactly one terminal row
        assert_eq!(
            store.count_logs_by_status(1, DeliveryStatus::Success).await.unwrap(),
            100
        );
    }

    /// Scenario: two campaigns in one send group targeting the same address
    /// produce exactly one transport call.
    #[tokio::test]
    async fn test_e2e_send_group_dedup() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());

        let mut first = sample_campaign();
        first.group_id = Some("g1".into());
        store.add_campaign(first);
        let mut second = sample_campaign();
        second.id = 2;
        second.list_id = 2;
        second.group_id = Some("g1".into());
        store.add_campaign(second);

        store.add_subscriber(confirmed_subscriber(1, 1, "a@x.com"));
        store.add_subscriber(confirmed_subscriber(2, 2, "a@x.com"));

        engine.run_cycle(&DispatchFilters::default()).await.unwrap();

        assert_eq!(transport.calls(), 1);
        let success_one = store
            .count_logs_by_status(1, DeliveryStatus::Success)
            .await
            .unwrap();
        let success_two = store
            .count_logs_by_status(2, DeliveryStatus::Success)
            .await
            .unwrap();
        assert_eq!(success_one + success_two, 1);
        let handled_one = store
            .count_logs_by_status(1, DeliveryStatus::HandledByOtherSendGroupCampaign)
            .await
            .unwrap();
        let handled_two = store
            .count_logs_by_status(2, DeliveryStatus::HandledByOtherSendGroupCampaign)
            .await
            .unwrap();
        assert_eq!(handled_one + handled_two, 1);
    }

    /// Scenario: a domain-policy-rejected recipient ends as
    /// `domain_policy_reject` without affecting anyone else.
    #[tokio::test]
    async fn test_e2e_domain_policy_reject() {
        let mut server = sample_server(1);
        server.domain_policy = DomainPolicy::Deny(vec!["blocked-domain.com".into()]);
        let (engine, store, transport) = engine(vec![server]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        store.add_subscriber(confirmed_subscriber(1, 1, "ok@fine.com"));
        store.add_subscriber(confirmed_subscriber(2, 1, "b@blocked-domain.com"));

        engine.run_cycle(&DispatchFilters::default()).await.unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(
            store.count_logs_by_status(1, DeliveryStatus::Success).await.unwrap(),
            1
        );
        assert_eq!(
            store
                .count_logs_by_status(1, DeliveryStatus::DomainPolicyReject)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
    }

    /// Scenario: provider outage with no alternate server leaves the
    /// campaign resumable with zero successes.
    #[tokio::test]
    async fn test_e2e_provider_outage() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        transport.set_server_behavior(1, MockBehavior::Unreachable);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=5 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        engine.run_cycle(&DispatchFilters::default()).await.unwrap();

        assert_eq!(
            store.count_logs_by_status(1, DeliveryStatus::Success).await.unwrap(),
            0
        );
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    /// Property: concurrent invocations with identical filters do the work
    /// at most once.
    #[tokio::test]
    async fn test_concurrent_invocations_run_lock() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=10 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        let other = engine.clone();
        let filters = DispatchFilters::default();
        let (a, b) = tokio::join!(engine.run_cycle(&filters), other.run_cycle(&filters));

        let busy = matches!(a, Err(EngineError::RunLockBusy)) as usize
            + matches!(b, Err(EngineError::RunLockBusy)) as usize;
        assert_eq!(busy, 1, "exactly one invocation should observe the run lock");
        assert_eq!(transport.calls(), 10);
        assert_eq!(store.count_logs(1).await.unwrap(), 10);
    }

    /// Property: an immediate re-run sends nothing new.
    #[tokio::test]
    async fn test_idempotent_rerun() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=6 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        engine.run_cycle(&DispatchFilters::default()).await.unwrap();
        assert_eq!(transport.calls(), 6);

        let summary = engine.run_cycle(&DispatchFilters::default()).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(transport.calls(), 6);
        assert_eq!(store.count_logs(1).await.unwrap(), 6);
    }

    /// Property: quota usage tallies match deliveries.
    #[tokio::test]
    async fn test_quota_usage_tallied() {
        let (engine, store, _transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=4 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        engine.run_cycle(&DispatchFilters::default()).await.unwrap();
        assert_eq!(store.quota_usage(1).await.unwrap(), 4);
    }

    /// Crash recovery: shutdown restores claimed campaigns and flushes
    /// dedup keys.
    #[tokio::test]
    async fn test_shutdown_restores_claimed_campaigns() {
        let (engine, store, _transport) = engine_with_state();
        let mut campaign = sample_campaign();
        campaign.status = CampaignStatus::Processing;
        store.add_campaign(campaign);
        engine.active.lock().unwrap().insert(1);
        engine
            .state
            .cache
            .set("send-group:g1:a@x.com", serde_json::json!(1), None);

        engine.shutdown().await;

        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
        assert!(engine.state.cache.get("send-group:g1:a@x.com").is_none());
        assert!(engine.shutdown.is_cancelled());
    }

    fn engine_with_state() -> (
        DispatchEngine,
        Arc<crate::store::MemoryStore>,
        Arc<crate::transport::mock::MockTransport>,
    ) {
        let (state, store, transport) = engine_state(vec![sample_server(1)]);
        (DispatchEngine::new(state), store, transport)
    }

    /// Filters narrow the cycle to matching campaigns only.
    #[tokio::test]
    async fn test_filters_scope_the_cycle() {
        let (engine, store, transport) = engine(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        let mut other = sample_campaign();
        other.id = 2;
        other.list_id = 2;
        store.add_campaign(other);
        store.add_subscriber(confirmed_subscriber(1, 1, "a@x.com"));
        store.add_subscriber(confirmed_subscriber(2, 2, "b@x.com"));

        let filters = DispatchFilters {
            campaign_ids: vec![1],
            ..Default::default()
        };
        engine.run_cycle(&filters).await.unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
        assert_eq!(
            store.campaign_status(2).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }
}
