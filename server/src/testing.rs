//! Shared fixtures for the test suite.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    content::TemplateRenderer,
    dispatch::{DispatchEngine, EngineState},
    engine_config::{EngineConfig, UrlConfig},
    model::{
        Campaign, CampaignStatus, CampaignType, Customer, CustomerStatus, DeliveryOptions,
        DeliveryServer, DomainPolicy, ServerId, ServerKind, Subscriber, SubscriberStatus, UseFor,
    },
    observability::CycleTracker,
    rate::SendPacer,
    servers::ServerPool,
    store::MemoryStore,
    sync::{EphemeralCache, LockRegistry},
    transport::mock::MockTransport,
};

pub fn sample_campaign() -> Campaign {
    Campaign {
        id: 1,
        name: "spring launch".into(),
        kind: CampaignType::Regular,
        status: CampaignStatus::Sending,
        send_at: Utc::now() - chrono::Duration::minutes(1),
        priority: 0,
        customer_id: 1,
        list_id: 1,
        group_id: None,
        from_name: "Acme".into(),
        from_email: "news@acme.test".into(),
        subject: "Hello {{ fname }}".into(),
        html_template: "<p>Hi {{ fname }}</p>".into(),
        plain_template: "Hi {{ fname }}".into(),
        options: DeliveryOptions::default(),
    }
}

pub fn sample_customer() -> Customer {
    Customer {
        id: 1,
        name: "acme".into(),
        status: CustomerStatus::Active,
        sending_quota: None,
        hourly_quota: None,
        subscribers_at_once: None,
        keep_usage_on_giveup: false,
        notify_on_campaign_sent: None,
    }
}

pub fn confirmed_subscriber(id: i64, list_id: i64, email: &str) -> Subscriber {
    Subscriber {
        id,
        list_id,
        email: email.into(),
        status: SubscriberStatus::Confirmed,
        fields: Default::default(),
        subscribed_at: Utc::now() - chrono::Duration::hours(1),
    }
}

pub fn sample_server(id: ServerId) -> DeliveryServer {
    DeliveryServer {
        id,
        name: format!("server-{id}"),
        kind: ServerKind::Smtp,
        use_for: UseFor::All,
        daily_quota: None,
        pause_after_send_ms: 0,
        domain_policy: DomainPolicy::AllowAll,
        host: "smtp.test".into(),
        port: 587,
        username: None,
        password: None,
        api_url: None,
        api_key: None,
    }
}

fn test_settings() -> EngineConfig {
    let mut settings = EngineConfig::default();
    settings.locks.step_wait_ms = 250;
    settings
}

/// A fully wired engine state over `MemoryStore` and `MockTransport`.
pub fn engine_state(
    servers: Vec<DeliveryServer>,
) -> (EngineState, Arc<MemoryStore>, Arc<MockTransport>) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MockTransport::new());
    let cache = EphemeralCache::new();
    let locks = LockRegistry::new();
    let settings = Arc::new(test_settings());
    let pool = Arc::new(ServerPool::new(
        servers,
        cache.clone(),
        locks.clone(),
        Duration::from_secs(settings.locks.step_ttl_secs),
        Duration::from_millis(settings.locks.step_wait_ms),
    ));

    let state = EngineState {
        store: store.clone(),
        cache,
        locks,
        pool,
        renderer: Arc::new(TemplateRenderer::new(UrlConfig::default())),
        transport: transport.clone(),
        pacer: SendPacer::new(10_000, Duration::from_millis(10), 1_000),
        settings,
        tracker: CycleTracker::new(),
    };

    (state, store, transport)
}

pub fn engine(
    servers: Vec<DeliveryServer>,
) -> (DispatchEngine, Arc<MemoryStore>, Arc<MockTransport>) {
    let (state, store, transport) = engine_state(servers);
    (DispatchEngine::new(state), store, transport)
}
