//! In-memory store backend.
//!
//! Backs the test suite and the demo seed. Collections are coarse-grained
//! `RwLock`ed maps; the dispatch core's own locks provide the cross-worker
//! ordering guarantees, so plain interior mutability is enough here.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, Ordering::Relaxed},
        RwLock,
    },
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::model::{
    AbSubject, Campaign, CampaignId, CampaignStatus, Customer, CustomerId, DeliveryLog,
    DeliveryStatus, ListId, Subscriber, SubscriberId, SubscriberStatus,
};

use super::{
    CampaignStore, CustomerStore, DeliveryLogStore, DispatchFilters, SubscriberStore,
    SuppressionStore,
};

/// Demo data set loadable from a JSON file at startup. `servers` feeds the
/// delivery pool rather than the store itself.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub customers: Vec<Customer>,
    pub campaigns: Vec<Campaign>,
    pub subscribers: Vec<Subscriber>,
    pub blacklist: Vec<String>,
    pub servers: Vec<crate::model::DeliveryServer>,
}

#[derive(Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber>>,
    logs: RwLock<Vec<DeliveryLog>>,
    log_index: RwLock<HashSet<(CampaignId, SubscriberId)>>,
    customers: RwLock<HashMap<CustomerId, Customer>>,
    quota_usage: RwLock<HashMap<CustomerId, u64>>,
    global_blacklist: RwLock<HashMap<String, String>>,
    customer_blacklists: RwLock<HashMap<CustomerId, HashMap<String, String>>>,
    suppressions: RwLock<HashMap<CampaignId, HashSet<String>>>,
    group_blocks: RwLock<HashMap<String, HashSet<String>>>,
    queue_tables: RwLock<HashMap<CampaignId, Vec<SubscriberId>>>,
    complaints: RwLock<HashMap<CampaignId, usize>>,
    broken_queue_tables: RwLock<HashSet<CampaignId>>,
    next_subscriber_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.next_subscriber_id.store(1, Relaxed);
        store
    }

    pub fn seed(&self, data: SeedData) {
        for customer in data.customers {
            self.add_customer(customer);
        }
        for campaign in data.campaigns {
            self.add_campaign(campaign);
        }
        for subscriber in data.subscribers {
            self.add_subscriber(subscriber);
        }
        for email in data.blacklist {
            self.add_global_blacklist(&email, "seeded");
        }
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.campaigns.write().unwrap().insert(campaign.id, campaign);
    }

    pub fn add_customer(&self, customer: Customer) {
        self.customers.write().unwrap().insert(customer.id, customer);
    }

    pub fn add_subscriber(&self, subscriber: Subscriber) {
        let mut next = self.next_subscriber_id.load(Relaxed);
        if subscriber.id >= next {
            next = subscriber.id + 1;
            self.next_subscriber_id.store(next, Relaxed);
        }
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.id, subscriber);
    }

    pub fn add_global_blacklist(&self, email: &str, reason: &str) {
        self.global_blacklist
            .write()
            .unwrap()
            .insert(email.to_ascii_lowercase(), reason.to_string());
    }

    pub fn add_customer_blacklist(&self, customer_id: CustomerId, email: &str, reason: &str) {
        self.customer_blacklists
            .write()
            .unwrap()
            .entry(customer_id)
            .or_default()
            .insert(email.to_ascii_lowercase(), reason.to_string());
    }

    pub fn add_suppression(&self, campaign_id: CampaignId, email: &str) {
        self.suppressions
            .write()
            .unwrap()
            .entry(campaign_id)
            .or_default()
            .insert(email.to_ascii_lowercase());
    }

    pub fn add_group_block(&self, group_id: &str, email: &str) {
        self.group_blocks
            .write()
            .unwrap()
            .entry(group_id.to_string())
            .or_default()
            .insert(email.to_ascii_lowercase());
    }

    pub fn record_complaint(&self, campaign_id: CampaignId) {
        *self
            .complaints
            .write()
            .unwrap()
            .entry(campaign_id)
            .or_default() += 1;
    }

    /// Test hook: make queue-table population fail for a campaign.
    pub fn break_queue_table(&self, campaign_id: CampaignId) {
        self.broken_queue_tables.write().unwrap().insert(campaign_id);
    }

    /// Quota replenishment, normally the billing system's job.
    pub fn reset_quota_usage(&self, customer_id: CustomerId) {
        self.quota_usage.write().unwrap().remove(&customer_id);
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
        self.subscribers.read().unwrap().get(&id).cloned()
    }

    /// Pending recipient ids of a campaign at `now`: list members (or the
    /// materialized queue for queue-table campaigns) inside the time-warp
    /// window without a delivery log row.
    fn pending_ids(&self, campaign: &Campaign, now: DateTime<Utc>) -> Vec<SubscriberId> {
        let subscribers = self.subscribers.read().unwrap();
        let index = self.log_index.read().unwrap();

        let candidates: Vec<SubscriberId> = if campaign.options.use_queue_table {
            let queues = self.queue_tables.read().unwrap();
            queues.get(&campaign.id).cloned().unwrap_or_default()
        } else {
            subscribers
                .values()
                .filter(|sub| sub.list_id == campaign.list_id)
                .map(|sub| sub.id)
                .collect()
        };

        candidates
            .into_iter()
            .filter(|id| {
                subscribers
                    .get(id)
                    .map(|sub| campaign.in_timewarp_window(sub, now))
                    .unwrap_or(false)
            })
            .filter(|id| !index.contains(&(campaign.id, *id)))
            .collect()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn eligible_campaigns(
        &self,
        filters: &DispatchFilters,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Campaign>> {
        let campaigns = self.campaigns.read().unwrap();
        let mut eligible: Vec<Campaign> = campaigns
            .values()
            .filter(|c| c.status.is_sendable() && c.send_at <= now && filters.matches(c))
            .cloned()
            .collect();
        eligible.sort_by_key(|c| (c.priority, c.id));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn campaign(&self, id: CampaignId) -> anyhow::Result<Option<Campaign>> {
        Ok(self.campaigns.read().unwrap().get(&id).cloned())
    }

    async fn campaign_status(&self, id: CampaignId) -> anyhow::Result<Option<CampaignStatus>> {
        Ok(self.campaigns.read().unwrap().get(&id).map(|c| c.status))
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> anyhow::Result<bool> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        if campaign.status != from {
            return Ok(false);
        }
        if !from.can_transition(to) {
            bail!("invalid campaign transition {from} -> {to}");
        }
        campaign.status = to;
        Ok(true)
    }

    async fn set_status(&self, id: CampaignId, to: CampaignStatus) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        if !campaign.status.can_transition(to) {
            bail!("invalid campaign transition {} -> {to}", campaign.status);
        }
        campaign.status = to;
        Ok(())
    }

    async fn reset_stuck_processing(&self) -> anyhow::Result<Vec<CampaignId>> {
        let mut campaigns = self.campaigns.write().unwrap();
        let mut healed = Vec::new();
        for campaign in campaigns.values_mut() {
            if campaign.status == CampaignStatus::Processing {
                campaign.status = CampaignStatus::Sending;
                healed.push(campaign.id);
            }
        }
        Ok(healed)
    }

    async fn set_priority(&self, id: CampaignId, priority: i32) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        campaign.priority = priority;
        Ok(())
    }

    async fn bump_priority(&self, id: CampaignId, by: i32) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        campaign.priority = campaign.priority.saturating_add(by);
        Ok(())
    }

    async fn set_send_at(&self, id: CampaignId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        campaign.send_at = at;
        Ok(())
    }

    async fn set_giveup_counter(&self, id: CampaignId, value: u32) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        campaign.options.giveup_counter = value;
        Ok(())
    }

    async fn populate_queue_table(&self, id: CampaignId) -> anyhow::Result<usize> {
        if self.broken_queue_tables.read().unwrap().contains(&id) {
            bail!("queue table population failed for campaign {id}");
        }
        let campaign = self
            .campaign(id)
            .await?
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        let members: Vec<SubscriberId> = self
            .subscribers
            .read()
            .unwrap()
            .values()
            .filter(|sub| sub.list_id == campaign.list_id)
            .map(|sub| sub.id)
            .collect();
        let count = members.len();
        self.queue_tables.write().unwrap().insert(id, members);
        Ok(count)
    }

    async fn pick_ab_subject(&self, id: CampaignId) -> anyhow::Result<Option<AbSubject>> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        let variant = campaign
            .options
            .ab_subjects
            .iter_mut()
            .min_by_key(|v| v.usage_count);
        Ok(variant.map(|v| {
            v.usage_count += 1;
            v.clone()
        }))
    }

    async fn rollback_ab_subject(&self, id: CampaignId, subject_id: i64) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.write().unwrap();
        let campaign = campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("campaign {id} not found"))?;
        if let Some(variant) = campaign
            .options
            .ab_subjects
            .iter_mut()
            .find(|v| v.id == subject_id)
        {
            variant.usage_count = variant.usage_count.saturating_sub(1);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn pending_count(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<usize> {
        Ok(self.pending_ids(campaign, now).len().min(limit))
    }

    async fn load_batch(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscriber>> {
        let ids = self.pending_ids(campaign, now);
        let subscribers = self.subscribers.read().unwrap();
        Ok(ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| subscribers.get(&id).cloned())
            .collect())
    }

    async fn subscriber_status(
        &self,
        id: SubscriberId,
    ) -> anyhow::Result<Option<SubscriberStatus>> {
        Ok(self.subscribers.read().unwrap().get(&id).map(|s| s.status))
    }

    async fn update_subscriber_status(
        &self,
        id: SubscriberId,
        status: SubscriberStatus,
    ) -> anyhow::Result<()> {
        let mut subscribers = self.subscribers.write().unwrap();
        let subscriber = subscribers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("subscriber {id} not found"))?;
        subscriber.status = status;
        Ok(())
    }

    async fn insert_subscriber(&self, mut subscriber: Subscriber) -> anyhow::Result<SubscriberId> {
        let id = self.next_subscriber_id.fetch_add(1, Relaxed);
        subscriber.id = id;
        self.subscribers.write().unwrap().insert(id, subscriber);
        Ok(id)
    }

    async fn delete_subscriber(&self, id: SubscriberId) -> anyhow::Result<()> {
        self.subscribers.write().unwrap().remove(&id);
        Ok(())
    }

    async fn set_subscriber_field(
        &self,
        id: SubscriberId,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let mut subscribers = self.subscribers.write().unwrap();
        let subscriber = subscribers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("subscriber {id} not found"))?;
        subscriber.fields.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn move_to_list(&self, id: SubscriberId, list_id: ListId) -> anyhow::Result<()> {
        let mut subscribers = self.subscribers.write().unwrap();
        let subscriber = subscribers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("subscriber {id} not found"))?;
        subscriber.list_id = list_id;
        Ok(())
    }

    async fn copy_to_list(
        &self,
        id: SubscriberId,
        list_id: ListId,
    ) -> anyhow::Result<SubscriberId> {
        let copy = {
            let subscribers = self.subscribers.read().unwrap();
            let mut copy = subscribers
                .get(&id)
                .ok_or_else(|| anyhow!("subscriber {id} not found"))?
                .clone();
            copy.list_id = list_id;
            copy
        };
        self.insert_subscriber(copy).await
    }
}

#[async_trait]
impl DeliveryLogStore for MemoryStore {
    async fn insert_log(&self, log: DeliveryLog) -> anyhow::Result<()> {
        let key = (log.campaign_id, log.subscriber_id);
        {
            let mut index = self.log_index.write().unwrap();
            if !index.insert(key) {
                tracing::warn!(
                    "Subscriber {} already logged for campaign {}, dropping {} row",
                    log.subscriber_id,
                    log.campaign_id,
                    log.status
                );
                return Ok(());
            }
        }
        self.logs.write().unwrap().push(log);
        Ok(())
    }

    async fn log_exists(
        &self,
        campaign_id: CampaignId,
        subscriber_id: SubscriberId,
    ) -> anyhow::Result<bool> {
        Ok(self
            .log_index
            .read()
            .unwrap()
            .contains(&(campaign_id, subscriber_id)))
    }

    async fn count_logs(&self, campaign_id: CampaignId) -> anyhow::Result<usize> {
        Ok(self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| log.campaign_id == campaign_id)
            .count())
    }

    async fn count_logs_by_status(
        &self,
        campaign_id: CampaignId,
        status: DeliveryStatus,
    ) -> anyhow::Result<usize> {
        Ok(self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| log.campaign_id == campaign_id && log.status == status)
            .count())
    }

    async fn purge_giveups(&self, campaign_id: CampaignId) -> anyhow::Result<usize> {
        let mut logs = self.logs.write().unwrap();
        let mut index = self.log_index.write().unwrap();
        let before = logs.len();
        logs.retain(|log| {
            let purge = log.campaign_id == campaign_id && log.status == DeliveryStatus::Giveup;
            if purge {
                index.remove(&(log.campaign_id, log.subscriber_id));
            }
            !purge
        });
        Ok(before - logs.len())
    }

    async fn campaign_logs(&self, campaign_id: CampaignId) -> anyhow::Result<Vec<DeliveryLog>> {
        Ok(self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| log.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn sent_last_hour(
        &self,
        customer_id: CustomerId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let campaigns = self.campaigns.read().unwrap();
        let cutoff = now - Duration::hours(1);
        Ok(self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| {
                log.status == DeliveryStatus::Success
                    && log.created_at > cutoff
                    && campaigns
                        .get(&log.campaign_id)
                        .is_some_and(|c| c.customer_id == customer_id)
            })
            .count() as u64)
    }

    async fn bounce_rate(&self, campaign_id: CampaignId) -> anyhow::Result<f32> {
        let logs = self.logs.read().unwrap();
        let mut attempts = 0usize;
        let mut bounces = 0usize;
        for log in logs.iter().filter(|log| log.campaign_id == campaign_id) {
            match log.status {
                DeliveryStatus::Success | DeliveryStatus::Giveup => attempts += 1,
                DeliveryStatus::FatalError => {
                    attempts += 1;
                    bounces += 1;
                }
                _ => {}
            }
        }
        if attempts == 0 {
            return Ok(0.0);
        }
        Ok(bounces as f32 / attempts as f32)
    }

    async fn complaint_rate(&self, campaign_id: CampaignId) -> anyhow::Result<f32> {
        let complaints = *self
            .complaints
            .read()
            .unwrap()
            .get(&campaign_id)
            .unwrap_or(&0);
        let delivered = self
            .count_logs_by_status(campaign_id, DeliveryStatus::Success)
            .await?;
        if delivered == 0 {
            return Ok(0.0);
        }
        Ok(complaints as f32 / delivered as f32)
    }
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn customer(&self, id: CustomerId) -> anyhow::Result<Option<Customer>> {
        Ok(self.customers.read().unwrap().get(&id).cloned())
    }

    async fn quota_usage(&self, id: CustomerId) -> anyhow::Result<u64> {
        Ok(*self.quota_usage.read().unwrap().get(&id).unwrap_or(&0))
    }

    async fn increment_quota_usage(&self, id: CustomerId, by: u64) -> anyhow::Result<u64> {
        let mut usage = self.quota_usage.write().unwrap();
        let entry = usage.entry(id).or_default();
        *entry += by;
        Ok(*entry)
    }
}

#[async_trait]
impl SuppressionStore for MemoryStore {
    async fn blacklisted_reason(
        &self,
        customer_id: CustomerId,
        email: &str,
    ) -> anyhow::Result<Option<String>> {
        let email = email.to_ascii_lowercase();
        if let Some(reason) = self.global_blacklist.read().unwrap().get(&email) {
            return Ok(Some(reason.clone()));
        }
        Ok(self
            .customer_blacklists
            .read()
            .unwrap()
            .get(&customer_id)
            .and_then(|list| list.get(&email))
            .cloned())
    }

    async fn is_suppressed(&self, campaign: &Campaign, email: &str) -> anyhow::Result<bool> {
        Ok(self
            .suppressions
            .read()
            .unwrap()
            .get(&campaign.id)
            .is_some_and(|set| set.contains(&email.to_ascii_lowercase())))
    }

    async fn is_group_blocked(&self, group_id: &str, email: &str) -> anyhow::Result<bool> {
        Ok(self
            .group_blocks
            .read()
            .unwrap()
            .get(group_id)
            .is_some_and(|set| set.contains(&email.to_ascii_lowercase())))
    }
}
