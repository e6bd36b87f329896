//! Collaborator store contracts.
//!
//! The engine never talks to a concrete database; campaigns, subscribers,
//! delivery logs, customers and suppression data are reached through these
//! traits. `MemoryStore` implements all of them for tests and the bundled
//! demo seed.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    AbSubject, Campaign, CampaignId, CampaignStatus, CampaignType, Customer, CustomerId,
    DeliveryLog, DeliveryStatus, ListId, Subscriber, SubscriberId, SubscriberStatus,
};

pub use memory::MemoryStore;

/// Include/exclude sets narrowing one dispatch invocation.
#[derive(Debug, Clone, Default)]
pub struct DispatchFilters {
    pub kind: Option<CampaignType>,
    pub customer_ids: Vec<CustomerId>,
    pub exclude_customer_ids: Vec<CustomerId>,
    pub campaign_ids: Vec<CampaignId>,
    pub exclude_campaign_ids: Vec<CampaignId>,
    pub list_ids: Vec<ListId>,
    pub exclude_list_ids: Vec<ListId>,
}

impl DispatchFilters {
    pub fn matches(&self, campaign: &Campaign) -> bool {
        if let Some(kind) = self.kind {
            if campaign.kind != kind {
                return false;
            }
        }
        let included = |ids: &[i64], id: i64| ids.is_empty() || ids.contains(&id);
        included(&self.customer_ids, campaign.customer_id)
            && !self.exclude_customer_ids.contains(&campaign.customer_id)
            && included(&self.campaign_ids, campaign.id)
            && !self.exclude_campaign_ids.contains(&campaign.id)
            && included(&self.list_ids, campaign.list_id)
            && !self.exclude_list_ids.contains(&campaign.list_id)
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Sendable campaigns due at `now`, filtered, ordered by
    /// (priority ASC, id ASC) and truncated to `limit`.
    async fn eligible_campaigns(
        &self,
        filters: &DispatchFilters,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Campaign>>;

    async fn campaign(&self, id: CampaignId) -> anyhow::Result<Option<Campaign>>;

    async fn campaign_status(&self, id: CampaignId) -> anyhow::Result<Option<CampaignStatus>>;

    /// Compare-and-set transition. `false` when the campaign is not in
    /// `from`; invalid edges are an error.
    async fn transition_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> anyhow::Result<bool>;

    /// Unconditional status write used by recovery paths. Still refuses
    /// edges the state machine does not have.
    async fn set_status(&self, id: CampaignId, to: CampaignStatus) -> anyhow::Result<()>;

    /// Self-healing: return campaigns stuck in `processing` to `sending`.
    async fn reset_stuck_processing(&self) -> anyhow::Result<Vec<CampaignId>>;

    async fn set_priority(&self, id: CampaignId, priority: i32) -> anyhow::Result<()>;

    async fn bump_priority(&self, id: CampaignId, by: i32) -> anyhow::Result<()>;

    async fn set_send_at(&self, id: CampaignId, at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn set_giveup_counter(&self, id: CampaignId, value: u32) -> anyhow::Result<()>;

    /// (Re)materialize the pending-recipient queue of a queue-table campaign.
    async fn populate_queue_table(&self, id: CampaignId) -> anyhow::Result<usize>;

    /// Least-used A/B subject variant, with its usage counter bumped.
    async fn pick_ab_subject(&self, id: CampaignId) -> anyhow::Result<Option<AbSubject>>;

    async fn rollback_ab_subject(&self, id: CampaignId, subject_id: i64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Count recipients still without a delivery log, honoring time-warp,
    /// bounded by `limit`.
    async fn pending_count(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<usize>;

    /// Load one (offset, limit) slice of the pending recipient set.
    async fn load_batch(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscriber>>;

    async fn subscriber_status(
        &self,
        id: SubscriberId,
    ) -> anyhow::Result<Option<SubscriberStatus>>;

    async fn update_subscriber_status(
        &self,
        id: SubscriberId,
        status: SubscriberStatus,
    ) -> anyhow::Result<()>;

    async fn insert_subscriber(&self, subscriber: Subscriber) -> anyhow::Result<SubscriberId>;

    async fn delete_subscriber(&self, id: SubscriberId) -> anyhow::Result<()>;

    async fn set_subscriber_field(
        &self,
        id: SubscriberId,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()>;

    async fn move_to_list(&self, id: SubscriberId, list_id: ListId) -> anyhow::Result<()>;

    async fn copy_to_list(&self, id: SubscriberId, list_id: ListId)
        -> anyhow::Result<SubscriberId>;
}

#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    /// Append a log row. A second row for the same (campaign, subscriber)
    /// pair is dropped with a warning, mirroring a unique-key insert.
    async fn insert_log(&self, log: DeliveryLog) -> anyhow::Result<()>;

    async fn log_exists(
        &self,
        campaign_id: CampaignId,
        subscriber_id: SubscriberId,
    ) -> anyhow::Result<bool>;

    async fn count_logs(&self, campaign_id: CampaignId) -> anyhow::Result<usize>;

    async fn count_logs_by_status(
        &self,
        campaign_id: CampaignId,
        status: DeliveryStatus,
    ) -> anyhow::Result<usize>;

    /// Drop `giveup` rows so the recipients become retryable.
    async fn purge_giveups(&self, campaign_id: CampaignId) -> anyhow::Result<usize>;

    async fn campaign_logs(&self, campaign_id: CampaignId) -> anyhow::Result<Vec<DeliveryLog>>;

    /// Successful deliveries across all of a customer's campaigns within the
    /// rolling hour before `now`.
    async fn sent_last_hour(
        &self,
        customer_id: CustomerId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Hard bounces over attempted deliveries, 0 when nothing was attempted.
    async fn bounce_rate(&self, campaign_id: CampaignId) -> anyhow::Result<f32>;

    async fn complaint_rate(&self, campaign_id: CampaignId) -> anyhow::Result<f32>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn customer(&self, id: CustomerId) -> anyhow::Result<Option<Customer>>;

    async fn quota_usage(&self, id: CustomerId) -> anyhow::Result<u64>;

    /// Atomic increment; returns the new usage.
    async fn increment_quota_usage(&self, id: CustomerId, by: u64) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Global or customer-scoped blacklist hit, with its reason.
    async fn blacklisted_reason(
        &self,
        customer_id: CustomerId,
        email: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Customer suppression list attached to this campaign.
    async fn is_suppressed(&self, campaign: &Campaign, email: &str) -> anyhow::Result<bool>;

    /// Campaign-group block list.
    async fn is_group_blocked(&self, group_id: &str, email: &str) -> anyhow::Result<bool>;
}

/// Everything the dispatch core needs from the backing store.
pub trait Store:
    CampaignStore + SubscriberStore + DeliveryLogStore + CustomerStore + SuppressionStore
{
}

impl<T> Store for T where
    T: CampaignStore + SubscriberStore + DeliveryLogStore + CustomerStore + SuppressionStore
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_campaign;

    #[test]
    fn test_filters_match_includes_and_excludes() {
        let campaign = sample_campaign();

        let all = DispatchFilters::default();
        assert!(all.matches(&campaign));

        let by_kind = DispatchFilters {
            kind: Some(CampaignType::Autoresponder),
            ..Default::default()
        };
        assert!(!by_kind.matches(&campaign));

        let by_customer = DispatchFilters {
            customer_ids: vec![campaign.customer_id],
            ..Default::default()
        };
        assert!(by_customer.matches(&campaign));

        let excluded = DispatchFilters {
            exclude_campaign_ids: vec![campaign.id],
            ..Default::default()
        };
        assert!(!excluded.matches(&campaign));
    }
}
