//! Pre-check / admission stage.
//!
//! Decides, before any sending starts, how many subscribers each eligible
//! campaign may contact this cycle. The shared allowance table lives in the
//! cache keyed by customer id; every read-modify-write against it happens
//! under a short `precheck:customer:{id}:{date}` lock so concurrent
//! admission workers never lose updates. A customer that fails any check is
//! remembered for the rest of the run so their remaining campaigns skip
//! quickly.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    model::{Campaign, CampaignId, CampaignStatus, CampaignType, Customer, CustomerId,
        DeliveryStatus},
    store::{CampaignStore, CustomerStore, DeliveryLogStore, SubscriberStore},
    util::day_stamp,
};

use super::{completion, dispatcher, EngineState};

/// Priority penalty applied when a campaign is postponed on quota grounds.
const POSTPONE_PRIORITY_BUMP: i32 = 100;

/// Per-customer slice of the shared allowance table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerAllowance {
    pub quota_total: Option<u64>,
    pub quota_usage: u64,
    /// Remaining allowance for this run; `None` means unlimited.
    pub quota_left: Option<u64>,
    pub subscribers_at_once: usize,
    /// Total subscribers allotted to this customer's campaigns this run.
    pub subscribers_count: usize,
    /// Allotment granted to each admitted campaign.
    pub campaigns: HashMap<CampaignId, usize>,
}

pub fn allowance_key(customer_id: CustomerId) -> String {
    format!("allowance:{customer_id}")
}

pub fn load_allowance(state: &EngineState, customer_id: CustomerId) -> Option<CustomerAllowance> {
    state
        .cache
        .get(&allowance_key(customer_id))
        .and_then(|value| serde_json::from_value(value).ok())
}

fn save_allowance(state: &EngineState, customer_id: CustomerId, allowance: &CustomerAllowance) {
    if let Ok(value) = serde_json::to_value(allowance) {
        state.cache.set(&allowance_key(customer_id), value, None);
    }
}

/// A campaign cleared for dispatch with its subscriber allotment.
#[derive(Clone)]
pub struct Admitted {
    pub campaign: Campaign,
    pub customer: Customer,
    pub allotted: usize,
}

/// Run the admission checks over all candidates, optionally in parallel.
/// Failures affect only the campaign at hand; the rest of the cycle
/// proceeds.
pub async fn admit(state: &EngineState, campaigns: Vec<Campaign>, now: DateTime<Utc>) -> Vec<Admitted> {
    let failed_customers: Arc<Mutex<HashSet<CustomerId>>> = Arc::default();
    let admitted: Arc<Mutex<Vec<Admitted>>> = Arc::default();

    let workers = if state.settings.dispatch.parallel_sending {
        state.settings.dispatch.precheck_in_parallel
    } else {
        1
    };

    stream::iter(campaigns)
        .for_each_concurrent(workers, |campaign| {
            let state = state.clone();
            let failed_customers = failed_customers.clone();
            let admitted = admitted.clone();
            async move {
                let id = campaign.id;
                match precheck_campaign(&state, campaign, now, &failed_customers).await {
                    Ok(Some(entry)) => admitted.lock().unwrap().push(entry),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("Pre-check failed for campaign {id}: {e:?}");
                    }
                }
            }
        })
        .await;

    let mut admitted = Arc::try_unwrap(admitted)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    admitted.sort_by_key(|entry| (entry.campaign.priority, entry.campaign.id));
    admitted
}

async fn precheck_campaign(
    state: &EngineState,
    campaign: Campaign,
    now: DateTime<Utc>,
    failed_customers: &Mutex<HashSet<CustomerId>>,
) -> anyhow::Result<Option<Admitted>> {
    let Some(customer) = state.store.customer(campaign.customer_id).await? else {
        tracing::warn!(
            "Campaign {} references missing customer {}, skipping",
            campaign.id,
            campaign.customer_id
        );
        return Ok(None);
    };

    if failed_customers.lock().unwrap().contains(&customer.id) {
        tracing::debug!(
            "Customer {} already failed this run, skipping campaign {}",
            customer.id,
            campaign.id
        );
        return Ok(None);
    }

    if !customer.is_active() {
        tracing::info!(
            "Customer {} is inactive, pausing campaign {}",
            customer.id,
            campaign.id
        );
        state
            .store
            .set_status(campaign.id, CampaignStatus::Paused)
            .await?;
        failed_customers.lock().unwrap().insert(customer.id);
        return Ok(None);
    }

    if let Some(hourly) = customer.hourly_quota {
        let sent = state.store.sent_last_hour(customer.id, now).await?;
        if sent >= hourly {
            tracing::info!(
                "Customer {} exhausted hourly quota ({sent}/{hourly}), postponing campaign {}",
                customer.id,
                campaign.id
            );
            state
                .store
                .bump_priority(campaign.id, POSTPONE_PRIORITY_BUMP)
                .await?;
            failed_customers.lock().unwrap().insert(customer.id);
            return Ok(None);
        }
    }

    let usage = state.store.quota_usage(customer.id).await?;
    if customer.is_over_quota(usage) {
        tracing::info!(
            "Customer {} reached sending quota ({usage}), postponing campaign {}",
            customer.id,
            campaign.id
        );
        state
            .store
            .set_status(campaign.id, CampaignStatus::Paused)
            .await?;
        state
            .store
            .bump_priority(campaign.id, POSTPONE_PRIORITY_BUMP)
            .await?;
        failed_customers.lock().unwrap().insert(customer.id);
        return Ok(None);
    }

    if campaign.options.use_queue_table && !populate_queue(state, &campaign).await {
        return Ok(None);
    }

    if !populate_allowance(state, &customer, usage, now).await {
        tracing::warn!(
            "Allowance lock unavailable for customer {}, skipping campaign {} this cycle",
            customer.id,
            campaign.id
        );
        return Ok(None);
    }

    let Some(allowance) = load_allowance(state, customer.id) else {
        anyhow::bail!("allowance table entry missing for customer {}", customer.id);
    };

    // pre-count, bounded by the per-cycle cap and the campaign's own
    // max-send headroom
    let cap = allowance.subscribers_at_once;
    let mut pre_count = state.store.pending_count(&campaign, now, cap).await?;
    if let Some(max_send) = campaign.options.max_send_count {
        let delivered = state
            .store
            .count_logs_by_status(campaign.id, DeliveryStatus::Success)
            .await? as u64;
        pre_count = pre_count.min(max_send.saturating_sub(delivered) as usize);
    }

    let allotted = allocate(state, &customer, campaign.id, pre_count, now).await?;

    if allotted == 0 {
        handle_zero_allotment(state, &campaign, &customer, now).await?;
        return Ok(None);
    }

    Ok(Some(Admitted {
        campaign,
        customer,
        allotted,
    }))
}

/// Queue-table campaigns rematerialize their pending queue before counting.
/// Returns false when the campaign must be skipped this cycle.
async fn populate_queue(state: &EngineState, campaign: &Campaign) -> bool {
    let lock_name = format!("queue-table:{}", campaign.id);
    let Some(_lock) = state.locks.acquire(&lock_name, Duration::from_secs(120)) else {
        tracing::info!(
            "Queue table of campaign {} is being populated elsewhere, skipping",
            campaign.id
        );
        return false;
    };

    match state.store.populate_queue_table(campaign.id).await {
        Ok(count) => {
            tracing::debug!("Queue table of campaign {} holds {count} recipients", campaign.id);
            true
        }
        Err(e) => {
            tracing::error!(
                "Queue table population failed for campaign {}: {e:?}",
                campaign.id
            );
            if let Ok(Some(CampaignStatus::PendingSending)) =
                state.store.campaign_status(campaign.id).await
            {
                let _ = state
                    .store
                    .set_status(campaign.id, CampaignStatus::Sending)
                    .await;
            }
            false
        }
    }
}

/// Compute the customer's quota figures exactly once per run. Returns false
/// when the allowance lock could not be taken.
async fn populate_allowance(
    state: &EngineState,
    customer: &Customer,
    usage: u64,
    now: DateTime<Utc>,
) -> bool {
    let lock_name = format!("precheck:customer:{}:{}", customer.id, day_stamp(now));
    let Some(_lock) = state
        .locks
        .acquire_wait(&lock_name, state.step_ttl(), state.step_wait())
        .await
    else {
        return false;
    };

    if load_allowance(state, customer.id).is_some() {
        return true;
    }

    let quota_total = customer.sending_quota;
    let mut quota_left = quota_total.map(|total| total.saturating_sub(usage));
    if let Some(hourly) = customer.hourly_quota {
        let sent = state
            .store
            .sent_last_hour(customer.id, now)
            .await
            .unwrap_or(0);
        let hourly_left = hourly.saturating_sub(sent);
        quota_left = Some(quota_left.map_or(hourly_left, |left| left.min(hourly_left)));
    }

    let allowance = CustomerAllowance {
        quota_total,
        quota_usage: usage,
        quota_left,
        subscribers_at_once: customer
            .subscribers_at_once
            .unwrap_or(state.settings.dispatch.subscribers_at_once),
        subscribers_count: 0,
        campaigns: HashMap::new(),
    };
    save_allowance(state, customer.id, &allowance);
    tracing::debug!(
        "Allowance for customer {}: left={:?} at_once={}",
        customer.id,
        allowance.quota_left,
        allowance.subscribers_at_once
    );
    true
}

/// Grant `min(quota_left, pre_count)` to the campaign and decrement the
/// shared remainder, all under the customer's allowance lock.
async fn allocate(
    state: &EngineState,
    customer: &Customer,
    campaign_id: CampaignId,
    pre_count: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let lock_name = format!("precheck:customer:{}:{}", customer.id, day_stamp(now));
    let Some(_lock) = state
        .locks
        .acquire_wait(&lock_name, state.step_ttl(), state.step_wait())
        .await
    else {
        tracing::warn!(
            "Allocation lock unavailable for customer {}, campaign {} waits for next cycle",
            customer.id,
            campaign_id
        );
        return Ok(0);
    };

    let Some(mut allowance) = load_allowance(state, customer.id) else {
        anyhow::bail!("allowance table entry missing for customer {}", customer.id);
    };

    let allotted = match allowance.quota_left {
        Some(left) => pre_count.min(left as usize),
        None => pre_count,
    };
    if allotted > 0 {
        if let Some(left) = allowance.quota_left.as_mut() {
            *left -= allotted as u64;
        }
        allowance.subscribers_count += allotted;
        allowance.campaigns.insert(campaign_id, allotted);
        save_allowance(state, customer.id, &allowance);
    }
    Ok(allotted)
}

/// A regular campaign with nothing to send might be genuinely finished:
/// verify against the full pending set (time-warp aware) and finalize it.
async fn handle_zero_allotment(
    state: &EngineState,
    campaign: &Campaign,
    customer: &Customer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if campaign.kind != CampaignType::Regular {
        return Ok(());
    }

    let pending = state.store.pending_count(campaign, now, usize::MAX).await?;
    let giveups = state
        .store
        .count_logs_by_status(campaign.id, DeliveryStatus::Giveup)
        .await?;
    if pending > 0 || giveups > 0 {
        tracing::debug!(
            "Campaign {} got no allotment this cycle ({} pending, {} giveups), requeued",
            campaign.id,
            pending,
            giveups
        );
        return Ok(());
    }

    if dispatcher::claim(state, campaign).await? {
        completion::finalize_sent(state, campaign, customer, now).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CustomerStatus;
    use crate::store::{CampaignStore, CustomerStore};
    use crate::testing::{
        confirmed_subscriber, engine_state, sample_campaign, sample_customer, sample_server,
    };

    fn campaign_for(id: CampaignId, customer_id: CustomerId) -> Campaign {
        let mut campaign = sample_campaign();
        campaign.id = id;
        campaign.customer_id = customer_id;
        campaign
    }

    #[tokio::test]
    async fn test_inactive_customer_pauses_campaign() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        let mut customer = sample_customer();
        customer.status = CustomerStatus::Inactive;
        store.add_customer(customer);
        store.add_campaign(sample_campaign());

        let admitted = admit(&state, vec![sample_campaign()], Utc::now()).await;
        assert!(admitted.is_empty());
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Paused)
        );
    }

    #[tokio::test]
    async fn test_failed_customer_skips_sibling_campaigns() {
        let (mut state, store, _) = engine_state(vec![sample_server(1)]);
        // sequential admission makes the skip order observable
        let mut settings = (*state.settings).clone();
        settings.dispatch.precheck_in_parallel = 1;
        state.settings = Arc::new(settings);

        let mut customer = sample_customer();
        customer.status = CustomerStatus::Inactive;
        store.add_customer(customer);
        store.add_campaign(campaign_for(1, 1));
        store.add_campaign(campaign_for(2, 1));

        let candidates = vec![campaign_for(1, 1), campaign_for(2, 1)];
        let admitted = admit(&state, candidates, Utc::now()).await;
        assert!(admitted.is_empty());
        // the first campaign took the pause transition; the sibling was
        // skipped outright and stays sendable
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Paused)
        );
        assert_eq!(
            store.campaign_status(2).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    #[tokio::test]
    async fn test_over_quota_postpones_with_priority_bump() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        let mut customer = sample_customer();
        customer.sending_quota = Some(10);
        store.add_customer(customer);
        store.add_campaign(sample_campaign());
        store.increment_quota_usage(1, 10).await.unwrap();

        let admitted = admit(&state, vec![sample_campaign()], Utc::now()).await;
        assert!(admitted.is_empty());
        let campaign = store.campaign(1).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Paused);
        assert!(campaign.priority >= POSTPONE_PRIORITY_BUMP);
    }

    #[tokio::test]
    async fn test_allowance_shared_across_campaigns() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        let mut customer = sample_customer();
        customer.sending_quota = Some(50);
        store.add_customer(customer);

        // two campaigns on the same list of 40 subscribers
        store.add_campaign(campaign_for(1, 1));
        store.add_campaign(campaign_for(2, 1));
        for i in 1..=40 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        let candidates = vec![campaign_for(1, 1), campaign_for(2, 1)];
        let admitted = admit(&state, candidates, Utc::now()).await;

        let total: usize = admitted.iter().map(|a| a.allotted).sum();
        assert!(total <= 50, "allotted {total} over the shared quota");
        let allowance = load_allowance(&state, 1).unwrap();
        assert_eq!(allowance.subscribers_count, total);
        // quota_left never went negative
        assert!(allowance.quota_left.unwrap() <= 50);
        assert_eq!(allowance.quota_left.unwrap() as usize, 50 - total);
    }

    #[tokio::test]
    async fn test_zero_subscriber_regular_campaign_finalizes() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        // no subscribers at all

        let admitted = admit(&state, vec![sample_campaign()], Utc::now()).await;
        assert!(admitted.is_empty());
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
    }

    #[tokio::test]
    async fn test_autoresponder_never_finalized_at_admission() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        let mut campaign = sample_campaign();
        campaign.kind = CampaignType::Autoresponder;
        store.add_campaign(campaign.clone());

        let admitted = admit(&state, vec![campaign], Utc::now()).await;
        assert!(admitted.is_empty());
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    #[tokio::test]
    async fn test_queue_table_failure_skips_campaign() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        let mut campaign = sample_campaign();
        campaign.options.use_queue_table = true;
        store.add_campaign(campaign.clone());
        store.add_subscriber(confirmed_subscriber(1, 1, "u1@x.com"));
        store.break_queue_table(1);

        let admitted = admit(&state, vec![campaign], Utc::now()).await;
        assert!(admitted.is_empty());
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    #[tokio::test]
    async fn test_hourly_quota_clips_allowance() {
        let (state, store, _) = engine_state(vec![sample_server(1)]);
        let mut customer = sample_customer();
        customer.sending_quota = Some(100);
        customer.hourly_quota = Some(5);
        store.add_customer(customer);
        store.add_campaign(sample_campaign());
        for i in 1..=20 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@x.com")));
        }

        let admitted = admit(&state, vec![sample_campaign()], Utc::now()).await;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].allotted, 5);
    }
}
