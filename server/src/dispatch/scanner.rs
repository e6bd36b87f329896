//! Campaign eligibility scanner.

use chrono::{DateTime, Utc};

use crate::{
    model::Campaign,
    store::{CampaignStore, DispatchFilters},
};

use super::EngineState;

/// Campaigns due for sending this cycle, ordered by (priority, id).
///
/// Campaigns left in `processing` by a crashed run are reset first, under a
/// short lock so concurrent invocations don't double-heal.
pub async fn eligible_campaigns(
    state: &EngineState,
    filters: &DispatchFilters,
    now: DateTime<Utc>,
    in_flight: usize,
) -> anyhow::Result<Vec<Campaign>> {
    if let Some(_heal_lock) = state.locks.acquire("campaigns:heal", state.step_ttl()) {
        let healed = state.store.reset_stuck_processing().await?;
        if !healed.is_empty() {
            tracing::warn!(
                "Reset {} campaigns stuck in processing: {:?}",
                healed.len(),
                healed
            );
        }
    }

    let mut limit = state.settings.dispatch.campaigns_at_once;
    if state.settings.dispatch.auto_adjust_campaigns_at_once {
        limit = limit.saturating_sub(in_flight);
    }
    if limit == 0 {
        tracing::debug!("Campaign pick-up limit exhausted by {in_flight} in-flight campaigns");
        return Ok(Vec::new());
    }

    state.store.eligible_campaigns(filters, now, limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CampaignStatus;
    use crate::store::CampaignStore;
    use crate::testing::{engine_state, sample_campaign};
    use std::time::Duration;

    #[tokio::test]
    async fn test_scanner_heals_stuck_campaigns() {
        let (state, store, _) = engine_state(vec![]);
        let mut stuck = sample_campaign();
        stuck.status = CampaignStatus::Processing;
        store.add_campaign(stuck);

        let picked = eligible_campaigns(&state, &DispatchFilters::default(), Utc::now(), 0)
            .await
            .unwrap();

        // healed back to sending and immediately eligible again
        assert_eq!(picked.len(), 1);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    #[tokio::test]
    async fn test_heal_skipped_when_lock_held() {
        let (state, store, _) = engine_state(vec![]);
        let mut stuck = sample_campaign();
        stuck.status = CampaignStatus::Processing;
        store.add_campaign(stuck);

        let _held = state
            .locks
            .acquire("campaigns:heal", Duration::from_secs(30))
            .unwrap();
        let picked = eligible_campaigns(&state, &DispatchFilters::default(), Utc::now(), 0)
            .await
            .unwrap();

        // someone else is healing; the stuck campaign stays put for now
        assert!(picked.is_empty());
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Processing)
        );
    }

    #[tokio::test]
    async fn test_auto_adjust_shrinks_limit() {
        let (state, store, _) = engine_state(vec![]);
        for id in 1..=5 {
            let mut campaign = sample_campaign();
            campaign.id = id;
            store.add_campaign(campaign);
        }

        let limit = state.settings.dispatch.campaigns_at_once;
        let picked =
            eligible_campaigns(&state, &DispatchFilters::default(), Utc::now(), limit - 2)
                .await
                .unwrap();
        assert_eq!(picked.len(), 2);

        let none = eligible_campaigns(&state, &DispatchFilters::default(), Utc::now(), limit)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
