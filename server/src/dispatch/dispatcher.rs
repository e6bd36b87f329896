//! Worker pool dispatcher.
//!
//! Two fan-out levels: admitted campaigns run in chunks of
//! `campaigns_in_parallel`, and each campaign splits its allotment into
//! `subscriber_batches_in_parallel` contiguous (offset, limit) ranges. A
//! barrier keeps every batch worker in the load phase until all siblings are
//! done loading. Completion bookkeeping runs exactly once per campaign.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{BatchAbort, BatchSignal},
    model::{Campaign, CampaignStatus},
    store::CampaignStore,
    util::day_stamp,
};

use super::{
    batch::{BatchOutcome, BatchRunner},
    completion,
    guard::{ActiveSet, CampaignGuard},
    precheck::Admitted,
    EngineState,
};

pub async fn run(
    state: &EngineState,
    admitted: Vec<Admitted>,
    active: &ActiveSet,
    shutdown: &CancellationToken,
) {
    let chunk_size = state.settings.effective_campaigns_in_parallel();
    for chunk in admitted.chunks(chunk_size) {
        if shutdown.is_cancelled() {
            break;
        }
        let handles: Vec<_> = chunk
            .iter()
            .cloned()
            .map(|entry| {
                let state = state.clone();
                let active = active.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_campaign(state, entry, active, shutdown).await;
                })
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("Campaign worker panicked: {e}");
            }
        }
    }
}

/// Claim a sendable campaign for this worker (`-> processing`, priority
/// reset). `false` means someone else got there first.
pub async fn claim(state: &EngineState, campaign: &Campaign) -> anyhow::Result<bool> {
    for from in [CampaignStatus::Sending, CampaignStatus::PendingSending] {
        if state
            .store
            .transition_status(campaign.id, from, CampaignStatus::Processing)
            .await?
        {
            state.store.set_priority(campaign.id, 0).await?;
            return Ok(true);
        }
    }
    Ok(false)
}

async fn run_campaign(
    state: EngineState,
    entry: Admitted,
    active: ActiveSet,
    shutdown: CancellationToken,
) {
    let campaign = entry.campaign;
    let lock_name = format!("campaign:{}:{}", campaign.id, day_stamp(Utc::now()));
    let Some(_day_lock) = state.locks.acquire(&lock_name, state.campaign_ttl()) else {
        tracing::debug!(
            "Campaign {} is already being dispatched today, skipping",
            campaign.id
        );
        return;
    };

    match claim(&state, &campaign).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("Campaign {} is no longer claimable, skipping", campaign.id);
            return;
        }
        Err(e) => {
            tracing::error!("Failed to claim campaign {}: {e:?}", campaign.id);
            return;
        }
    }

    let guard = CampaignGuard::new(state.clone(), campaign.id, active.clone());

    let ranges = partition(entry.allotted, state.settings.effective_batches_in_parallel());
    if ranges.is_empty() {
        tracing::debug!("Campaign {} has an empty allotment, nothing to do", campaign.id);
        return;
    }
    let barrier = Arc::new(Barrier::new(ranges.len()));
    let handles: Vec<_> = ranges
        .iter()
        .map(|(offset, limit)| {
            let runner = BatchRunner::new(
                state.clone(),
                campaign.clone(),
                entry.customer.clone(),
                *offset,
                *limit,
                barrier.clone(),
                shutdown.clone(),
            );
            tokio::spawn(runner.run())
        })
        .collect();

    let results = join_all(handles).await;

    if shutdown.is_cancelled() {
        // the guard hands the campaign back to `sending`
        return;
    }

    let mut tally = BatchOutcome::default();
    let mut fatal: Option<BatchAbort> = None;
    for result in results {
        match result {
            Ok(Ok(outcome)) => tally.merge(outcome),
            Ok(Err(abort)) => {
                if fatal.is_none() {
                    fatal = Some(abort);
                }
            }
            Err(join_error) => {
                if fatal.is_none() {
                    fatal = Some(BatchAbort::new(
                        BatchSignal::StorageFailed,
                        format!("batch worker panicked: {join_error}"),
                    ));
                }
            }
        }
    }
    let batch_result = match fatal {
        Some(abort) => Err(abort),
        None => Ok(tally),
    };

    match completion::finish_campaign(&state, &campaign, &entry.customer, &batch_result, Utc::now())
        .await
    {
        Ok(final_status) => {
            tracing::info!("Campaign {} cycle finished as {final_status}", campaign.id);
            guard.defuse();
        }
        Err(e) => {
            // the guard restores `sending` for us
            tracing::error!("Completion failed for campaign {}: {e:?}", campaign.id);
        }
    }
}

/// Split `total` into contiguous (offset, limit) ranges, one per worker,
/// first ranges taking the remainder.
fn partition(total: usize, workers: usize) -> Vec<(usize, usize)> {
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);
    let base = total / workers;
    let remainder = total % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut offset = 0;
    for i in 0..workers {
        let limit = base + usize::from(i < remainder);
        ranges.push((offset, limit));
        offset += limit;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryStatus;
    use crate::store::{CampaignStore, DeliveryLogStore};
    use crate::testing::{
        confirmed_subscriber, engine_state, sample_campaign, sample_customer, sample_server,
    };
    use std::time::Duration;

    #[test]
    fn test_partition_covers_everything_without_overlap() {
        for (total, workers) in [(10, 3), (9, 3), (1, 4), (100, 7), (5, 5), (3, 8)] {
            let ranges = partition(total, workers);
            let sum: usize = ranges.iter().map(|(_, limit)| limit).sum();
            assert_eq!(sum, total, "total {total} workers {workers}");
            let mut expected_offset = 0;
            for (offset, limit) in &ranges {
                assert_eq!(*offset, expected_offset);
                assert!(*limit > 0);
                expected_offset += limit;
            }
        }
        assert!(partition(0, 3).is_empty());
    }

    fn admitted(campaign: Campaign, allotted: usize) -> Admitted {
        Admitted {
            campaign,
            customer: sample_customer(),
            allotted,
        }
    }

    #[tokio::test]
    async fn test_dispatch_sends_and_finalizes() {
        let (state, store, transport) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=10 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@d{}.com", i % 2)));
        }

        let active = ActiveSet::default();
        run(
            &state,
            vec![admitted(sample_campaign(), 10)],
            &active,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(transport.calls(), 10);
        assert_eq!(
            store.count_logs_by_status(1, DeliveryStatus::Success).await.unwrap(),
            10
        );
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sent)
        );
        assert!(active.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_batches_do_not_duplicate() {
        let (state, store, transport) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        for i in 1..=30 {
            store.add_subscriber(confirmed_subscriber(i, 1, &format!("u{i}@d{}.com", i % 5)));
        }

        run(
            &state,
            vec![admitted(sample_campaign(), 30)],
            &ActiveSet::default(),
            &CancellationToken::new(),
        )
        .await;

        // union of the batch slices is the full set, no overlaps
        let mut delivered = transport.delivered_to();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 30);
        assert_eq!(store.count_logs(1).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_day_lock_prevents_second_dispatch() {
        let (state, store, transport) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        store.add_subscriber(confirmed_subscriber(1, 1, "a@x.com"));

        let lock_name = format!("campaign:1:{}", day_stamp(Utc::now()));
        let _held = state
            .locks
            .acquire(&lock_name, Duration::from_secs(60))
            .unwrap();

        run(
            &state,
            vec![admitted(sample_campaign(), 1)],
            &ActiveSet::default(),
            &CancellationToken::new(),
        )
        .await;

        // the worker observed the held lock and exited cleanly
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }

    #[tokio::test]
    async fn test_unclaimable_campaign_skipped() {
        let (state, store, transport) = engine_state(vec![sample_server(1)]);
        store.add_customer(sample_customer());
        let mut campaign = sample_campaign();
        campaign.status = CampaignStatus::Paused;
        store.add_campaign(campaign.clone());

        run(
            &state,
            vec![admitted(campaign, 1)],
            &ActiveSet::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(transport.calls(), 0);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Paused)
        );
    }

    #[tokio::test]
    async fn test_fatal_batch_restores_sending() {
        let (state, store, transport) = engine_state(vec![]);
        store.add_customer(sample_customer());
        store.add_campaign(sample_campaign());
        store.add_subscriber(confirmed_subscriber(1, 1, "a@x.com"));

        run(
            &state,
            vec![admitted(sample_campaign(), 1)],
            &ActiveSet::default(),
            &CancellationToken::new(),
        )
        .await;

        // no delivery server at all: batch unwound, campaign back to sending
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            store.campaign_status(1).await.unwrap(),
            Some(CampaignStatus::Sending)
        );
    }
}
