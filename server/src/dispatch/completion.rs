//! Completion & requeue logic.
//!
//! Runs once per claimed campaign after its batch workers finish, deciding
//! whether the campaign is done, goes back in the queue, or gets blocked on
//! bounce/complaint grounds.

use chrono::{DateTime, Duration, Utc};

use crate::{
    content::{render_stats_summary, CampaignStats},
    error::{BatchAbort, BatchSignal},
    model::{Campaign, CampaignStatus, Customer, DeliveryStatus, UseFor},
    store::{CampaignStore, DeliveryLogStore, SubscriberStore},
    transport::OutboundEmail,
};

use super::{batch::BatchOutcome, EngineState};

/// Decide and persist the campaign's post-batch status, returning it.
pub async fn finish_campaign(
    state: &EngineState,
    campaign: &Campaign,
    customer: &Customer,
    result: &Result<BatchOutcome, BatchAbort>,
    now: DateTime<Utc>,
) -> anyhow::Result<CampaignStatus> {
    // bounce/complaint thresholds apply regardless of how the batch ended
    let bounce_rate = state.store.bounce_rate(campaign.id).await?;
    let complaint_rate = state.store.complaint_rate(campaign.id).await?;
    if bounce_rate > state.settings.thresholds.max_bounce_rate
        || complaint_rate > state.settings.thresholds.max_complaint_rate
    {
        tracing::warn!(
            "Campaign {} blocked: bounce rate {:.3}, complaint rate {:.3}",
            campaign.id,
            bounce_rate,
            complaint_rate
        );
        state
            .store
            .set_status(campaign.id, CampaignStatus::Blocked)
            .await?;
        state.tracker.record_campaign_blocked();
        return Ok(CampaignStatus::Blocked);
    }

    match result {
        Err(abort) => {
            tracing::error!(
                "Campaign {} batch unwound with code {}: {}",
                campaign.id,
                abort.code(),
                abort
            );
            let status = match abort.signal {
                BatchSignal::QuotaReached => {
                    state
                        .store
                        .set_status(campaign.id, CampaignStatus::Paused)
                        .await?;
                    state.store.bump_priority(campaign.id, 100).await?;
                    CampaignStatus::Paused
                }
                BatchSignal::StatusChanged => {
                    // someone else moved the campaign; only restore if we
                    // still own a processing claim
                    match state.store.campaign_status(campaign.id).await? {
                        Some(CampaignStatus::Processing) => {
                            state
                                .store
                                .set_status(campaign.id, CampaignStatus::Sending)
                                .await?;
                            CampaignStatus::Sending
                        }
                        Some(other) => other,
                        None => CampaignStatus::Sending,
                    }
                }
                _ => {
                    state
                        .store
                        .set_status(campaign.id, CampaignStatus::Sending)
                        .await?;
                    CampaignStatus::Sending
                }
            };
            state.tracker.record_campaign_requeued();
            Ok(status)
        }
        Ok(outcome) => {
            tracing::info!(
                "Campaign {} batch done: {} sent, {} failed, {} skipped",
                campaign.id,
                outcome.sent,
                outcome.failed,
                outcome.skipped
            );

            let giveups = state
                .store
                .count_logs_by_status(campaign.id, DeliveryStatus::Giveup)
                .await?;
            if giveups > 0 && campaign.options.giveup_counter < campaign.options.max_giveup_retries
            {
                let next_round = campaign.options.giveup_counter + 1;
                tracing::info!(
                    "Campaign {} keeps sending: {giveups} giveups get retry round {next_round}/{}",
                    campaign.id,
                    campaign.options.max_giveup_retries
                );
                state
                    .store
                    .set_giveup_counter(campaign.id, next_round)
                    .await?;
                state.store.purge_giveups(campaign.id).await?;
                state
                    .store
                    .set_status(campaign.id, CampaignStatus::Sending)
                    .await?;
                state.tracker.record_campaign_requeued();
                return Ok(CampaignStatus::Sending);
            }

            if campaign.is_autoresponder() {
                state
                    .store
                    .set_status(campaign.id, CampaignStatus::Sending)
                    .await?;
                state.tracker.record_campaign_requeued();
                return Ok(CampaignStatus::Sending);
            }

            let remaining = state.store.pending_count(campaign, now, 1).await?;
            if remaining == 0 {
                finalize_sent(state, campaign, customer, now).await?;
                let status = state
                    .store
                    .campaign_status(campaign.id)
                    .await?
                    .unwrap_or(CampaignStatus::Sent);
                Ok(status)
            } else {
                state
                    .store
                    .set_status(campaign.id, CampaignStatus::Sending)
                    .await?;
                state.tracker.record_campaign_requeued();
                Ok(CampaignStatus::Sending)
            }
        }
    }
}

/// Finalize a claimed campaign that has no recipients left: `processing ->
/// sent`, stats notification, recurring reschedule, giveup-counter reset.
pub async fn finalize_sent(
    state: &EngineState,
    campaign: &Campaign,
    customer: &Customer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let claimed = state
        .store
        .transition_status(campaign.id, CampaignStatus::Processing, CampaignStatus::Sent)
        .await?;
    if !claimed {
        tracing::warn!(
            "Campaign {} changed status before finalization, leaving as-is",
            campaign.id
        );
        return Ok(());
    }

    state.store.set_giveup_counter(campaign.id, 0).await?;
    state.tracker.record_campaign_sent();
    tracing::info!("Campaign {} fully sent", campaign.id);

    send_stats_email(state, campaign, customer).await;

    if let Some(hours) = campaign.options.recurring_every_hours {
        let next = now + Duration::hours(hours);
        state.store.set_send_at(campaign.id, next).await?;
        state
            .store
            .set_status(campaign.id, CampaignStatus::PendingSending)
            .await?;
        tracing::info!("Campaign {} rescheduled for {next}", campaign.id);
    }

    Ok(())
}

/// Best-effort "campaign sent" summary through a reports-capable server.
/// Never fails the finalization.
async fn send_stats_email(state: &EngineState, campaign: &Campaign, customer: &Customer) {
    let Some(notify_address) = &customer.notify_on_campaign_sent else {
        return;
    };

    let stats = async {
        let delivered = state
            .store
            .count_logs_by_status(campaign.id, DeliveryStatus::Success)
            .await?;
        let giveups = state
            .store
            .count_logs_by_status(campaign.id, DeliveryStatus::Giveup)
            .await?;
        let fatal = state
            .store
            .count_logs_by_status(campaign.id, DeliveryStatus::FatalError)
            .await?;
        let total_logged = state.store.count_logs(campaign.id).await?;
        anyhow::Ok(CampaignStats {
            campaign_name: campaign.name.clone(),
            delivered,
            failed: giveups + fatal,
            total_logged,
        })
    };

    let stats = match stats.await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!("Could not collect stats for campaign {}: {e}", campaign.id);
            return;
        }
    };

    let body = match render_stats_summary(&stats) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Could not render stats summary for campaign {}: {e}", campaign.id);
            return;
        }
    };

    let Some(server) = state
        .pool
        .pick(UseFor::Reports, &Default::default(), false)
    else {
        tracing::warn!(
            "No reports-capable server to notify customer {} about campaign {}",
            customer.id,
            campaign.id
        );
        return;
    };

    let email = OutboundEmail {
        from_name: campaign.from_name.clone(),
        from_email: campaign.from_email.clone(),
        to_email: notify_address.clone(),
        subject: format!("Campaign \"{}\" has been sent", campaign.name),
        html_body: format!("<pre>{body}</pre>"),
        plain_text_body: body,
        headers: Vec::new(),
    };

    if let Err(e) = state.transport.send(&email, &server).await {
        tracing::warn!(
            "Stats notification for campaign {} failed: {e}",
            campaign.id
        );
    }
}
