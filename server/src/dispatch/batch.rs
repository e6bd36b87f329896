//! Subscriber batch processor.
//!
//! One instance owns a contiguous (offset, limit) slice of a campaign's
//! allotted recipients: load, repair, interleave by domain, then the
//! per-subscriber send loop. Per-subscriber problems become DeliveryLog rows
//! and the loop moves on; batch-fatal conditions unwind through
//! [`BatchAbort`] and the campaign is retried next cycle.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{BatchAbort, BatchSignal},
    model::{
        AbSubject, Campaign, CampaignStatus, Customer, DeliveryLog, DeliveryServer,
        DeliveryStatus, OnSentAction, Subscriber, SubscriberStatus, UseFor,
    },
    store::{CampaignStore, CustomerStore, DeliveryLogStore, SubscriberStore, SuppressionStore},
    transport::{OutboundEmail, TransportError},
};

use super::EngineState;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub domain_rejected: usize,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.domain_rejected += other.domain_rejected;
    }
}

pub struct BatchRunner {
    state: EngineState,
    campaign: Campaign,
    customer: Customer,
    offset: usize,
    limit: usize,
    barrier: Arc<Barrier>,
    shutdown: CancellationToken,
}

/// Per-pass bookkeeping for server rotation.
struct PassState {
    server: Arc<DeliveryServer>,
    consecutive_failures: u32,
    sent_on_server: u32,
    /// Servers whose domain policy rejected someone in this pass; excluded
    /// from the next retry round, not from in-pass rotation.
    rejected_by: HashSet<i64>,
    deferred: Vec<Subscriber>,
}

impl BatchRunner {
    pub fn new(
        state: EngineState,
        campaign: Campaign,
        customer: Customer,
        offset: usize,
        limit: usize,
        barrier: Arc<Barrier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            campaign,
            customer,
            offset,
            limit,
            barrier,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<BatchOutcome, BatchAbort> {
        let now = Utc::now();
        let loaded = self
            .state
            .store
            .load_batch(&self.campaign, now, self.offset, self.limit)
            .await;

        // Every sibling batch must finish its load before anyone writes a
        // log row, or the offset slices would shift under the slower
        // workers.
        self.barrier.wait().await;

        let subscribers =
            loaded.map_err(|e| BatchAbort::new(BatchSignal::StorageFailed, e.to_string()))?;
        tracing::debug!(
            "Campaign {} batch {}+{} loaded {} subscribers",
            self.campaign.id,
            self.offset,
            self.limit,
            subscribers.len()
        );

        let subscribers = self.repair(subscribers).await;
        let mut pending =
            lib_addr::interleave_by_domain(subscribers, |s| s.domain().unwrap_or_default());

        let mut outcome = BatchOutcome::default();
        let mut exclude: HashSet<i64> = HashSet::new();
        let max_rounds =
            self.state.settings.retry.domain_policy_extra_rounds + self.state.pool.active_count();
        let mut round = 0;

        while !pending.is_empty() {
            let Some(server) = self.state.pool.pick(UseFor::Campaigns, &exclude, true) else {
                if round == 0 {
                    return Err(BatchAbort::new(
                        BatchSignal::NoServerAvailable,
                        format!("no delivery server for campaign {}", self.campaign.id),
                    ));
                }
                break;
            };

            let deferred = self.send_pass(pending, server, &mut exclude, &mut outcome).await?;
            pending = deferred;

            round += 1;
            if round > max_rounds {
                break;
            }
        }

        // recipients no server would take, after the bounded retry rounds
        for subscriber in pending {
            self.log(
                &subscriber,
                DeliveryStatus::DomainPolicyReject,
                "recipient domain rejected by every delivery server",
                None,
                None,
            )
            .await;
            outcome.domain_rejected += 1;
        }

        Ok(outcome)
    }

    /// Data-repair pass over the loaded slice: empty addresses are dropped,
    /// `,`/`;`-joined fields are split into separate subscriber records and
    /// anything still invalid is removed.
    async fn repair(&self, subscribers: Vec<Subscriber>) -> Vec<Subscriber> {
        let mut repaired = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            if lib_addr::is_valid(&subscriber.email) {
                repaired.push(subscriber);
                continue;
            }

            let candidates: Vec<String> = lib_addr::split_joined(&subscriber.email)
                .into_iter()
                .filter(|addr| lib_addr::is_valid(addr))
                .collect();

            if let Err(e) = self.state.store.delete_subscriber(subscriber.id).await {
                tracing::warn!("Failed to drop malformed subscriber {}: {e}", subscriber.id);
            }
            if candidates.is_empty() {
                tracing::debug!(
                    "Dropped subscriber {} with unrepairable address {:?}",
                    subscriber.id,
                    subscriber.email
                );
                continue;
            }

            for address in candidates {
                let mut replacement = subscriber.clone();
                replacement.email = address;
                match self.state.store.insert_subscriber(replacement.clone()).await {
                    Ok(id) => {
                        replacement.id = id;
                        repaired.push(replacement);
                    }
                    Err(e) => tracing::warn!(
                        "Failed to insert repaired subscriber for {}: {e}",
                        subscriber.id
                    ),
                }
            }
        }
        repaired
    }

    async fn send_pass(
        &self,
        subscribers: Vec<Subscriber>,
        server: Arc<DeliveryServer>,
        exclude: &mut HashSet<i64>,
        outcome: &mut BatchOutcome,
    ) -> Result<Vec<Subscriber>, BatchAbort> {
        let mut pass = PassState {
            server,
            consecutive_failures: 0,
            sent_on_server: 0,
            rejected_by: HashSet::new(),
            deferred: Vec::new(),
        };

        for subscriber in subscribers {
            if self.shutdown.is_cancelled() {
                break;
            }
            outcome.processed += 1;
            self.send_subscriber(subscriber, &mut pass, exclude, outcome)
                .await?;
        }

        exclude.extend(pass.rejected_by.iter().copied());
        Ok(pass.deferred)
    }

    async fn send_subscriber(
        &self,
        subscriber: Subscriber,
        pass: &mut PassState,
        exclude: &mut HashSet<i64>,
        outcome: &mut BatchOutcome,
    ) -> Result<(), BatchAbort> {
        let settings = &self.state.settings;

        // without task-level parallelism there is no campaign claim race to
        // protect quota, so re-check it on every send
        if !settings.dispatch.parallel_sending {
            let usage = self
                .state
                .store
                .quota_usage(self.customer.id)
                .await
                .map_err(storage)?;
            if self.customer.is_over_quota(usage) {
                return Err(BatchAbort::new(
                    BatchSignal::QuotaReached,
                    format!("customer {} over quota mid-batch", self.customer.id),
                ));
            }
        }

        if rand::random::<f64>() < settings.retry.status_recheck_probability {
            let status = self
                .state
                .store
                .campaign_status(self.campaign.id)
                .await
                .map_err(storage)?;
            match status {
                Some(CampaignStatus::Processing) | Some(CampaignStatus::Sending) => {}
                other => {
                    return Err(BatchAbort::new(
                        BatchSignal::StatusChanged,
                        format!("campaign {} status is now {:?}", self.campaign.id, other),
                    ));
                }
            }
        }

        let domain = subscriber.domain().unwrap_or_default();
        if !pass.server.accepts_domain(&domain) {
            pass.rejected_by.insert(pass.server.id);
            pass.deferred.push(subscriber);
            return Ok(());
        }

        let live_status = self
            .state
            .store
            .subscriber_status(subscriber.id)
            .await
            .map_err(storage)?;
        if live_status != Some(SubscriberStatus::Confirmed) {
            self.log(&subscriber, DeliveryStatus::Error, "subscriber is not confirmed", None, None)
                .await;
            outcome.skipped += 1;
            return Ok(());
        }

        if let Some(reason) = self
            .state
            .store
            .blacklisted_reason(self.customer.id, &subscriber.email)
            .await
            .map_err(storage)?
        {
            self.log(&subscriber, DeliveryStatus::Blacklisted, reason, None, None)
                .await;
            outcome.skipped += 1;
            return Ok(());
        }

        if self
            .state
            .store
            .is_suppressed(&self.campaign, &subscriber.email)
            .await
            .map_err(storage)?
        {
            self.log(
                &subscriber,
                DeliveryStatus::Suppressed,
                "address is on a suppression list",
                None,
                None,
            )
            .await;
            outcome.skipped += 1;
            return Ok(());
        }

        if let Some(group) = &self.campaign.group_id {
            if self
                .state
                .store
                .is_group_blocked(group, &subscriber.email)
                .await
                .map_err(storage)?
            {
                self.log(
                    &subscriber,
                    DeliveryStatus::Blocked,
                    "address is on the campaign group block list",
                    None,
                    None,
                )
                .await;
                outcome.skipped += 1;
                return Ok(());
            }
        }

        // hot-swap a server that ran out of quota mid-batch
        if self.state.pool.is_over_quota(&pass.server) {
            exclude.insert(pass.server.id);
            let Some(next) = self.state.pool.pick(UseFor::Campaigns, exclude, true) else {
                return Err(BatchAbort::new(
                    BatchSignal::NoServerAvailable,
                    format!("server pool exhausted for campaign {}", self.campaign.id),
                ));
            };
            tracing::info!(
                "Campaign {} swapped delivery server {} -> {}",
                self.campaign.id,
                pass.server.id,
                next.id
            );
            pass.server = next;
            pass.sent_on_server = 0;
            pass.consecutive_failures = 0;
            if !pass.server.accepts_domain(&domain) {
                pass.rejected_by.insert(pass.server.id);
                pass.deferred.push(subscriber);
                return Ok(());
            }
        }

        let ab_subject = if self.campaign.options.ab_subjects.is_empty() {
            None
        } else {
            self.state
                .store
                .pick_ab_subject(self.campaign.id)
                .await
                .map_err(storage)?
        };

        let rendered = match self
            .state
            .renderer
            .render(
                &self.campaign,
                &subscriber,
                &pass.server,
                ab_subject.as_ref().map(|v| v.subject.as_str()),
            )
            .await
        {
            Ok(rendered)
                if !rendered.subject.is_empty()
                    && !(rendered.html_body.is_empty() && rendered.plain_text_body.is_empty()) =>
            {
                rendered
            }
            Ok(_) => {
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::Error,
                    "rendered content has no subject or body",
                    Some(pass.server.id),
                    None,
                )
                .await;
                outcome.failed += 1;
                return Ok(());
            }
            Err(e) => {
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::Error,
                    format!("content rendering failed: {e}"),
                    Some(pass.server.id),
                    None,
                )
                .await;
                outcome.failed += 1;
                return Ok(());
            }
        };

        // periodic rotation, re-validating the new server's domain policy
        let rotate_after = settings.retry.change_server_at;
        if (rotate_after > 0 && pass.sent_on_server >= rotate_after)
            || pass.consecutive_failures >= settings.retry.max_consecutive_failures
        {
            let mut rotation_exclude = exclude.clone();
            rotation_exclude.insert(pass.server.id);
            if let Some(next) = self.state.pool.pick(UseFor::Campaigns, &rotation_exclude, true) {
                tracing::debug!(
                    "Campaign {} rotated delivery server {} -> {}",
                    self.campaign.id,
                    pass.server.id,
                    next.id
                );
                pass.server = next;
                pass.sent_on_server = 0;
                pass.consecutive_failures = 0;
                if !pass.server.accepts_domain(&domain) {
                    pass.rejected_by.insert(pass.server.id);
                    self.rollback_ab(&ab_subject).await;
                    pass.deferred.push(subscriber);
                    return Ok(());
                }
            }
        }

        // send-group dedup: first campaign in the group to reach an address
        // wins, checked-and-set under the group's lock
        if let Some(group) = self.campaign.group_id.clone() {
            let lock_name = format!("send-group:{group}");
            let Some(_lock) = self
                .state
                .locks
                .acquire_wait(&lock_name, self.state.step_ttl(), self.state.step_wait())
                .await
            else {
                self.rollback_ab(&ab_subject).await;
                return Err(BatchAbort::new(
                    BatchSignal::LockUnavailable,
                    format!("send-group lock {lock_name} unavailable"),
                ));
            };
            let key = format!("send-group:{}:{}", group, subscriber.email.to_ascii_lowercase());
            if self.state.cache.get(&key).is_some() {
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::HandledByOtherSendGroupCampaign,
                    "address already handled by a sibling campaign in the send group",
                    None,
                    None,
                )
                .await;
                outcome.skipped += 1;
                return Ok(());
            }
            self.state.cache.set(&key, json!(self.campaign.id), None);
        }

        // optimistic usage log under the short server lock; the transport
        // call happens after the lock is gone
        if self.state.pool.log_usage(&pass.server).await.is_err() {
            self.rollback_ab(&ab_subject).await;
            return Err(BatchAbort::new(
                BatchSignal::LockUnavailable,
                format!("usage lock for server {} unavailable", pass.server.id),
            ));
        }

        self.state.pacer.acquire_one().await;

        let email = OutboundEmail {
            from_name: self.campaign.from_name.clone(),
            from_email: self.campaign.from_email.clone(),
            to_email: subscriber.email.clone(),
            subject: rendered.subject,
            html_body: rendered.html_body,
            plain_text_body: rendered.plain_text_body,
            headers: rendered.headers,
        };

        match self.state.transport.send(&email, &pass.server).await {
            Ok(response) if response.success => {
                self.log(
                    &subscriber,
                    DeliveryStatus::Success,
                    response.raw_response,
                    Some(pass.server.id),
                    ab_subject.as_ref().map(|v| v.id),
                )
                .await;
                if let Err(e) = self
                    .state
                    .store
                    .increment_quota_usage(self.customer.id, 1)
                    .await
                {
                    tracing::warn!("Failed to tally quota usage for customer {}: {e}", self.customer.id);
                }
                self.run_on_sent_actions(&subscriber).await;
                outcome.sent += 1;
                pass.sent_on_server += 1;
                pass.consecutive_failures = 0;
            }
            Ok(response) => {
                self.undo_usage_unless_kept(&pass.server);
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::Giveup,
                    response.raw_response,
                    Some(pass.server.id),
                    None,
                )
                .await;
                outcome.failed += 1;
                pass.consecutive_failures += 1;
            }
            Err(TransportError::Unreachable(message)) => {
                self.undo_usage_unless_kept(&pass.server);
                self.rollback_ab(&ab_subject).await;
                return Err(BatchAbort::new(BatchSignal::TransportUnreachable, message));
            }
            Err(TransportError::HardBounce(message)) => {
                self.undo_usage_unless_kept(&pass.server);
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::FatalError,
                    message,
                    Some(pass.server.id),
                    None,
                )
                .await;
                if let Err(e) = self
                    .state
                    .store
                    .update_subscriber_status(subscriber.id, SubscriberStatus::Blacklisted)
                    .await
                {
                    tracing::warn!("Failed to blacklist subscriber {}: {e}", subscriber.id);
                }
                outcome.failed += 1;
                pass.consecutive_failures += 1;
            }
            Err(TransportError::BuildFailed(message)) => {
                self.state.pool.undo_usage(&pass.server);
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::Error,
                    message,
                    Some(pass.server.id),
                    None,
                )
                .await;
                outcome.failed += 1;
            }
            Err(TransportError::SendFailed(message)) => {
                self.undo_usage_unless_kept(&pass.server);
                self.rollback_ab(&ab_subject).await;
                self.log(
                    &subscriber,
                    DeliveryStatus::Giveup,
                    message,
                    Some(pass.server.id),
                    None,
                )
                .await;
                outcome.failed += 1;
                pass.consecutive_failures += 1;
            }
        }

        if pass.server.pause_after_send_ms > 0 {
            tokio::time::sleep(Duration::from_millis(pass.server.pause_after_send_ms)).await;
        }

        Ok(())
    }

    /// The undo of the optimistic usage log is a customer policy toggle.
    fn undo_usage_unless_kept(&self, server: &DeliveryServer) {
        if !self.customer.keep_usage_on_giveup {
            self.state.pool.undo_usage(server);
        }
    }

    async fn rollback_ab(&self, variant: &Option<AbSubject>) {
        if let Some(variant) = variant {
            if let Err(e) = self
                .state
                .store
                .rollback_ab_subject(self.campaign.id, variant.id)
                .await
            {
                tracing::warn!("Failed to roll back A/B subject {}: {e}", variant.id);
            }
        }
    }

    async fn run_on_sent_actions(&self, subscriber: &Subscriber) {
        for action in &self.campaign.options.on_sent {
            let result = match action {
                OnSentAction::SetField { name, value } => {
                    self.state
                        .store
                        .set_subscriber_field(subscriber.id, name, value)
                        .await
                }
                OnSentAction::MoveToList { list_id } => {
                    self.state.store.move_to_list(subscriber.id, *list_id).await
                }
                OnSentAction::CopyToList { list_id } => self
                    .state
                    .store
                    .copy_to_list(subscriber.id, *list_id)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                tracing::warn!(
                    "On-sent action failed for subscriber {}: {e}",
                    subscriber.id
                );
            }
        }
    }

    async fn log(
        &self,
        subscriber: &Subscriber,
        status: DeliveryStatus,
        message: impl Into<String>,
        server_id: Option<i64>,
        ab_subject_id: Option<i64>,
    ) {
        self.state.tracker.record_delivery(status);
        let mut log = DeliveryLog::new(
            self.campaign.id,
            subscriber.id,
            subscriber.email.clone(),
            status,
            message,
        )
        .with_ab_subject(ab_subject_id);
        if status == DeliveryStatus::Success {
            log = log.with_confirmation();
        }
        if let Some(server_id) = server_id {
            log = log.with_server(server_id);
        }
        if let Err(e) = self.state.store.insert_log(log).await {
            tracing::warn!(
                "Failed to record delivery log for subscriber {}: {e}",
                subscriber.id
            );
        }
    }
}

fn storage(e: anyhow::Error) -> BatchAbort {
    BatchAbort::new(BatchSignal::StorageFailed, e.to_string())
}
