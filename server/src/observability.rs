//! Per-cycle dispatch counters.
//!
//! Cheap atomics every worker bumps as it goes; the engine resets them at
//! cycle start and emits one status line at the end.

use std::sync::{
    atomic::{AtomicUsize, Ordering::Relaxed},
    Arc,
};

use crate::model::DeliveryStatus;

#[derive(Default)]
struct TrackerInner {
    scanned: AtomicUsize,
    admitted: AtomicUsize,
    sent: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    campaigns_sent: AtomicUsize,
    campaigns_requeued: AtomicUsize,
    campaigns_blocked: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct CycleTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub scanned: usize,
    pub admitted: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub campaigns_sent: usize,
    pub campaigns_requeued: usize,
    pub campaigns_blocked: usize,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.inner.scanned.store(0, Relaxed);
        self.inner.admitted.store(0, Relaxed);
        self.inner.sent.store(0, Relaxed);
        self.inner.failed.store(0, Relaxed);
        self.inner.skipped.store(0, Relaxed);
        self.inner.campaigns_sent.store(0, Relaxed);
        self.inner.campaigns_requeued.store(0, Relaxed);
        self.inner.campaigns_blocked.store(0, Relaxed);
    }

    pub fn record_scanned(&self, count: usize) {
        self.inner.scanned.fetch_add(count, Relaxed);
    }

    pub fn record_admitted(&self, count: usize) {
        self.inner.admitted.fetch_add(count, Relaxed);
    }

    pub fn record_delivery(&self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Success => self.inner.sent.fetch_add(1, Relaxed),
            DeliveryStatus::Error
            | DeliveryStatus::FatalError
            | DeliveryStatus::Giveup
            | DeliveryStatus::DomainPolicyReject => self.inner.failed.fetch_add(1, Relaxed),
            DeliveryStatus::Blacklisted
            | DeliveryStatus::Suppressed
            | DeliveryStatus::Blocked
            | DeliveryStatus::HandledByOtherSendGroupCampaign => {
                self.inner.skipped.fetch_add(1, Relaxed)
            }
        };
    }

    pub fn record_campaign_sent(&self) {
        self.inner.campaigns_sent.fetch_add(1, Relaxed);
    }

    pub fn record_campaign_requeued(&self) {
        self.inner.campaigns_requeued.fetch_add(1, Relaxed);
    }

    pub fn record_campaign_blocked(&self) {
        self.inner.campaigns_blocked.fetch_add(1, Relaxed);
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            scanned: self.inner.scanned.load(Relaxed),
            admitted: self.inner.admitted.load(Relaxed),
            sent: self.inner.sent.load(Relaxed),
            failed: self.inner.failed.load(Relaxed),
            skipped: self.inner.skipped.load(Relaxed),
            campaigns_sent: self.inner.campaigns_sent.load(Relaxed),
            campaigns_requeued: self.inner.campaigns_requeued.load(Relaxed),
            campaigns_blocked: self.inner.campaigns_blocked.load(Relaxed),
        }
    }

    pub fn status_line(&self) -> String {
        let s = self.summary();
        format!(
            "Cycle: {} scanned, {} admitted | {} sent, {} failed, {} skipped | campaigns: {} sent, {} requeued, {} blocked",
            s.scanned,
            s.admitted,
            s.sent,
            s.failed,
            s.skipped,
            s.campaigns_sent,
            s.campaigns_requeued,
            s.campaigns_blocked
        )
    }
}
