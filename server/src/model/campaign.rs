use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::customer::CustomerId;
use super::subscriber::{ListId, Subscriber};

pub type CampaignId = i64;

/// Campaign lifecycle states. Every status write in the engine goes through
/// [`CampaignStatus::can_transition`], so an invalid edge is a bug surfaced at
/// the call site instead of a silently corrupted campaign.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CampaignStatus {
    Draft,
    PendingSending,
    Sending,
    Processing,
    Paused,
    Blocked,
    Sent,
}

impl CampaignStatus {
    /// Whether this state may move to `to`.
    ///
    /// `Processing` is transient: a worker owns the campaign and must always
    /// hand it back to `Sending` (or finalize it) before letting go.
    pub fn can_transition(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, to) {
            (Draft, PendingSending) => true,
            (PendingSending, Sending | Processing | Paused | Blocked) => true,
            (Sending, Processing | Paused | Blocked) => true,
            (Processing, Sending | Sent | Paused | Blocked) => true,
            (Paused, Sending | PendingSending) => true,
            (Blocked, Sending) => true,
            // recurring campaigns are rescheduled after finalization
            (Sent, PendingSending) => true,
            _ => false,
        }
    }

    /// States the eligibility scanner considers sendable.
    pub fn is_sendable(self) -> bool {
        matches!(self, CampaignStatus::Sending | CampaignStatus::PendingSending)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Regular,
    Autoresponder,
}

/// One subject line competing in an A/B test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbSubject {
    pub id: i64,
    pub subject: String,
    #[serde(default)]
    pub usage_count: u64,
}

/// Action applied to a subscriber after a successful send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSentAction {
    SetField { name: String, value: String },
    MoveToList { list_id: ListId },
    CopyToList { list_id: ListId },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryOptions {
    pub open_tracking: bool,
    pub click_tracking: bool,
    /// Hard cap on total deliveries for this campaign across all runs.
    pub max_send_count: Option<u64>,
    /// Rolling window (hours since subscription) a recipient must be inside.
    pub timewarp_hours: Option<i64>,
    pub ab_subjects: Vec<AbSubject>,
    pub max_giveup_retries: u32,
    pub giveup_counter: u32,
    /// Campaign keeps a materialized queue of pending recipient ids that is
    /// repopulated at admission time.
    pub use_queue_table: bool,
    pub on_sent: Vec<OnSentAction>,
    /// Custom headers attached to every send; values go through tag
    /// substitution.
    pub custom_headers: Vec<(String, String)>,
    /// Regular campaigns only: reschedule this many hours after finalization.
    pub recurring_every_hours: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub kind: CampaignType,
    pub status: CampaignStatus,
    pub send_at: DateTime<Utc>,
    /// Lower sorts first.
    pub priority: i32,
    pub customer_id: CustomerId,
    pub list_id: ListId,
    /// Send group: campaigns sharing a group id never duplicate-send to the
    /// same address within a run.
    pub group_id: Option<String>,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub html_template: String,
    pub plain_template: String,
    #[serde(default)]
    pub options: DeliveryOptions,
}

impl Campaign {
    pub fn is_autoresponder(&self) -> bool {
        self.kind == CampaignType::Autoresponder
    }

    /// Time-warp check: with a window configured, only subscribers whose
    /// subscription is at most `timewarp_hours` old are considered.
    pub fn in_timewarp_window(&self, subscriber: &Subscriber, now: DateTime<Utc>) -> bool {
        match self.options.timewarp_hours {
            Some(hours) => now - subscriber.subscribed_at <= Duration::hours(hours),
            None => true,
        }
    }
}
