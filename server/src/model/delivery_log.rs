use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::campaign::CampaignId;
use super::delivery_server::ServerId;
use super::subscriber::SubscriberId;

/// Outcome recorded for one (campaign, subscriber) send attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Error,
    FatalError,
    Blacklisted,
    Suppressed,
    Blocked,
    DomainPolicyReject,
    Giveup,
    HandledByOtherSendGroupCampaign,
}

impl DeliveryStatus {
    /// Giveup rows are purged before a retry pass; everything else stands.
    pub fn is_retryable(self) -> bool {
        self == DeliveryStatus::Giveup
    }
}

/// Append-only audit row. The mere existence of a row for a (campaign,
/// subscriber) pair is the de-duplication key for subsequent batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub email: String,
    pub status: DeliveryStatus,
    pub message: String,
    pub server_id: Option<ServerId>,
    pub ab_subject_id: Option<i64>,
    /// Set once the delivery server acknowledged the send.
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn new(
        campaign_id: CampaignId,
        subscriber_id: SubscriberId,
        email: impl Into<String>,
        status: DeliveryStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            campaign_id,
            subscriber_id,
            email: email.into(),
            status,
            message: message.into(),
            server_id: None,
            ab_subject_id: None,
            confirmed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_ab_subject(mut self, subject_id: Option<i64>) -> Self {
        self.ab_subject_id = subject_id;
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.confirmed = true;
        self
    }
}
