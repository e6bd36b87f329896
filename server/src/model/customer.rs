use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type CustomerId = i64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Inactive,
}

/// Tenant owning campaigns and lists. The sending quota is shared by all of
/// the customer's campaigns within a dispatch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub status: CustomerStatus,
    /// Absolute sending cap; `None` means unlimited.
    pub sending_quota: Option<u64>,
    /// Optional cap on deliveries within any rolling hour.
    pub hourly_quota: Option<u64>,
    /// Per-customer override of the engine-wide subscribers-at-once setting.
    pub subscribers_at_once: Option<usize>,
    /// Policy toggle: keep the optimistic server usage log even when the send
    /// ends as a giveup.
    #[serde(default)]
    pub keep_usage_on_giveup: bool,
    /// Address to receive the "campaign sent" stats summary, when wanted.
    pub notify_on_campaign_sent: Option<String>,
}

impl Customer {
    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }

    pub fn is_over_quota(&self, usage: u64) -> bool {
        match self.sending_quota {
            Some(total) => usage >= total,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_quota() {
        let mut customer = Customer {
            id: 1,
            name: "acme".into(),
            status: CustomerStatus::Active,
            sending_quota: Some(10),
            hourly_quota: None,
            subscribers_at_once: None,
            keep_usage_on_giveup: false,
            notify_on_campaign_sent: None,
        };
        assert!(!customer.is_over_quota(9));
        assert!(customer.is_over_quota(10));
        customer.sending_quota = None;
        assert!(!customer.is_over_quota(u64::MAX));
    }
}
