use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type SubscriberId = i64;
pub type ListId = i64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Confirmed,
    Unconfirmed,
    Unsubscribed,
    Blacklisted,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub list_id: ListId,
    pub email: String,
    pub status: SubscriberStatus,
    /// Custom field values exposed to templates (fname, city, ...).
    #[serde(default)]
    pub fields: HashMap<String, String>,
    pub subscribed_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn domain(&self) -> Option<String> {
        lib_addr::domain_of(&self.email)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == SubscriberStatus::Confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain() {
        let sub = Subscriber {
            id: 1,
            list_id: 1,
            email: "User@Example.COM".into(),
            status: SubscriberStatus::Confirmed,
            fields: HashMap::new(),
            subscribed_at: Utc::now(),
        };
        assert_eq!(sub.domain(), Some("example.com".to_string()));
    }
}
