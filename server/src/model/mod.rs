pub mod campaign;
pub mod customer;
pub mod delivery_log;
pub mod delivery_server;
pub mod subscriber;

pub use campaign::{
    AbSubject, Campaign, CampaignId, CampaignStatus, CampaignType, DeliveryOptions, OnSentAction,
};
pub use customer::{Customer, CustomerId, CustomerStatus};
pub use delivery_log::{DeliveryLog, DeliveryStatus};
pub use delivery_server::{DeliveryServer, DomainPolicy, ServerId, ServerKind, UseFor};
pub use subscriber::{ListId, Subscriber, SubscriberId, SubscriberStatus};
