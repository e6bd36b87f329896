use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type ServerId = i64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Smtp,
    HttpApi,
}

/// What a server may be used for. `All` covers every purpose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UseFor {
    All,
    Campaigns,
    Transactional,
    Reports,
}

impl UseFor {
    pub fn covers(self, wanted: UseFor) -> bool {
        self == UseFor::All || self == wanted
    }
}

/// Per-server restriction on recipient domains. Entries match the domain
/// itself and any subdomain of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainPolicy {
    #[default]
    AllowAll,
    Allow(Vec<String>),
    Deny(Vec<String>),
}

impl DomainPolicy {
    pub fn allows(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let matches = |entries: &[String]| {
            entries.iter().any(|entry| {
                let entry = entry.to_ascii_lowercase();
                domain == entry || domain.ends_with(&format!(".{entry}"))
            })
        };
        match self {
            DomainPolicy::AllowAll => true,
            DomainPolicy::Allow(entries) => matches(entries),
            DomainPolicy::Deny(entries) => !matches(entries),
        }
    }
}

/// An outbound sending endpoint. Connection details cover both kinds; only
/// the fields matching `kind` are consulted by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryServer {
    pub id: ServerId,
    pub name: String,
    pub kind: ServerKind,
    #[serde(default = "default_use_for")]
    pub use_for: UseFor,
    /// Deliveries allowed per calendar day; `None` means unmetered.
    pub daily_quota: Option<u64>,
    /// Rate-limit pause honored between sends.
    #[serde(default)]
    pub pause_after_send_ms: u64,
    #[serde(default)]
    pub domain_policy: DomainPolicy,
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

fn default_use_for() -> UseFor {
    UseFor::All
}

fn default_smtp_port() -> u16 {
    587
}

impl DeliveryServer {
    pub fn accepts_domain(&self, domain: &str) -> bool {
        self.domain_policy.allows(domain)
    }
}
