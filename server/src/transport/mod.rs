//! Delivery transport collaborator.
//!
//! `DeliveryTransport` is what the batch processor calls to actually move an
//! email; `TransportRouter` dispatches to the SMTP or HTTP implementation
//! based on the delivery server's kind. A thrown `Unreachable` means the
//! server itself is unusable and aborts the batch; everything else is a
//! per-send failure the loop absorbs.

pub mod http_api;
#[cfg(test)]
pub mod mock;
pub mod smtp;

use async_trait::async_trait;
use derive_more::Display;

use crate::model::{DeliveryServer, ServerKind};

pub use http_api::HttpApiTransport;
pub use smtp::SmtpTransport;

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from_name: String,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub html_body: String,
    pub plain_text_body: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub raw_response: String,
}

#[derive(Debug, Display)]
pub enum TransportError {
    /// One send failed; the recipient may be retried later.
    #[display("send failed: {_0}")]
    SendFailed(String),
    /// The recipient is permanently undeliverable (hard bounce).
    #[display("hard bounce: {_0}")]
    HardBounce(String),
    /// The server itself is unusable; batch-fatal.
    #[display("server unreachable: {_0}")]
    Unreachable(String),
    /// The message could not even be constructed.
    #[display("message build failed: {_0}")]
    BuildFailed(String),
}

impl std::error::Error for TransportError {}

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(
        &self,
        email: &OutboundEmail,
        server: &DeliveryServer,
    ) -> Result<SendOutcome, TransportError>;
}

/// Routes each send to the implementation matching the server's kind.
pub struct TransportRouter {
    smtp: SmtpTransport,
    http: HttpApiTransport,
}

impl TransportRouter {
    pub fn new() -> Self {
        Self {
            smtp: SmtpTransport::new(),
            http: HttpApiTransport::new(),
        }
    }
}

impl Default for TransportRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for TransportRouter {
    async fn send(
        &self,
        email: &OutboundEmail,
        server: &DeliveryServer,
    ) -> Result<SendOutcome, TransportError> {
        match server.kind {
            ServerKind::Smtp => self.smtp.send(email, server).await,
            ServerKind::HttpApi => self.http.send(email, server).await,
        }
    }
}
