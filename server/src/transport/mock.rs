//! Scripted transport for tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering::Relaxed},
    Mutex,
};

use async_trait::async_trait;

use crate::model::{DeliveryServer, ServerId};

use super::{DeliveryTransport, OutboundEmail, SendOutcome, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    FailSend,
    HardBounce,
    Unreachable,
}

/// Records every accepted send and follows a per-server behavior script,
/// defaulting to success.
pub struct MockTransport {
    default_behavior: MockBehavior,
    per_server: Mutex<Vec<(ServerId, MockBehavior)>>,
    sent: Mutex<Vec<OutboundEmail>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::Succeed)
    }

    pub fn with_behavior(default_behavior: MockBehavior) -> Self {
        Self {
            default_behavior,
            per_server: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_server_behavior(&self, server_id: ServerId, behavior: MockBehavior) {
        self.per_server.lock().unwrap().push((server_id, behavior));
    }

    /// Total transport calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Relaxed)
    }

    /// Addresses that were actually accepted.
    pub fn delivered_to(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|email| email.to_email.clone())
            .collect()
    }

    pub fn sent_emails(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    fn behavior_for(&self, server_id: ServerId) -> MockBehavior {
        self.per_server
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == server_id)
            .map(|(_, behavior)| *behavior)
            .unwrap_or(self.default_behavior)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for MockTransport {
    async fn send(
        &self,
        email: &OutboundEmail,
        server: &DeliveryServer,
    ) -> Result<SendOutcome, TransportError> {
        self.calls.fetch_add(1, Relaxed);
        match self.behavior_for(server.id) {
            MockBehavior::Succeed => {
                self.sent.lock().unwrap().push(email.clone());
                Ok(SendOutcome {
                    success: true,
                    message_id: Some(format!("mock-{}", self.calls())),
                    raw_response: "250 OK".to_string(),
                })
            }
            MockBehavior::FailSend => {
                Err(TransportError::SendFailed("451 try again later".to_string()))
            }
            MockBehavior::HardBounce => {
                Err(TransportError::HardBounce("550 user unknown".to_string()))
            }
            MockBehavior::Unreachable => {
                Err(TransportError::Unreachable("connection refused".to_string()))
            }
        }
    }
}
