use async_trait::async_trait;
use serde_json::json;

use crate::model::DeliveryServer;

use super::{DeliveryTransport, OutboundEmail, SendOutcome, TransportError};

/// JSON-over-HTTP provider integration. The payload shape follows the common
/// "messages" POST endpoint; provider-specific adapters sit behind the same
/// server record via `api_url`.
pub struct HttpApiTransport {
    client: reqwest::Client,
}

impl HttpApiTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpApiTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for HttpApiTransport {
    async fn send(
        &self,
        email: &OutboundEmail,
        server: &DeliveryServer,
    ) -> Result<SendOutcome, TransportError> {
        let url = server
            .api_url
            .as_deref()
            .ok_or_else(|| TransportError::BuildFailed("server has no api_url".to_string()))?;

        let headers: serde_json::Map<String, serde_json::Value> = email
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();

        let payload = json!({
            "from": { "name": email.from_name, "email": email.from_email },
            "to": email.to_email,
            "subject": email.subject,
            "html": email.html_body,
            "text": email.plain_text_body,
            "headers": headers,
        });

        let mut request = self.client.post(url).json(&payload);
        if let Some(key) = &server.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                TransportError::Unreachable(e.to_string())
            } else {
                TransportError::SendFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let message_id = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message_id").and_then(|id| id.as_str()).map(String::from));
            Ok(SendOutcome {
                success: true,
                message_id,
                raw_response: body,
            })
        } else if status.as_u16() == 400 || status.as_u16() == 404 {
            Err(TransportError::HardBounce(format!("{status}: {body}")))
        } else {
            Err(TransportError::SendFailed(format!("{status}: {body}")))
        }
    }
}
