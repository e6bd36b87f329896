use std::{collections::HashMap, sync::RwLock, time::Duration};

use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::model::{DeliveryServer, ServerId};

use super::{DeliveryTransport, OutboundEmail, SendOutcome, TransportError};

const SMTP_TIMEOUT_SECS: u64 = 30;

/// SMTP delivery via lettre. Mailers are built once per server and pooled.
/// lettre has no raw-header API, so the MIME protocol headers built by the
/// renderer are carried for the HTTP transports; SMTP relays add their own.
pub struct SmtpTransport {
    mailers: RwLock<HashMap<ServerId, AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpTransport {
    pub fn new() -> Self {
        Self {
            mailers: RwLock::new(HashMap::new()),
        }
    }

    fn mailer_for(
        &self,
        server: &DeliveryServer,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        if let Some(mailer) = self.mailers.read().unwrap().get(&server.id) {
            return Ok(mailer.clone());
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server.host)
            .map_err(|e| TransportError::Unreachable(format!("smtp transport: {e}")))?
            .port(server.port)
            .timeout(Some(Duration::from_secs(SMTP_TIMEOUT_SECS)));

        if let (Some(username), Some(password)) = (&server.username, &server.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = builder.build();
        self.mailers
            .write()
            .unwrap()
            .insert(server.id, mailer.clone());
        Ok(mailer)
    }

    fn build_message(email: &OutboundEmail) -> Result<Message, TransportError> {
        let from: Mailbox = format!("{} <{}>", email.from_name, email.from_email)
            .parse()
            .map_err(|e| TransportError::BuildFailed(format!("from address: {e}")))?;
        let to: Mailbox = email
            .to_email
            .parse()
            .map_err(|e| TransportError::BuildFailed(format!("to address: {e}")))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(email.plain_text_body.clone()))
                    .singlepart(SinglePart::html(email.html_body.clone())),
            )
            .map_err(|e| TransportError::BuildFailed(e.to_string()))
    }

    fn classify(error: String) -> TransportError {
        let lowered = error.to_ascii_lowercase();
        if lowered.contains("connection")
            || lowered.contains("timed out")
            || lowered.contains("refused")
            || lowered.contains("dns")
        {
            return TransportError::Unreachable(error);
        }
        if error.contains("550")
            || error.contains("5.1.1")
            || lowered.contains("user unknown")
            || lowered.contains("does not exist")
        {
            return TransportError::HardBounce(error);
        }
        TransportError::SendFailed(error)
    }
}

impl Default for SmtpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for SmtpTransport {
    async fn send(
        &self,
        email: &OutboundEmail,
        server: &DeliveryServer,
    ) -> Result<SendOutcome, TransportError> {
        let mailer = self.mailer_for(server)?;
        let message = Self::build_message(email)?;

        match mailer.send(message).await {
            Ok(response) => Ok(SendOutcome {
                success: response.is_positive(),
                message_id: None,
                raw_response: format!("{:?}", response),
            }),
            Err(e) => Err(Self::classify(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(to: &str) -> OutboundEmail {
        OutboundEmail {
            from_name: "Acme".into(),
            from_email: "news@acme.test".into(),
            to_email: to.into(),
            subject: "hi".into(),
            html_body: "<p>hi</p>".into(),
            plain_text_body: "hi".into(),
            headers: vec![],
        }
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let result = SmtpTransport::build_message(&outbound("not-an-address"));
        assert!(matches!(result, Err(TransportError::BuildFailed(_))));
    }

    #[test]
    fn test_build_message_ok() {
        assert!(SmtpTransport::build_message(&outbound("a@x.com")).is_ok());
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            SmtpTransport::classify("Connection refused".into()),
            TransportError::Unreachable(_)
        ));
        assert!(matches!(
            SmtpTransport::classify("550 User unknown".into()),
            TransportError::HardBounce(_)
        ));
        assert!(matches!(
            SmtpTransport::classify("451 try again later".into()),
            TransportError::SendFailed(_)
        ));
    }
}
