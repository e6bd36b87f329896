//! Content rendering collaborator.
//!
//! The dispatch core only needs a `{subject, html, plain, headers}` tuple per
//! subscriber and the fact that producing it can fail. `TemplateRenderer` is
//! the bundled implementation; campaign subject/body templates and custom
//! header values all go through the same tag substitution.

use std::collections::HashMap;

use async_trait::async_trait;
use minijinja::Environment;
use serde_json::{Map, Value};

use crate::{
    engine_config::UrlConfig,
    model::{Campaign, DeliveryServer, Subscriber},
};

#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
    pub plain_text_body: String,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait ContentRenderer: Send + Sync {
    /// Produce the final email for one subscriber. `subject_override` carries
    /// the A/B variant subject when the campaign runs a subject test.
    async fn render(
        &self,
        campaign: &Campaign,
        subscriber: &Subscriber,
        server: &DeliveryServer,
        subject_override: Option<&str>,
    ) -> anyhow::Result<RenderedEmail>;
}

pub struct TemplateRenderer {
    urls: UrlConfig,
}

impl TemplateRenderer {
    pub fn new(urls: UrlConfig) -> Self {
        Self { urls }
    }

    fn context(&self, campaign: &Campaign, subscriber: &Subscriber) -> Value {
        let mut ctx = Map::new();
        for (name, value) in &subscriber.fields {
            ctx.insert(name.clone(), Value::String(value.clone()));
        }
        ctx.insert("email".into(), Value::String(subscriber.email.clone()));
        ctx.insert("campaign_name".into(), Value::String(campaign.name.clone()));
        ctx.insert(
            "unsubscribe_url".into(),
            Value::String(self.unsubscribe_url(campaign, subscriber)),
        );
        Value::Object(ctx)
    }

    fn unsubscribe_url(&self, campaign: &Campaign, subscriber: &Subscriber) -> String {
        format!(
            "{}/{}/{}",
            self.urls.unsubscribe_base_url.trim_end_matches('/'),
            campaign.id,
            subscriber.id
        )
    }

    /// Protocol headers for one send: unsubscribe, abuse reporting,
    /// feedback id, list id, then the campaign's custom headers with tags
    /// substituted.
    fn build_headers(
        &self,
        env: &Environment,
        campaign: &Campaign,
        subscriber: &Subscriber,
        ctx: &Value,
    ) -> anyhow::Result<Vec<(String, String)>> {
        let mut headers = vec![
            (
                "List-Unsubscribe".to_string(),
                format!(
                    "<mailto:{}?subject=unsubscribe>, <{}>",
                    campaign.from_email,
                    self.unsubscribe_url(campaign, subscriber)
                ),
            ),
            (
                "List-Unsubscribe-Post".to_string(),
                "List-Unsubscribe=One-Click".to_string(),
            ),
            (
                "List-Id".to_string(),
                format!("{} <list-{}.localhost>", campaign.list_id, campaign.list_id),
            ),
            (
                "Feedback-ID".to_string(),
                format!(
                    "{}:{}:campaign",
                    campaign.id, campaign.customer_id
                ),
            ),
            (
                "X-Report-Abuse-To".to_string(),
                self.urls.abuse_report_email.clone(),
            ),
        ];

        for (name, value_template) in &campaign.options.custom_headers {
            let value = env.render_str(value_template, ctx)?;
            headers.push((name.clone(), value));
        }

        Ok(headers)
    }
}

#[async_trait]
impl ContentRenderer for TemplateRenderer {
    async fn render(
        &self,
        campaign: &Campaign,
        subscriber: &Subscriber,
        _server: &DeliveryServer,
        subject_override: Option<&str>,
    ) -> anyhow::Result<RenderedEmail> {
        let env = Environment::new();
        let ctx = self.context(campaign, subscriber);

        let subject_template = subject_override.unwrap_or(&campaign.subject);
        let subject = env.render_str(subject_template, &ctx)?;
        let html_body = env.render_str(&campaign.html_template, &ctx)?;
        let plain_text_body = env.render_str(&campaign.plain_template, &ctx)?;
        let headers = self.build_headers(&env, campaign, subscriber, &ctx)?;

        Ok(RenderedEmail {
            subject,
            html_body,
            plain_text_body,
            headers,
        })
    }
}

/// Context for the "campaign sent" stats summary.
#[derive(Debug, serde::Serialize)]
pub struct CampaignStats {
    pub campaign_name: String,
    pub delivered: usize,
    pub failed: usize,
    pub total_logged: usize,
}

pub const CAMPAIGN_STATS_TEMPLATE: &str = "\
Campaign \"{{ campaign_name }}\" finished sending.

Delivered: {{ delivered }}
Failed:    {{ failed }}
Logged:    {{ total_logged }}
";

pub fn render_stats_summary(stats: &CampaignStats) -> anyhow::Result<String> {
    let env = Environment::new();
    Ok(env.render_str(CAMPAIGN_STATS_TEMPLATE, stats)?)
}
