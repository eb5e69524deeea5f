//! Resend HTTP API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{InboundPage, InboundReply, MailTransport, OutboundEmail};
use crate::error::{PacError, PacResult};

const SERVICE: &str = "Mail provider";

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

pub struct ResendGateway {
    base_url: String,
    api_key: Option<String>,
    from_address: String,
    client: Client,
}

impl ResendGateway {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        from_address: &str,
        timeout: Duration,
    ) -> PacResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacError::Config(format!("failed to build mail client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            from_address: from_address.to_string(),
            client,
        })
    }

    fn authed(&self, rb: RequestBuilder) -> PacResult<RequestBuilder> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PacError::Config("Resend API key is not configured.".into()))?;
        Ok(rb.bearer_auth(key))
    }

    async fn call<T: DeserializeOwned>(&self, rb: RequestBuilder, what: &str) -> PacResult<T> {
        let resp = self.authed(rb)?.send().await.map_err(|err| {
            tracing::warn!(error=%err, operation=what, "mail provider request failed");
            if err.is_timeout() || err.is_connect() {
                PacError::Unavailable { service: SERVICE }
            } else {
                PacError::BadGateway(format!("Failed to {what} via Resend."))
            }
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|_| PacError::BadGateway(format!("Failed to {what} via Resend.")))?;
        if !status.is_success() {
            let detail = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| format!("Failed to {what} via Resend."));
            tracing::warn!(status = status.as_u16(), operation = what, detail = %detail, "mail provider rejected request");
            return Err(PacError::BadGateway(detail));
        }
        serde_json::from_str(&text).map_err(|err| {
            tracing::warn!(error=%err, operation=what, "mail provider returned malformed payload");
            PacError::BadGateway(format!("Invalid response while trying to {what}."))
        })
    }
}

#[async_trait]
impl MailTransport for ResendGateway {
    async fn send(&self, email: &OutboundEmail) -> PacResult<String> {
        let payload = json!({
            "from": self.from_address,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
            "tags": [{"name": "challenge_id", "value": email.challenge_id.to_string()}],
        });
        let rb = self
            .client
            .post(format!("{}/emails", self.base_url))
            .json(&payload);
        let sent: SendResponse = self.call(rb, "send email").await?;
        sent.id
            .ok_or_else(|| PacError::BadGateway("Resend did not return a message id.".into()))
    }

    async fn list_inbound(&self, after: Option<&str>) -> PacResult<InboundPage> {
        let mut rb = self.client.get(format!("{}/emails/receiving", self.base_url));
        if let Some(cursor) = after {
            rb = rb.query(&[("after", cursor)]);
        }
        self.call(rb, "retrieve incoming replies").await
    }

    async fn get_inbound(&self, id: &str) -> PacResult<InboundReply> {
        let rb = self
            .client
            .get(format!("{}/emails/receiving/{}", self.base_url, id));
        self.call(rb, "retrieve received email").await
    }
}
