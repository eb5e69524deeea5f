//! Transactional email provider seam.
//!
//! Outbound sends and inbound reply listing go through [`MailTransport`];
//! [`resend::ResendGateway`] is the production implementation.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::PacResult;

pub mod resend;

pub use resend::ResendGateway;

/// A message ready to hand to the provider. `html` already carries the
/// challenge marker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub challenge_id: Uuid,
}

/// One entry of an inbound listing page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundSummary {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundPage {
    #[serde(default)]
    pub data: Vec<InboundSummary>,
    #[serde(default)]
    pub has_more: bool,
}

/// Full detail of one inbound reply.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundReply {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one message; returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> PacResult<String>;

    /// One page of inbound replies, newest first, strictly after `after`.
    async fn list_inbound(&self, after: Option<&str>) -> PacResult<InboundPage>;

    async fn get_inbound(&self, id: &str) -> PacResult<InboundReply>;
}
