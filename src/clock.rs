//! Clocking loop: periodically drives ingestion, the bulk flow and dispatch
//! over HTTP with the super-clock secret.

use std::time::Duration;

use reqwest::{Client, Method};
use tokio::task::JoinHandle;

use crate::auth::SUPER_CLOCK_HEADER;
use crate::config::AppConfig;
use crate::error::{PacError, PacResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RetrieveAnswers,
    BulkFlow,
    SendPending,
}

impl Phase {
    pub const ORDER: [Phase; 3] = [Phase::RetrieveAnswers, Phase::BulkFlow, Phase::SendPending];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::RetrieveAnswers => "retrieve-answers",
            Phase::BulkFlow => "email-agentic-flow-all",
            Phase::SendPending => "send-all-pending-emails",
        }
    }
}

/// Outcome of one phase within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub phase: Phase,
    pub ok: bool,
    pub message: String,
}

pub struct Clock {
    client: Client,
    monitoring_url: String,
    agentic_url: String,
    token: Option<String>,
    interval: Duration,
}

impl Clock {
    pub fn new(
        monitoring_url: &str,
        agentic_url: &str,
        token: Option<String>,
        interval: Duration,
        timeout: Duration,
    ) -> PacResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacError::Config(format!("failed to build clock client: {e}")))?;
        Ok(Self {
            client,
            monitoring_url: monitoring_url.trim_end_matches('/').to_string(),
            agentic_url: agentic_url.trim_end_matches('/').to_string(),
            token,
            interval,
        })
    }

    pub fn from_config(config: &AppConfig) -> PacResult<Self> {
        Self::new(
            &config.clock.monitoring_url,
            &config.clock.agentic_url,
            config.super_clock_token.clone(),
            config.clock.interval,
            config.timeouts.clock,
        )
    }

    fn request(&self, phase: Phase) -> (Method, String) {
        match phase {
            Phase::RetrieveAnswers => (
                Method::GET,
                format!("{}/retrieve-answers", self.monitoring_url),
            ),
            Phase::BulkFlow => (
                Method::POST,
                format!("{}/email-agentic-flow-all", self.agentic_url),
            ),
            Phase::SendPending => (
                Method::POST,
                format!("{}/send-all-pending-emails", self.monitoring_url),
            ),
        }
    }

    /// Run the three phases in order. A failed phase does not stop the next
    /// one. Without a token the cycle is skipped and nothing is returned.
    pub async fn run_cycle(&self) -> Vec<PhaseResult> {
        let Some(token) = self.token.as_deref() else {
            tracing::error!("SUPER_CLOCK_TOKEN is not set; skipping polling cycle");
            return Vec::new();
        };

        let mut results = Vec::with_capacity(Phase::ORDER.len());
        for phase in Phase::ORDER {
            let (method, url) = self.request(phase);
            let result = match self
                .client
                .request(method, &url)
                .header(SUPER_CLOCK_HEADER, token)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let message = resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                        .unwrap_or_else(|| "ok".to_string());
                    tracing::info!(phase = phase.name(), message = %message, "clock phase finished");
                    PhaseResult {
                        phase,
                        ok: true,
                        message,
                    }
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    tracing::warn!(phase = phase.name(), status, body = %body, "clock phase failed");
                    PhaseResult {
                        phase,
                        ok: false,
                        message: body,
                    }
                }
                Err(err) => {
                    tracing::warn!(phase = phase.name(), error = %err, "clock phase request error");
                    PhaseResult {
                        phase,
                        ok: false,
                        message: err.to_string(),
                    }
                }
            };
            results.push(result);
        }
        results
    }

    /// Run cycles forever on the configured interval. The first cycle starts
    /// one interval after spawning so the server is up by then.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "clock started");
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }
}
