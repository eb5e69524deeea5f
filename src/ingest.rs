//! Reply ingestion loop.
//!
//! Pages through the provider's inbound mailbox newest first, turning each
//! reply into a RECEIVED USER email until the newest reply already stored
//! (the watermark) shows up again.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::auth::Caller;
use crate::chain::ExchangeChain;
use crate::error::PacResult;
use crate::gateway::{InboundReply, MailTransport};
use crate::marker;
use crate::model::{ChallengeStatus, Email, EmailDraft, EmailRole, EmailStatus};
use crate::store::Store;
use crate::util::parse_timestamp;

/// Why a reply was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadId,
    NoMarker,
    BadTimestamp,
    NoPreviousEmail,
    ForeignScenario,
    ForeignMember,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::BadId => "bad_id",
            DropReason::NoMarker => "no_marker",
            DropReason::BadTimestamp => "bad_timestamp",
            DropReason::NoPreviousEmail => "no_previous_email",
            DropReason::ForeignScenario => "foreign_scenario",
            DropReason::ForeignMember => "foreign_member",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Replies that created a new row.
    pub stored: usize,
    pub dropped: usize,
    /// Replies that could not be fetched or written.
    pub errors: usize,
    pub pages: usize,
    pub reached_watermark: bool,
}

enum Outcome {
    Stored { created: bool },
    Dropped(DropReason),
}

#[derive(Clone)]
pub struct ReplyIngestor {
    store: Arc<dyn Store>,
    mail: Arc<dyn MailTransport>,
    chain: ExchangeChain,
}

impl ReplyIngestor {
    pub fn new(store: Arc<dyn Store>, mail: Arc<dyn MailTransport>) -> Self {
        let chain = ExchangeChain::new(store.clone());
        Self { store, mail, chain }
    }

    /// Run one ingestion pass. Only listing failures abort the pass; a reply
    /// that cannot be processed is logged and skipped.
    pub async fn retrieve_answers(&self, caller: &Caller) -> PacResult<IngestReport> {
        let watermark = self.store.latest_received_email().await?.map(|e| e.id);
        let mut report = IngestReport::default();
        let mut cursor: Option<String> = None;

        'pages: loop {
            let page = self.mail.list_inbound(cursor.as_deref()).await?;
            report.pages += 1;
            if page.data.is_empty() {
                break;
            }

            for summary in &page.data {
                let provider_id = summary.id.trim();
                let Ok(reply_id) = Uuid::parse_str(provider_id) else {
                    tracing::debug!(provider_id, reason = %DropReason::BadId, "dropped inbound reply");
                    report.dropped += 1;
                    continue;
                };
                if Some(reply_id) == watermark {
                    report.reached_watermark = true;
                    break 'pages;
                }

                match self.ingest_one(caller, reply_id).await {
                    Ok(Outcome::Stored { created }) => {
                        if created {
                            report.stored += 1;
                        }
                    }
                    Ok(Outcome::Dropped(reason)) => {
                        tracing::debug!(provider_id, reason = %reason, "dropped inbound reply");
                        report.dropped += 1;
                    }
                    Err(err) => {
                        tracing::warn!(provider_id, error = %err, "failed to ingest inbound reply");
                        report.errors += 1;
                    }
                }
            }

            if !page.has_more {
                break;
            }
            match page.data.last() {
                Some(last) => cursor = Some(last.id.clone()),
                None => break,
            }
        }

        tracing::info!(
            stored = report.stored,
            dropped = report.dropped,
            errors = report.errors,
            pages = report.pages,
            "reply ingestion finished"
        );
        Ok(report)
    }

    async fn ingest_one(&self, caller: &Caller, reply_id: Uuid) -> PacResult<Outcome> {
        // A stored reply keeps its links; looking it up again would find
        // the row itself as its own previous email.
        if self.store.get_email(reply_id).await?.is_some() {
            return Ok(Outcome::Stored { created: false });
        }
        let reply = self.mail.get_inbound(&reply_id.to_string()).await?;

        let Some(challenge_id) = marker::extract_challenge_id(reply.html.as_deref()) else {
            return Ok(Outcome::Dropped(DropReason::NoMarker));
        };
        let Some(replied_at) = reply.created_at.as_deref().and_then(parse_timestamp) else {
            return Ok(Outcome::Dropped(DropReason::BadTimestamp));
        };
        let Some(previous) = self
            .store
            .latest_email_before(challenge_id, replied_at)
            .await?
        else {
            return Ok(Outcome::Dropped(DropReason::NoPreviousEmail));
        };

        if let Some(reason) = self.tenant_mismatch(caller, &previous).await? {
            return Ok(Outcome::Dropped(reason));
        }

        let draft = reply_draft(reply_id, &reply, &previous, replied_at);
        let (stored, created) = self.store.upsert_email(draft).await?;
        tracing::info!(
            email_id = %stored.id,
            challenge_id = ?stored.challenge_id,
            previous_email = %previous.id,
            created,
            "stored inbound reply"
        );

        if let Some(challenge_id) = stored.challenge_id {
            if let Err(err) = self
                .maybe_advance_head(challenge_id, &previous, stored.id)
                .await
            {
                tracing::warn!(
                    email_id = %stored.id,
                    challenge_id = %challenge_id,
                    error = %err,
                    "stored inbound reply but could not advance challenge head"
                );
            }
        }
        Ok(Outcome::Stored { created })
    }

    /// Cross-tenant safety net. Members only see their organization; the
    /// clock still requires the scenario and the target to agree.
    async fn tenant_mismatch(
        &self,
        caller: &Caller,
        previous: &Email,
    ) -> PacResult<Option<DropReason>> {
        let Some(scenario) = self.store.get_scenario(previous.scenario_id).await? else {
            return Ok(Some(DropReason::ForeignScenario));
        };
        let organization_id = caller
            .organization_id()
            .unwrap_or(scenario.organization_id);
        if scenario.organization_id != organization_id {
            return Ok(Some(DropReason::ForeignScenario));
        }
        if let Some(target_id) = previous.target_id {
            match self.store.get_member(target_id).await? {
                Some(member) if member.organization_id == organization_id => {}
                _ => return Ok(Some(DropReason::ForeignMember)),
            }
        }
        Ok(None)
    }

    async fn maybe_advance_head(
        &self,
        challenge_id: Uuid,
        previous: &Email,
        reply_id: Uuid,
    ) -> PacResult<()> {
        let Some(challenge) = self.store.get_challenge(challenge_id).await? else {
            return Ok(());
        };
        if challenge.status != ChallengeStatus::Ongoing
            || challenge.last_exchange_id != Some(previous.id)
        {
            return Ok(());
        }
        self.chain
            .advance_challenge_head(challenge_id, reply_id, Some(previous.id))
            .await?;
        Ok(())
    }
}

fn reply_draft(
    reply_id: Uuid,
    reply: &InboundReply,
    previous: &Email,
    replied_at: chrono::DateTime<chrono::Utc>,
) -> EmailDraft {
    let body = reply
        .html
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(reply.text.as_deref())
        .unwrap_or("")
        .to_string();
    EmailDraft {
        id: Some(reply_id),
        scenario_id: previous.scenario_id,
        role: EmailRole::User,
        target_id: previous.target_id,
        previous_email: Some(previous.id),
        subject: reply.subject.clone(),
        sender_email: reply.from.clone().unwrap_or_default(),
        language: previous.language.clone(),
        body: Some(body),
        variables: None,
        status: Some(EmailStatus::Received),
        challenge_id: previous.challenge_id,
        created_at: Some(replied_at),
    }
}
