//! Challenge orchestrator: answers the participant's latest reply.
//!
//! A run reads the chain, asks the agent pipeline for a verdict and a reply,
//! stores the reply as a PENDING AI email and moves the challenge head. The
//! reply goes out on the next dispatch pass.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::agents::{AgentPipeline, DraftedEmail};
use crate::auth::Caller;
use crate::chain::ExchangeChain;
use crate::error::{PacError, PacResult};
use crate::model::{
    Challenge, ChallengeFilter, ChallengeStatus, ChallengeUpdate, Email, EmailDraft, EmailRole,
    EmailStatus, Scenario,
};
use crate::store::Store;
use crate::util::BatchReport;

const FALLBACK_BODY: &str = "Thank you for your response. Expect further instructions soon.";

/// Result of one flow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowOutcome {
    pub email_id: Uuid,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub challenge_status: ChallengeStatus,
    pub score: Option<u8>,
}

/// Everything a run needs once the preconditions hold.
struct FlowContext {
    challenge: Challenge,
    scenario: Scenario,
    head: Email,
    previous: Option<Email>,
}

#[derive(Clone)]
pub struct ChallengeOrchestrator {
    store: Arc<dyn Store>,
    chain: ExchangeChain,
    agents: AgentPipeline,
}

impl ChallengeOrchestrator {
    pub fn new(store: Arc<dyn Store>, agents: AgentPipeline) -> Self {
        let chain = ExchangeChain::new(store.clone());
        Self {
            store,
            chain,
            agents,
        }
    }

    async fn load_context(&self, caller: &Caller, challenge_id: Uuid) -> PacResult<FlowContext> {
        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await?
            .ok_or_else(|| PacError::NotFound("Challenge not found.".into()))?;
        if let Caller::Member(member) = caller {
            if challenge.user_id != member.user_id {
                return Err(PacError::Forbidden(
                    "Users can only trigger flows for their own challenges.".into(),
                ));
            }
        }
        if challenge.status != ChallengeStatus::Ongoing {
            return Err(PacError::InvalidState(
                "Challenge must be ongoing to run the agentic flow.".into(),
            ));
        }

        let scenario = match (self.store.get_scenario(challenge.scenario_id).await?, caller) {
            (Some(s), Caller::Member(m)) if s.organization_id == m.organization_id => s,
            (Some(s), Caller::Clock) => s,
            _ => return Err(PacError::NotFound("Scenario not found.".into())),
        };

        let head_id = challenge.last_exchange_id.ok_or_else(|| {
            PacError::InvalidState("Challenge has no exchanges yet.".into())
        })?;
        let head = self
            .store
            .get_email(head_id)
            .await?
            .ok_or_else(|| PacError::NotFound("Last email not found.".into()))?;
        if head.status != Some(EmailStatus::Received) {
            return Err(PacError::InvalidState(
                "Latest email must be marked as received.".into(),
            ));
        }
        if head.role != EmailRole::User {
            return Err(PacError::InvalidState(
                "Latest email must come from the user.".into(),
            ));
        }

        let previous = match head.previous_email {
            Some(id) => self.store.get_email(id).await?,
            None => None,
        };
        Ok(FlowContext {
            challenge,
            scenario,
            head,
            previous,
        })
    }

    /// Answer the head reply of one challenge.
    pub async fn run_email_flow(&self, caller: &Caller, challenge_id: Uuid) -> PacResult<FlowOutcome> {
        let FlowContext {
            challenge,
            scenario,
            head,
            previous,
        } = self.load_context(caller, challenge_id).await?;

        let history = self.chain.get_chain(head.id).await?;
        let outcome = self.agents.run(&scenario, &history, &head).await?;
        let decision = outcome.decision;

        let draft = reply_draft(&challenge, &head, previous.as_ref(), outcome.draft);
        let email = self.chain.append_email(draft).await?;

        let update = ChallengeUpdate::outcome(decision.status, decision.score)
            .with_head(email.id)
            .expecting(head.id);
        let (challenge_status, score) = match self.store.update_challenge(challenge.id, update).await {
            Ok(Some(updated)) => {
                let score = if updated.status.is_terminal() {
                    updated.score.or(decision.score)
                } else {
                    None
                };
                (updated.status, score)
            }
            Ok(None) => {
                tracing::warn!(
                    challenge_id=%challenge.id,
                    email_id=%email.id,
                    "challenge head moved during flow; reply left unlinked"
                );
                (decision.status, decision.score)
            }
            Err(err) => {
                tracing::warn!(
                    challenge_id=%challenge.id,
                    email_id=%email.id,
                    error=%err,
                    "challenge update failed after reply was stored"
                );
                (decision.status, decision.score)
            }
        };

        tracing::info!(
            challenge_id=%challenge.id,
            email_id=%email.id,
            status=%challenge_status,
            score=?score,
            "email flow completed"
        );
        Ok(FlowOutcome {
            email_id: email.id,
            subject: email.subject,
            body: email.body,
            challenge_status,
            score,
        })
    }

    /// Run the flow for every ongoing challenge with a head, one at a time.
    pub async fn run_all(&self) -> PacResult<BatchReport> {
        let challenges = self
            .store
            .list_challenges(&ChallengeFilter {
                status: Some(ChallengeStatus::Ongoing),
                ..Default::default()
            })
            .await?;
        let mut report = BatchReport::default();

        for challenge in challenges.iter().filter(|c| c.last_exchange_id.is_some()) {
            match self.run_email_flow(&Caller::Clock, challenge.id).await {
                Ok(_) => report.record_success(),
                Err(PacError::InvalidState(reason)) => {
                    tracing::debug!(challenge_id=%challenge.id, reason=%reason, "challenge not ready for a reply");
                    report.record_skip();
                }
                Err(err) => {
                    tracing::warn!(challenge_id=%challenge.id, error=%err, "email flow failed");
                    report.record_failure(challenge.id, &err);
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed(),
            "bulk email flow finished"
        );
        Ok(report)
    }

    /// Ask the model for a scenario's opening email. Nothing is stored.
    pub async fn generate_hook_email(
        &self,
        organization_id: Uuid,
        scenario_id: Uuid,
    ) -> PacResult<DraftedEmail> {
        let scenario = match self.store.get_scenario(scenario_id).await? {
            Some(s) if s.organization_id == organization_id => s,
            _ => return Err(PacError::NotFound("Scenario not found.".into())),
        };
        self.agents.generate_hook(&scenario).await
    }
}

fn reply_draft(
    challenge: &Challenge,
    head: &Email,
    previous: Option<&Email>,
    drafted: DraftedEmail,
) -> EmailDraft {
    let subject = Some(drafted.subject)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| previous.and_then(|p| p.subject.clone()))
        .or_else(|| head.subject.clone());
    let body = if drafted.body.trim().is_empty() {
        FALLBACK_BODY.to_string()
    } else {
        drafted.body
    };
    let sender_email = previous
        .map(|p| p.sender_email.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(&head.sender_email)
        .to_string();

    EmailDraft {
        id: None,
        scenario_id: head.scenario_id,
        role: EmailRole::Ai,
        target_id: head.target_id,
        previous_email: Some(head.id),
        subject,
        sender_email,
        language: head.language.clone(),
        body: Some(body),
        variables: None,
        status: Some(EmailStatus::Pending),
        challenge_id: Some(challenge.id),
        created_at: None,
    }
}
