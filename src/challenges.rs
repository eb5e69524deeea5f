//! Challenge lifecycle for members: start, inspect, override, delete.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Member;
use crate::chain::ExchangeChain;
use crate::error::{PacError, PacResult};
use crate::gateway::{MailTransport, OutboundEmail};
use crate::marker;
use crate::model::{
    Challenge, ChallengeFilter, ChallengeStatus, ChallengeUpdate, Email, EmailDraft, EmailRole,
    EmailStatus, NewChallenge, Scenario,
};
use crate::store::Store;

/// Body of `PUT /challenges/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusOverride {
    pub status: ChallengeStatus,
    #[serde(default)]
    pub score: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastEmailStatus {
    pub email_id: Uuid,
    pub role: EmailRole,
    pub status: Option<EmailStatus>,
}

#[derive(Clone)]
pub struct ChallengeService {
    store: Arc<dyn Store>,
    mail: Arc<dyn MailTransport>,
    chain: ExchangeChain,
}

impl ChallengeService {
    pub fn new(store: Arc<dyn Store>, mail: Arc<dyn MailTransport>) -> Self {
        let chain = ExchangeChain::new(store.clone());
        Self { store, mail, chain }
    }

    /// Scenario `id` if it belongs to `organization_id`.
    pub async fn scenario_for_org(&self, organization_id: Uuid, id: Uuid) -> PacResult<Scenario> {
        match self.store.get_scenario(id).await? {
            Some(s) if s.organization_id == organization_id => Ok(s),
            _ => Err(PacError::NotFound("Scenario not found.".into())),
        }
    }

    /// Challenge `id` if its scenario belongs to the member's organization.
    pub async fn challenge_for_org(&self, member: &Member, id: Uuid) -> PacResult<Challenge> {
        let challenge = self
            .store
            .get_challenge(id)
            .await?
            .ok_or_else(|| PacError::NotFound("Challenge not found.".into()))?;
        self.scenario_for_org(member.organization_id, challenge.scenario_id)
            .await?;
        Ok(challenge)
    }

    /// Create a challenge and send the scenario's hook to the employee. The
    /// sent copy becomes the first exchange of the chain.
    pub async fn start_challenge(
        &self,
        member: &Member,
        employee_id: Uuid,
        scenario_id: Uuid,
    ) -> PacResult<Challenge> {
        self.scenario_for_org(member.organization_id, scenario_id)
            .await?;
        let employee = match self.store.get_member(employee_id).await? {
            Some(e) if e.organization_id == member.organization_id => e,
            _ => return Err(PacError::NotFound("Employee not found.".into())),
        };
        let hook = self
            .store
            .hook_email_for_scenario(scenario_id)
            .await?
            .ok_or_else(|| PacError::NotFound("Hook email not found for scenario.".into()))?;

        let mut challenge = self
            .store
            .insert_challenge(NewChallenge {
                user_id: member.user_id,
                employee_id,
                scenario_id,
            })
            .await?;

        let outbound = OutboundEmail {
            to: employee.email.clone(),
            subject: hook.subject.clone().unwrap_or_default(),
            html: marker::inject(hook.body.as_deref(), challenge.id),
            challenge_id: challenge.id,
        };
        if let Err(err) = self.mail.send(&outbound).await {
            tracing::warn!(challenge_id=%challenge.id, error=%err, "hook send failed, discarding challenge");
            if let Err(cleanup) = self.store.delete_challenge(challenge.id).await {
                tracing::error!(challenge_id=%challenge.id, error=%cleanup, "failed to delete unsent challenge");
            }
            return Err(match err {
                PacError::BadGateway(_) | PacError::Config(_) => err,
                _ => PacError::BadGateway("Failed to send hook email.".into()),
            });
        }

        let sent = self
            .chain
            .append_email(EmailDraft {
                id: None,
                scenario_id: hook.scenario_id,
                role: EmailRole::Ai,
                target_id: Some(employee_id),
                previous_email: Some(hook.id),
                subject: hook.subject.clone(),
                sender_email: hook.sender_email.clone(),
                language: hook.language.clone(),
                body: hook.body.clone(),
                variables: hook.variables.clone(),
                status: Some(EmailStatus::Sent),
                challenge_id: Some(challenge.id),
                created_at: None,
            })
            .await?;

        tracing::info!(challenge_id=%challenge.id, email_id=%sent.id, employee_id=%employee_id, "challenge started");
        match self
            .chain
            .advance_challenge_head(challenge.id, sent.id, None)
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                challenge.last_exchange_id = Some(sent.id);
                Ok(challenge)
            }
        }
    }

    pub async fn retrieve_status(&self, member: &Member, id: Uuid) -> PacResult<ChallengeStatus> {
        Ok(self.challenge_for_org(member, id).await?.status)
    }

    pub async fn list_challenges(
        &self,
        member: &Member,
        status: Option<ChallengeStatus>,
    ) -> PacResult<Vec<Challenge>> {
        self.store
            .list_challenges(&ChallengeFilter {
                user_id: Some(member.user_id),
                status,
            })
            .await
    }

    /// Exchanges oldest first; empty before the hook was sent.
    pub async fn get_exchanges(&self, member: &Member, id: Uuid) -> PacResult<Vec<Email>> {
        let challenge = self.challenge_for_org(member, id).await?;
        match challenge.last_exchange_id {
            Some(head) => self.chain.get_chain(head).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn exchange_count(&self, member: &Member, id: Uuid) -> PacResult<usize> {
        Ok(self.get_exchanges(member, id).await?.len())
    }

    pub async fn last_email_status(&self, member: &Member, id: Uuid) -> PacResult<LastEmailStatus> {
        let challenge = self.challenge_for_org(member, id).await?;
        let head = challenge
            .last_exchange_id
            .ok_or_else(|| PacError::NotFound("Challenge has no exchanges yet.".into()))?;
        let email = self
            .store
            .get_email(head)
            .await?
            .ok_or_else(|| PacError::NotFound("Last email not found.".into()))?;
        Ok(LastEmailStatus {
            email_id: email.id,
            role: email.role,
            status: email.status,
        })
    }

    /// Manual close of a challenge.
    pub async fn update_status(
        &self,
        member: &Member,
        id: Uuid,
        change: StatusOverride,
    ) -> PacResult<Challenge> {
        let challenge = self.challenge_for_org(member, id).await?;
        if !change.status.is_terminal() {
            return Err(PacError::BadRequest(
                "Challenge status can only be set to SUCCESS or FAILURE.".into(),
            ));
        }
        let score = override_score(change.score.as_ref())?;
        if challenge.status.is_terminal() {
            return Err(already_finished());
        }
        let updated = self
            .store
            .update_challenge(
                challenge.id,
                ChallengeUpdate::outcome(change.status, Some(score))
                    .when_status(ChallengeStatus::Ongoing),
            )
            .await?
            .ok_or_else(already_finished)?;
        tracing::info!(challenge_id=%id, status=%updated.status, score=?updated.score, "challenge status overridden");
        Ok(updated)
    }

    /// Only finished challenges can be removed.
    pub async fn delete_challenge(&self, member: &Member, id: Uuid) -> PacResult<()> {
        let challenge = self.challenge_for_org(member, id).await?;
        if !challenge.status.is_terminal() {
            return Err(PacError::BadRequest(
                "Only completed challenges can be deleted.".into(),
            ));
        }
        if !self.store.delete_challenge(challenge.id).await? {
            return Err(PacError::NotFound("Challenge not found.".into()));
        }
        tracing::info!(challenge_id=%id, "challenge deleted");
        Ok(())
    }
}

fn already_finished() -> PacError {
    PacError::InvalidState("Challenge is already finished.".into())
}

/// Integer score in 0..=100; absent means 0.
pub fn override_score(raw: Option<&Value>) -> PacResult<u8> {
    let not_integer = || PacError::BadRequest("Score must be an integer value.".into());
    let value = match raw {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => v,
            None => {
                let f = n.as_f64().ok_or_else(not_integer)?;
                if f.fract() != 0.0 || !f.is_finite() {
                    return Err(not_integer());
                }
                f as i64
            }
        },
        Some(_) => return Err(not_integer()),
    };
    if !(0..=100).contains(&value) {
        return Err(PacError::BadRequest("Score must be between 0 and 100.".into()));
    }
    Ok(value as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn override_score_rules() {
        assert_eq!(override_score(None).unwrap(), 0);
        assert_eq!(override_score(Some(&json!(null))).unwrap(), 0);
        assert_eq!(override_score(Some(&json!(75))).unwrap(), 75);
        assert_eq!(override_score(Some(&json!(80.0))).unwrap(), 80);
        assert!(override_score(Some(&json!(80.5))).is_err());
        assert!(override_score(Some(&json!(101))).is_err());
        assert!(override_score(Some(&json!(-1))).is_err());
        assert!(override_score(Some(&json!("50"))).is_err());
    }
}
