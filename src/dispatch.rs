//! Pending-send dispatcher.
//!
//! Drafts written by the flow stay PENDING until a dispatch pass hands them to
//! the mail provider with the challenge marker injected.

use std::sync::Arc;

use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{PacError, PacResult};
use crate::gateway::{MailTransport, OutboundEmail};
use crate::marker;
use crate::model::{Challenge, ChallengeFilter, Email, EmailRole, OrgMember};
use crate::store::Store;
use crate::util::BatchReport;

const MISSING_SUBJECT: &str = "(no subject)";

#[derive(Clone)]
pub struct PendingDispatcher {
    store: Arc<dyn Store>,
    mail: Arc<dyn MailTransport>,
}

impl PendingDispatcher {
    pub fn new(store: Arc<dyn Store>, mail: Arc<dyn MailTransport>) -> Self {
        Self { store, mail }
    }

    /// Send every PENDING email reachable from the caller's challenges.
    /// Successes count sent emails; a failed email is recorded and skipped.
    pub async fn send_all_pending(&self, caller: &Caller) -> PacResult<BatchReport> {
        let filter = match caller {
            Caller::Member(m) => ChallengeFilter {
                user_id: Some(m.user_id),
                ..Default::default()
            },
            Caller::Clock => ChallengeFilter::default(),
        };
        let challenges = self.store.list_challenges(&filter).await?;
        let mut report = BatchReport::default();

        for challenge in &challenges {
            let target = match self.target_for(caller, challenge).await {
                Ok(Some(member)) => member,
                Ok(None) => {
                    tracing::debug!(challenge_id=%challenge.id, "skipping challenge outside caller scope");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(challenge_id=%challenge.id, error=%err, "could not resolve challenge target");
                    report.record_failure(challenge.id, &err);
                    continue;
                }
            };

            let pending = match self
                .store
                .pending_emails(challenge.scenario_id, challenge.employee_id, challenge.id)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(challenge_id=%challenge.id, error=%err, "could not list pending emails");
                    report.record_failure(challenge.id, &err);
                    continue;
                }
            };

            for email in &pending {
                match self.dispatch_one(challenge, &target, email).await {
                    Ok(bound_to) => {
                        tracing::info!(email_id=%email.id, challenge_id=%bound_to, "sent pending email");
                        report.record_success();
                    }
                    Err(err) => {
                        tracing::warn!(email_id=%email.id, challenge_id=%challenge.id, error=%err, "failed to send pending email");
                        report.record_failure(email.id, &err);
                    }
                }
            }
        }

        tracing::info!(
            sent = report.succeeded,
            failed = report.failed(),
            "pending dispatch finished"
        );
        Ok(report)
    }

    /// Target employee when the challenge is within the caller's reach.
    async fn target_for(
        &self,
        caller: &Caller,
        challenge: &Challenge,
    ) -> PacResult<Option<OrgMember>> {
        let Some(member) = self.store.get_member(challenge.employee_id).await? else {
            return Ok(None);
        };
        let organization_id = match caller.organization_id() {
            Some(org) => org,
            None => match self.store.get_scenario(challenge.scenario_id).await? {
                Some(scenario) => scenario.organization_id,
                None => return Ok(None),
            },
        };
        Ok((member.organization_id == organization_id).then_some(member))
    }

    async fn dispatch_one(
        &self,
        challenge: &Challenge,
        target: &OrgMember,
        email: &Email,
    ) -> PacResult<Uuid> {
        let previous = match email.previous_email {
            Some(id) => self.store.get_email(id).await?,
            None => None,
        };
        let challenge_id = previous
            .as_ref()
            .and_then(|p| p.challenge_id)
            .unwrap_or(challenge.id);

        let outbound = OutboundEmail {
            to: resolve_recipient(previous.as_ref(), target),
            subject: resolve_subject(email, previous.as_ref()),
            html: marker::inject(email.body.as_deref(), challenge_id),
            challenge_id,
        };
        let provider_id = self.mail.send(&outbound).await?;
        tracing::debug!(email_id=%email.id, provider_id=%provider_id, to=%outbound.to, "mail provider accepted email");

        // The provider has the mail at this point; a failed status write
        // means the same email may go out again on the next pass.
        self.store
            .mark_email_sent(email.id, challenge_id)
            .await?
            .ok_or_else(|| PacError::NotFound(format!("Email {} not found.", email.id)))?;
        Ok(challenge_id)
    }
}

/// Reply to whoever last wrote, else the employee's profile address.
pub fn resolve_recipient(previous: Option<&Email>, target: &OrgMember) -> String {
    previous
        .filter(|p| p.role == EmailRole::User)
        .map(|p| p.sender_email.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(&target.email)
        .to_string()
}

pub fn resolve_subject(email: &Email, previous: Option<&Email>) -> String {
    if let Some(subject) = email.subject.as_deref().filter(|s| !s.trim().is_empty()) {
        return subject.to_string();
    }
    previous
        .and_then(|p| p.subject.as_deref())
        .filter(|s| !s.trim().is_empty())
        .map(|s| format!("Re: {s}"))
        .unwrap_or_else(|| MISSING_SUBJECT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EmailStatus;
    use chrono::Utc;

    fn email(role: EmailRole, sender: &str, subject: Option<&str>) -> Email {
        Email {
            id: Uuid::new_v4(),
            scenario_id: Uuid::new_v4(),
            role,
            target_id: None,
            previous_email: None,
            subject: subject.map(String::from),
            sender_email: sender.into(),
            language: "en".into(),
            body: None,
            variables: None,
            status: Some(EmailStatus::Pending),
            challenge_id: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn member() -> OrgMember {
        OrgMember {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@corp.test".into(),
        }
    }

    #[test]
    fn replies_to_last_user_sender() {
        let user = email(EmailRole::User, "ada.private@mail.test", None);
        assert_eq!(resolve_recipient(Some(&user), &member()), "ada.private@mail.test");

        let ai = email(EmailRole::Ai, "attacker@corp.test", None);
        assert_eq!(resolve_recipient(Some(&ai), &member()), "ada@corp.test");
        assert_eq!(resolve_recipient(None, &member()), "ada@corp.test");

        let blank = email(EmailRole::User, "  ", None);
        assert_eq!(resolve_recipient(Some(&blank), &member()), "ada@corp.test");
    }

    #[test]
    fn subject_falls_back_to_reply_prefix() {
        let previous = email(EmailRole::User, "a@b.test", Some("Invoice"));
        let stored = email(EmailRole::Ai, "x@y.test", Some("Payment details"));
        assert_eq!(resolve_subject(&stored, Some(&previous)), "Payment details");

        let bare = email(EmailRole::Ai, "x@y.test", None);
        assert_eq!(resolve_subject(&bare, Some(&previous)), "Re: Invoice");
        assert_eq!(resolve_subject(&bare, None), MISSING_SUBJECT);
    }
}
