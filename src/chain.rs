//! Exchange chain manager.
//!
//! A challenge's conversation is a singly linked list of emails: each row
//! points at its `previous_email`, ending at the scenario's HOOK. The
//! challenge only stores the head. Appending an email and moving the head are
//! separate steps; the caller decides when a new message becomes the head.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{PacError, PacResult};
use crate::model::{Challenge, ChallengeUpdate, Email, EmailDraft, EmailRole};
use crate::store::Store;

#[derive(Clone)]
pub struct ExchangeChain {
    store: Arc<dyn Store>,
}

impl ExchangeChain {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Conversation ending at `head_id`, oldest first. Stops after the first
    /// HOOK or root email. A missing link is a data-integrity error.
    pub async fn get_chain(&self, head_id: Uuid) -> PacResult<Vec<Email>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(head_id);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                tracing::error!(email_id=%id, head_id=%head_id, "exchange chain loops back on itself");
                return Err(PacError::Store(format!(
                    "Exchange chain starting at {head_id} contains a cycle"
                )));
            }
            let Some(email) = self.store.get_email(id).await? else {
                tracing::error!(email_id=%id, head_id=%head_id, "exchange chain is broken");
                return Err(PacError::BrokenChain(id));
            };
            cursor = match (email.role, email.previous_email) {
                (EmailRole::Hook, _) | (_, None) => None,
                (_, Some(prev)) => Some(prev),
            };
            chain.push(email);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Insert a new email. Its `previous_email`, when set, must exist.
    /// The challenge head is left untouched.
    pub async fn append_email(&self, draft: EmailDraft) -> PacResult<Email> {
        if let Some(prev) = draft.previous_email {
            if self.store.get_email(prev).await?.is_none() {
                return Err(PacError::NotFound(format!("Previous email {prev} not found.")));
            }
        }
        let (email, _) = self.store.upsert_email(draft).await?;
        tracing::debug!(email_id=%email.id, role=email.role.as_str(), "appended email");
        Ok(email)
    }

    /// Point the challenge at a new head. With `expected` set the write only
    /// lands if the stored head still equals it. `None` means nothing was
    /// written; the new email, if any, is then an orphan.
    pub async fn advance_challenge_head(
        &self,
        challenge_id: Uuid,
        new_head: Uuid,
        expected: Option<Uuid>,
    ) -> PacResult<Option<Challenge>> {
        let mut update = ChallengeUpdate::head(new_head);
        update.expected_head = expected;
        let updated = self.store.update_challenge(challenge_id, update).await?;
        if updated.is_none() {
            tracing::warn!(challenge_id=%challenge_id, email_id=%new_head, "challenge head was not advanced");
        }
        Ok(updated)
    }
}
