//! In-process store used for development and tests.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Store;
use crate::error::{PacError, PacResult};
use crate::model::{
    Challenge, ChallengeFilter, ChallengeStatus, ChallengeUpdate, Channel, Email, EmailDraft,
    EmailRole, EmailStatus, NewChallenge, OrgMember, Scenario,
};

#[derive(Default)]
struct Tables {
    // Rows carry an insertion sequence so equal timestamps still order.
    challenges: HashMap<Uuid, (u64, Challenge)>,
    emails: HashMap<Uuid, (u64, Email)>,
    scenarios: HashMap<Uuid, Scenario>,
    members: HashMap<Uuid, OrgMember>,
    seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scenario(&self, scenario: Scenario) {
        if let Ok(mut t) = self.tables.write() {
            t.scenarios.insert(scenario.id, scenario);
        }
    }

    pub fn insert_member(&self, member: OrgMember) {
        if let Ok(mut t) = self.tables.write() {
            t.members.insert(member.id, member);
        }
    }

    /// Insert a fully formed email row, bypassing draft defaults.
    pub fn insert_email(&self, email: Email) {
        if let Ok(mut t) = self.tables.write() {
            let seq = t.next_seq();
            t.emails.insert(email.id, (seq, email));
        }
    }

    /// Insert a fully formed challenge row.
    pub fn insert_challenge_row(&self, challenge: Challenge) {
        if let Ok(mut t) = self.tables.write() {
            let seq = t.next_seq();
            t.challenges.insert(challenge.id, (seq, challenge));
        }
    }

    pub fn email_count(&self) -> usize {
        self.tables.read().map(|t| t.emails.len()).unwrap_or(0)
    }

    /// All emails of a challenge in creation order.
    pub fn emails_for_challenge(&self, challenge_id: Uuid) -> Vec<Email> {
        let Ok(t) = self.tables.read() else {
            return Vec::new();
        };
        let mut rows: Vec<&(u64, Email)> = t
            .emails
            .values()
            .filter(|(_, e)| e.challenge_id == Some(challenge_id))
            .collect();
        rows.sort_by_key(|(seq, e)| (e.created_at, *seq));
        rows.into_iter().map(|(_, e)| e.clone()).collect()
    }

    fn read(&self) -> PacResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| PacError::Store("memory store lock poisoned".into()))
    }

    fn write(&self) -> PacResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| PacError::Store("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_challenge(&self, id: Uuid) -> PacResult<Option<Challenge>> {
        Ok(self.read()?.challenges.get(&id).map(|(_, c)| c.clone()))
    }

    async fn insert_challenge(&self, new: NewChallenge) -> PacResult<Challenge> {
        let challenge = Challenge {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            employee_id: new.employee_id,
            scenario_id: new.scenario_id,
            channel: Channel::Email,
            status: ChallengeStatus::Ongoing,
            score: None,
            last_exchange_id: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        let mut t = self.write()?;
        let seq = t.next_seq();
        t.challenges.insert(challenge.id, (seq, challenge.clone()));
        Ok(challenge)
    }

    async fn delete_challenge(&self, id: Uuid) -> PacResult<bool> {
        Ok(self.write()?.challenges.remove(&id).is_some())
    }

    async fn list_challenges(&self, filter: &ChallengeFilter) -> PacResult<Vec<Challenge>> {
        let t = self.read()?;
        let mut rows: Vec<&(u64, Challenge)> = t
            .challenges
            .values()
            .filter(|(_, c)| filter.user_id.map_or(true, |u| c.user_id == u))
            .filter(|(_, c)| filter.status.map_or(true, |s| c.status == s))
            .collect();
        rows.sort_by_key(|(seq, c)| (c.created_at, *seq));
        Ok(rows.into_iter().map(|(_, c)| c.clone()).collect())
    }

    async fn update_challenge(
        &self,
        id: Uuid,
        update: ChallengeUpdate,
    ) -> PacResult<Option<Challenge>> {
        let mut t = self.write()?;
        let Some((_, row)) = t.challenges.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(expected) = update.expected_head {
            if row.last_exchange_id != Some(expected) {
                return Ok(None);
            }
        }
        if let Some(expected) = update.expected_status {
            if row.status != expected {
                return Ok(None);
            }
        }
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(score) = update.score {
            row.score = score;
        }
        if let Some(head) = update.last_exchange_id {
            row.last_exchange_id = Some(head);
        }
        row.updated_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }

    async fn get_email(&self, id: Uuid) -> PacResult<Option<Email>> {
        Ok(self.read()?.emails.get(&id).map(|(_, e)| e.clone()))
    }

    async fn upsert_email(&self, draft: EmailDraft) -> PacResult<(Email, bool)> {
        let now = Utc::now();
        let mut t = self.write()?;
        if let Some(id) = draft.id {
            if let Some((_, existing)) = t.emails.get_mut(&id) {
                let created_at = draft.created_at.unwrap_or(existing.created_at);
                let mut merged = draft.into_email(now);
                merged.created_at = created_at;
                merged.updated_at = Some(now);
                *existing = merged.clone();
                return Ok((merged, false));
            }
        }
        let email = draft.into_email(now);
        let seq = t.next_seq();
        t.emails.insert(email.id, (seq, email.clone()));
        Ok((email, true))
    }

    async fn hook_email_for_scenario(&self, scenario_id: Uuid) -> PacResult<Option<Email>> {
        let t = self.read()?;
        Ok(t.emails
            .values()
            .filter(|(_, e)| e.scenario_id == scenario_id && e.role == EmailRole::Hook)
            .min_by_key(|(seq, e)| (e.created_at, *seq))
            .map(|(_, e)| e.clone()))
    }

    async fn latest_received_email(&self) -> PacResult<Option<Email>> {
        let t = self.read()?;
        Ok(t.emails
            .values()
            .filter(|(_, e)| e.status == Some(EmailStatus::Received))
            .max_by_key(|(seq, e)| (e.created_at, *seq))
            .map(|(_, e)| e.clone()))
    }

    async fn latest_email_before(
        &self,
        challenge_id: Uuid,
        before: DateTime<Utc>,
    ) -> PacResult<Option<Email>> {
        let t = self.read()?;
        Ok(t.emails
            .values()
            .filter(|(_, e)| e.challenge_id == Some(challenge_id) && e.created_at <= before)
            .max_by_key(|(seq, e)| (e.created_at, *seq))
            .map(|(_, e)| e.clone()))
    }

    async fn pending_emails(
        &self,
        scenario_id: Uuid,
        target_id: Uuid,
        challenge_id: Uuid,
    ) -> PacResult<Vec<Email>> {
        let t = self.read()?;
        let mut rows: Vec<&(u64, Email)> = t
            .emails
            .values()
            .filter(|(_, e)| {
                e.scenario_id == scenario_id
                    && e.target_id == Some(target_id)
                    && e.status == Some(EmailStatus::Pending)
                    && e.challenge_id.map_or(true, |c| c == challenge_id)
            })
            .collect();
        rows.sort_by_key(|(seq, e)| (e.created_at, *seq));
        Ok(rows.into_iter().map(|(_, e)| e.clone()).collect())
    }

    async fn mark_email_sent(&self, id: Uuid, challenge_id: Uuid) -> PacResult<Option<Email>> {
        let mut t = self.write()?;
        let Some((_, row)) = t.emails.get_mut(&id) else {
            return Ok(None);
        };
        row.status = Some(EmailStatus::Sent);
        row.challenge_id = Some(challenge_id);
        row.updated_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }

    async fn get_scenario(&self, id: Uuid) -> PacResult<Option<Scenario>> {
        Ok(self.read()?.scenarios.get(&id).cloned())
    }

    async fn get_member(&self, id: Uuid) -> PacResult<Option<OrgMember>> {
        Ok(self.read()?.members.get(&id).cloned())
    }
}
