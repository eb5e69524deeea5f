//! Persistence seam.
//!
//! The services only ever see [`Store`]; which relational engine sits behind
//! it is decided once at startup and injected as an `Arc<dyn Store>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PacResult;
use crate::model::{
    Challenge, ChallengeFilter, ChallengeUpdate, Email, EmailDraft, NewChallenge, OrgMember,
    Scenario,
};

pub mod memory;
pub mod postgrest;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

/// Point lookups, equality filters, ordering and upsert over the
/// `challenges`, `emails`, `scenarios` and `org_members` tables.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_challenge(&self, id: Uuid) -> PacResult<Option<Challenge>>;

    async fn insert_challenge(&self, new: NewChallenge) -> PacResult<Challenge>;

    async fn delete_challenge(&self, id: Uuid) -> PacResult<bool>;

    async fn list_challenges(&self, filter: &ChallengeFilter) -> PacResult<Vec<Challenge>>;

    /// Apply a partial update. Returns `None` when no row matched, which
    /// includes a miss on `update.expected_head`.
    async fn update_challenge(
        &self,
        id: Uuid,
        update: ChallengeUpdate,
    ) -> PacResult<Option<Challenge>>;

    async fn get_email(&self, id: Uuid) -> PacResult<Option<Email>>;

    /// Insert the draft, or merge onto the existing row when `draft.id` is
    /// already present. The flag is true when a new row was created.
    async fn upsert_email(&self, draft: EmailDraft) -> PacResult<(Email, bool)>;

    async fn hook_email_for_scenario(&self, scenario_id: Uuid) -> PacResult<Option<Email>>;

    /// Most recently created RECEIVED email across all challenges.
    async fn latest_received_email(&self) -> PacResult<Option<Email>>;

    /// Most recent email of `challenge_id` created at or before `before`.
    async fn latest_email_before(
        &self,
        challenge_id: Uuid,
        before: DateTime<Utc>,
    ) -> PacResult<Option<Email>>;

    /// PENDING emails for a scenario/target pair that are bound to
    /// `challenge_id` or not bound yet, oldest first.
    async fn pending_emails(
        &self,
        scenario_id: Uuid,
        target_id: Uuid,
        challenge_id: Uuid,
    ) -> PacResult<Vec<Email>>;

    /// Flip an email to SENT, binding it to `challenge_id`.
    async fn mark_email_sent(&self, id: Uuid, challenge_id: Uuid) -> PacResult<Option<Email>>;

    async fn get_scenario(&self, id: Uuid) -> PacResult<Option<Scenario>>;

    async fn get_member(&self, id: Uuid) -> PacResult<Option<OrgMember>>;
}
