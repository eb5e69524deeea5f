//! Rows and enums shared by the store, the services and the HTTP layer.
//!
//! Field names follow the relational column names so the same structs
//! serialise straight into store payloads and API responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeStatus {
    Ongoing,
    Success,
    Failure,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Ongoing => "ONGOING",
            ChallengeStatus::Success => "SUCCESS",
            ChallengeStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Ongoing)
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailRole {
    Hook,
    User,
    Ai,
}

impl EmailRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailRole::Hook => "HOOK",
            EmailRole::User => "USER",
            EmailRole::Ai => "AI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    Pending,
    Sent,
    // Older rows were written with the misspelled value.
    #[serde(alias = "RECIEVED")]
    Received,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "PENDING",
            EmailStatus::Sent => "SENT",
            EmailStatus::Received => "RECEIVED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Member,
    OrgAdmin,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Easy,
    Medium,
    Hard,
}

/// One participant's run of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub employee_id: Uuid,
    pub scenario_id: Uuid,
    pub channel: Channel,
    pub status: ChallengeStatus,
    /// Present iff `status` is terminal.
    #[serde(default, deserialize_with = "deserialize_score")]
    pub score: Option<u8>,
    /// Head of the email chain; `None` only before the hook is sent.
    #[serde(default)]
    pub last_exchange_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One message in a challenge's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub role: EmailRole,
    #[serde(default)]
    pub target_id: Option<Uuid>,
    /// Back reference toward the HOOK; the only ordering the chain has.
    #[serde(default)]
    pub previous_email: Option<Uuid>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<EmailStatus>,
    #[serde(default)]
    pub challenge_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Insert (or upsert, when `id` is set) payload for the `emails` table.
#[derive(Debug, Clone, Serialize)]
pub struct EmailDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub scenario_id: Uuid,
    pub role: EmailRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_email: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub sender_email: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EmailStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<Uuid>,
    /// Explicit creation time; the store stamps `now` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl EmailDraft {
    /// Materialise the row the store will hold for this draft.
    pub fn into_email(self, now: DateTime<Utc>) -> Email {
        Email {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            scenario_id: self.scenario_id,
            role: self.role,
            target_id: self.target_id,
            previous_email: self.previous_email,
            subject: self.subject,
            sender_email: self.sender_email,
            language: self.language,
            body: self.body,
            variables: self.variables,
            status: self.status,
            challenge_id: self.challenge_id,
            created_at: self.created_at.unwrap_or(now),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub complexity: Complexity,
    pub system_prompt: String,
    #[serde(default)]
    pub misc_info: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Scenario {
    pub fn misc_info_json(&self) -> String {
        match &self.misc_info {
            Some(map) => serde_json::Value::Object(map.clone()).to_string(),
            None => "{}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgMember {
    pub id: Uuid,
    pub organization_id: Uuid,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
}

/// The authenticated caller as reported by the Authentication service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<MemberRole>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewChallenge {
    pub user_id: Uuid,
    pub employee_id: Uuid,
    pub scenario_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct ChallengeFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<ChallengeStatus>,
}

/// Partial update of a challenge row. `expected_head` and `expected_status`
/// turn the write into a compare-and-swap on those columns.
#[derive(Debug, Clone, Default)]
pub struct ChallengeUpdate {
    pub status: Option<ChallengeStatus>,
    pub score: Option<Option<u8>>,
    pub last_exchange_id: Option<Uuid>,
    pub expected_head: Option<Uuid>,
    pub expected_status: Option<ChallengeStatus>,
}

impl ChallengeUpdate {
    pub fn head(email_id: Uuid) -> Self {
        ChallengeUpdate {
            last_exchange_id: Some(email_id),
            ..Default::default()
        }
    }

    pub fn outcome(status: ChallengeStatus, score: Option<u8>) -> Self {
        ChallengeUpdate {
            status: Some(status),
            score: Some(score),
            ..Default::default()
        }
    }

    pub fn expecting(mut self, head: Uuid) -> Self {
        self.expected_head = Some(head);
        self
    }

    pub fn when_status(mut self, status: ChallengeStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn with_head(mut self, email_id: Uuid) -> Self {
        self.last_exchange_id = Some(email_id);
        self
    }
}

fn default_language() -> String {
    "en".to_string()
}

// The column is numeric; PostgREST hands back `90` or `90.0` depending on type.
fn deserialize_score<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw.map(|v| v.round().clamp(0.0, 100.0) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_legacy_received_spelling() {
        let status: EmailStatus = serde_json::from_value(json!("RECIEVED")).unwrap();
        assert_eq!(status, EmailStatus::Received);
        assert_eq!(
            serde_json::to_value(EmailStatus::Received).unwrap(),
            json!("RECEIVED")
        );
    }

    #[test]
    fn challenge_score_accepts_float_column() {
        let challenge: Challenge = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "employee_id": Uuid::new_v4(),
            "scenario_id": Uuid::new_v4(),
            "channel": "EMAIL",
            "status": "SUCCESS",
            "score": 87.0,
            "created_at": "2025-01-02T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(challenge.score, Some(87));
        assert!(challenge.status.is_terminal());
        assert!(challenge.last_exchange_id.is_none());
    }
}
