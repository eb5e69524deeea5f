//! Store backed by a Supabase/PostgREST endpoint.
//!
//! Every call is a single HTTP request against `/rest/v1/<table>` using
//! PostgREST filter syntax (`col=eq.value`, `order=col.desc`, `limit=n`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::Store;
use crate::error::{PacError, PacResult};
use crate::model::{
    Challenge, ChallengeFilter, ChallengeStatus, ChallengeUpdate, Channel, Email, EmailDraft,
    EmailRole, EmailStatus, NewChallenge, OrgMember, Scenario,
};

const SERVICE: &str = "Database";

pub struct PostgrestStore {
    base_url: String,
    api_key: String,
    client: Client,
}

impl PostgrestStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> PacResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacError::Config(format!("failed to build store client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("accept", "application/json")
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> PacResult<Vec<T>> {
        let mut params: Vec<(&str, String)> = vec![("select", "*".to_string())];
        params.extend(query.iter().cloned());
        let rb = self.authed(self.client.get(self.table_url(table))).query(&params);
        self.execute(rb).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> PacResult<Option<T>> {
        let mut params = query.to_vec();
        params.push(("limit", "1".to_string()));
        Ok(self.select(table, &params).await?.into_iter().next())
    }

    async fn write_rows<T: DeserializeOwned>(&self, rb: RequestBuilder) -> PacResult<Vec<T>> {
        self.write_rows_with(rb, "return=representation").await
    }

    async fn write_rows_with<T: DeserializeOwned>(
        &self,
        rb: RequestBuilder,
        prefer: &str,
    ) -> PacResult<Vec<T>> {
        let rb = self
            .authed(rb)
            .header("content-type", "application/json")
            .header("prefer", prefer);
        self.execute(rb).await
    }

    async fn execute<T: DeserializeOwned>(&self, rb: RequestBuilder) -> PacResult<Vec<T>> {
        let resp = rb.send().await.map_err(|err| {
            tracing::warn!(error=%err, "store request failed");
            PacError::Unavailable { service: SERVICE }
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PacError::Store(format!("failed to read store response: {e}")))?;
        if !status.is_success() {
            return Err(PacError::Store(format!(
                "store answered {}: {}",
                status.as_u16(),
                text
            )));
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| PacError::Store(format!("invalid store payload: {e}")))
    }
}

fn eq(value: impl ToString) -> String {
    format!("eq.{}", value.to_string())
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl Store for PostgrestStore {
    async fn get_challenge(&self, id: Uuid) -> PacResult<Option<Challenge>> {
        self.select_one("challenges", &[("id", eq(id))]).await
    }

    async fn insert_challenge(&self, new: NewChallenge) -> PacResult<Challenge> {
        let payload = json!({
            "user_id": new.user_id,
            "employee_id": new.employee_id,
            "scenario_id": new.scenario_id,
            "channel": Channel::Email,
            "status": ChallengeStatus::Ongoing,
            "score": Value::Null,
            "last_exchange_id": Value::Null,
        });
        let rb = self.client.post(self.table_url("challenges")).json(&payload);
        self.write_rows::<Challenge>(rb)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PacError::Store("failed to create challenge".into()))
    }

    async fn delete_challenge(&self, id: Uuid) -> PacResult<bool> {
        let rb = self
            .client
            .delete(self.table_url("challenges"))
            .query(&[("id", eq(id))]);
        Ok(!self.write_rows::<Challenge>(rb).await?.is_empty())
    }

    async fn list_challenges(&self, filter: &ChallengeFilter) -> PacResult<Vec<Challenge>> {
        let mut query = vec![("order", "created_at.asc".to_string())];
        if let Some(user_id) = filter.user_id {
            query.push(("user_id", eq(user_id)));
        }
        if let Some(status) = filter.status {
            query.push(("status", eq(status.as_str())));
        }
        self.select("challenges", &query).await
    }

    async fn update_challenge(
        &self,
        id: Uuid,
        update: ChallengeUpdate,
    ) -> PacResult<Option<Challenge>> {
        let mut payload = Map::new();
        if let Some(status) = update.status {
            payload.insert("status".into(), json!(status));
        }
        if let Some(score) = update.score {
            payload.insert("score".into(), json!(score));
        }
        if let Some(head) = update.last_exchange_id {
            payload.insert("last_exchange_id".into(), json!(head));
        }
        payload.insert("updated_at".into(), json!(ts(Utc::now())));

        let mut query = vec![("id", eq(id))];
        if let Some(expected) = update.expected_head {
            query.push(("last_exchange_id", eq(expected)));
        }
        if let Some(expected) = update.expected_status {
            query.push(("status", eq(expected.as_str())));
        }
        let rb = self
            .client
            .patch(self.table_url("challenges"))
            .query(&query)
            .json(&Value::Object(payload));
        Ok(self.write_rows::<Challenge>(rb).await?.into_iter().next())
    }

    async fn get_email(&self, id: Uuid) -> PacResult<Option<Email>> {
        self.select_one("emails", &[("id", eq(id))]).await
    }

    async fn upsert_email(&self, draft: EmailDraft) -> PacResult<(Email, bool)> {
        let existed = match draft.id {
            Some(id) => self.get_email(id).await?.is_some(),
            None => false,
        };
        let rb = self.client.post(self.table_url("emails")).json(&draft);
        let email = self
            .write_rows_with::<Email>(rb, "resolution=merge-duplicates,return=representation")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PacError::Store("failed to create email exchange".into()))?;
        Ok((email, !existed))
    }

    async fn hook_email_for_scenario(&self, scenario_id: Uuid) -> PacResult<Option<Email>> {
        self.select_one(
            "emails",
            &[
                ("scenario_id", eq(scenario_id)),
                ("role", eq(EmailRole::Hook.as_str())),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn latest_received_email(&self) -> PacResult<Option<Email>> {
        self.select_one(
            "emails",
            &[
                ("status", eq(EmailStatus::Received.as_str())),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn latest_email_before(
        &self,
        challenge_id: Uuid,
        before: DateTime<Utc>,
    ) -> PacResult<Option<Email>> {
        self.select_one(
            "emails",
            &[
                ("challenge_id", eq(challenge_id)),
                ("created_at", format!("lte.{}", ts(before))),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn pending_emails(
        &self,
        scenario_id: Uuid,
        target_id: Uuid,
        challenge_id: Uuid,
    ) -> PacResult<Vec<Email>> {
        self.select(
            "emails",
            &[
                ("scenario_id", eq(scenario_id)),
                ("target_id", eq(target_id)),
                ("status", eq(EmailStatus::Pending.as_str())),
                (
                    "or",
                    format!("(challenge_id.eq.{challenge_id},challenge_id.is.null)"),
                ),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn mark_email_sent(&self, id: Uuid, challenge_id: Uuid) -> PacResult<Option<Email>> {
        let payload = json!({
            "status": EmailStatus::Sent,
            "challenge_id": challenge_id,
            "updated_at": ts(Utc::now()),
        });
        let rb = self
            .client
            .patch(self.table_url("emails"))
            .query(&[("id", eq(id))])
            .json(&payload);
        Ok(self.write_rows::<Email>(rb).await?.into_iter().next())
    }

    async fn get_scenario(&self, id: Uuid) -> PacResult<Option<Scenario>> {
        self.select_one("scenarios", &[("id", eq(id))]).await
    }

    async fn get_member(&self, id: Uuid) -> PacResult<Option<OrgMember>> {
        self.select_one("org_members", &[("id", eq(id))]).await
    }
}
