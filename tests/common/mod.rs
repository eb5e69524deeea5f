#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use phishward::auth::{Authenticator, Member};
use phishward::gateway::{InboundPage, InboundReply, InboundSummary, MailTransport, OutboundEmail};
use phishward::llm::{CompletionClient, Prompt};
use phishward::marker;
use phishward::model::{
    Challenge, ChallengeFilter, ChallengeUpdate, Complexity, CurrentUser, Email, EmailDraft,
    EmailRole, MemberRole, NewChallenge, OrgMember, Scenario,
};
use phishward::store::{MemoryStore, Store};
use phishward::{AppState, PacError, PacResult};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// In-memory mail provider. Inbound pages are keyed by the `after` cursor.
#[derive(Default)]
pub struct FakeMail {
    pub sent: Mutex<Vec<OutboundEmail>>,
    pages: Mutex<HashMap<Option<String>, InboundPage>>,
    replies: Mutex<HashMap<String, InboundReply>>,
    failing_recipients: Mutex<HashSet<String>>,
    pub list_calls: Mutex<Vec<Option<String>>>,
    pub detail_calls: AtomicUsize,
}

impl FakeMail {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends_to(&self, address: &str) {
        self.failing_recipients
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    /// Script the inbound mailbox as consecutive pages of replies, newest
    /// first. Every page but the last reports `has_more`.
    pub fn set_inbox(&self, pages: Vec<Vec<InboundReply>>) {
        let mut by_cursor = self.pages.lock().unwrap();
        let mut replies = self.replies.lock().unwrap();
        by_cursor.clear();
        let mut cursor: Option<String> = None;
        let count = pages.len();
        for (idx, page) in pages.into_iter().enumerate() {
            let last = page.last().map(|r| r.id.clone());
            let data = page
                .iter()
                .map(|r| InboundSummary { id: r.id.clone() })
                .collect();
            for reply in page {
                replies.insert(reply.id.clone(), reply);
            }
            by_cursor.insert(
                cursor.clone(),
                InboundPage {
                    data,
                    has_more: idx + 1 < count,
                },
            );
            cursor = last;
        }
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MailTransport for FakeMail {
    async fn send(&self, email: &OutboundEmail) -> PacResult<String> {
        if self.failing_recipients.lock().unwrap().contains(&email.to) {
            return Err(PacError::BadGateway("Failed to send email via Resend.".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(Uuid::new_v4().to_string())
    }

    async fn list_inbound(&self, after: Option<&str>) -> PacResult<InboundPage> {
        let key = after.map(String::from);
        self.list_calls.lock().unwrap().push(key.clone());
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_inbound(&self, id: &str) -> PacResult<InboundReply> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| PacError::BadGateway(format!("unknown inbound email {id}")))
    }
}

/// Completion client answering by stage. A user prompt containing
/// `fail_marker` makes the call fail as if the provider were down.
pub struct ScriptedLlm {
    pub analysis: String,
    pub decision: String,
    pub writer: String,
    pub hook: String,
    pub fail_marker: Option<String>,
    pub calls: Mutex<Vec<Prompt>>,
}

impl ScriptedLlm {
    pub fn new(decision: &str, writer: &str) -> Self {
        Self {
            analysis: "The participant is engaging with the sender.".into(),
            decision: decision.into(),
            writer: writer.into(),
            hook: r#"{"subject":"Action needed","body":"<p>Please review.</p>"}"#.into(),
            fail_marker: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn ongoing() -> Self {
        Self::new(
            r#"{"status":"ongoing","score":null}"#,
            r#"{"subject":"Re: Invoice","body":"<p>Could you send the form today?</p>"}"#,
        )
    }

    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for ScriptedLlm {
    async fn complete(&self, prompt: &Prompt) -> PacResult<String> {
        self.calls.lock().unwrap().push(prompt.clone());
        if let Some(marker) = &self.fail_marker {
            if prompt.user.contains(marker.as_str()) {
                return Err(PacError::Unavailable {
                    service: "LLM provider",
                });
            }
        }
        let system = prompt.system.as_str();
        let reply = if system.contains("analysis agent") {
            &self.analysis
        } else if system.contains("deciding agent") {
            &self.decision
        } else if system.contains("hook email agent") {
            &self.hook
        } else {
            &self.writer
        };
        Ok(reply.clone())
    }
}

/// Authenticator backed by a fixed token table.
#[derive(Default)]
pub struct StaticAuth {
    users: HashMap<String, CurrentUser>,
}

impl StaticAuth {
    pub fn with_member(mut self, token: &str, member: &Member) -> Self {
        self.users.insert(
            token.to_string(),
            CurrentUser {
                id: Some(member.user_id),
                email: Some("owner@corp.test".into()),
                role: Some(MemberRole::Member),
                organization_id: Some(member.organization_id),
            },
        );
        self
    }

    pub fn with_user(mut self, token: &str, user: CurrentUser) -> Self {
        self.users.insert(token.to_string(), user);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn current_user(&self, token: &str) -> PacResult<CurrentUser> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| PacError::BadGateway("Could not validate credentials".into()))
    }
}

/// One organization with a member who runs challenges, an employee who
/// receives them, a scenario and its HOOK template.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub member: Member,
    pub employee: OrgMember,
    pub scenario: Scenario,
    pub hook: Email,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let organization_id = Uuid::new_v4();
        let member = Member {
            user_id: Uuid::new_v4(),
            organization_id,
        };
        let employee = OrgMember {
            id: Uuid::new_v4(),
            organization_id,
            first_name: "Sam".into(),
            last_name: "Rivera".into(),
            email: "sam@corp.test".into(),
        };
        store.insert_member(employee.clone());
        let (scenario, hook) = seed_scenario(&store, organization_id, "Invoice fraud");
        Self {
            store,
            member,
            employee,
            scenario,
            hook,
        }
    }

    /// Another employee of the same organization.
    pub fn add_employee(&self, email: &str) -> OrgMember {
        let employee = OrgMember {
            id: Uuid::new_v4(),
            organization_id: self.member.organization_id,
            first_name: "Alex".into(),
            last_name: "Kim".into(),
            email: email.into(),
        };
        self.store.insert_member(employee.clone());
        employee
    }

    pub fn state(&self, mail: Arc<FakeMail>, llm: Arc<ScriptedLlm>, auth: StaticAuth) -> AppState {
        AppState::new(
            self.store.clone(),
            mail,
            llm,
            Arc::new(auth),
            Some("clock-secret".into()),
        )
    }
}

pub fn seed_scenario(store: &MemoryStore, organization_id: Uuid, name: &str) -> (Scenario, Email) {
    let scenario = Scenario {
        id: Uuid::new_v4(),
        organization_id,
        name: name.into(),
        complexity: Complexity::Easy,
        system_prompt: format!("{name}: get the participant to pay a fake invoice"),
        misc_info: None,
    };
    store.insert_scenario(scenario.clone());
    let hook = Email {
        id: Uuid::new_v4(),
        scenario_id: scenario.id,
        role: EmailRole::Hook,
        target_id: None,
        previous_email: None,
        subject: Some("Invoice".into()),
        sender_email: "billing@supplier.test".into(),
        language: "en".into(),
        body: Some("<p>Please settle the attached invoice.</p>".into()),
        variables: None,
        status: None,
        challenge_id: None,
        created_at: Utc::now() - Duration::days(30),
        updated_at: None,
    };
    store.insert_email(hook.clone());
    (scenario, hook)
}

/// Inbound reply quoting a marked email for `challenge_id`.
pub fn reply_for(challenge_id: Uuid, at: DateTime<Utc>, from: &str) -> InboundReply {
    let quoted = marker::inject(Some("<p>Please settle the attached invoice.</p>"), challenge_id);
    InboundReply {
        id: Uuid::new_v4().to_string(),
        from: Some(from.to_string()),
        subject: Some("Re: Invoice".into()),
        html: Some(format!("<p>Which invoice is this?</p><blockquote>{quoted}</blockquote>")),
        text: Some("Which invoice is this?".into()),
        created_at: Some(at.to_rfc3339()),
    }
}

/// Reply that does not quote any marker.
pub fn unmarked_reply(at: DateTime<Utc>) -> InboundReply {
    InboundReply {
        id: Uuid::new_v4().to_string(),
        from: Some("someone@else.test".into()),
        subject: Some("hello".into()),
        html: Some("<p>unrelated</p>".into()),
        text: None,
        created_at: Some(at.to_rfc3339()),
    }
}

/// Store whose challenge updates never land: `fail` turns the miss into an
/// error.
pub struct StaleStore {
    pub inner: Arc<MemoryStore>,
    pub fail: bool,
}

#[async_trait]
impl Store for StaleStore {
    async fn get_challenge(&self, id: Uuid) -> PacResult<Option<Challenge>> {
        self.inner.get_challenge(id).await
    }
    async fn insert_challenge(&self, new: NewChallenge) -> PacResult<Challenge> {
        self.inner.insert_challenge(new).await
    }
    async fn delete_challenge(&self, id: Uuid) -> PacResult<bool> {
        self.inner.delete_challenge(id).await
    }
    async fn list_challenges(&self, filter: &ChallengeFilter) -> PacResult<Vec<Challenge>> {
        self.inner.list_challenges(filter).await
    }
    async fn update_challenge(
        &self,
        _id: Uuid,
        _update: ChallengeUpdate,
    ) -> PacResult<Option<Challenge>> {
        if self.fail {
            Err(PacError::Store("connection reset".into()))
        } else {
            Ok(None)
        }
    }
    async fn get_email(&self, id: Uuid) -> PacResult<Option<Email>> {
        self.inner.get_email(id).await
    }
    async fn upsert_email(&self, draft: EmailDraft) -> PacResult<(Email, bool)> {
        self.inner.upsert_email(draft).await
    }
    async fn hook_email_for_scenario(&self, scenario_id: Uuid) -> PacResult<Option<Email>> {
        self.inner.hook_email_for_scenario(scenario_id).await
    }
    async fn latest_received_email(&self) -> PacResult<Option<Email>> {
        self.inner.latest_received_email().await
    }
    async fn latest_email_before(
        &self,
        challenge_id: Uuid,
        before: chrono::DateTime<Utc>,
    ) -> PacResult<Option<Email>> {
        self.inner.latest_email_before(challenge_id, before).await
    }
    async fn pending_emails(
        &self,
        scenario_id: Uuid,
        target_id: Uuid,
        challenge_id: Uuid,
    ) -> PacResult<Vec<Email>> {
        self.inner
            .pending_emails(scenario_id, target_id, challenge_id)
            .await
    }
    async fn mark_email_sent(&self, id: Uuid, challenge_id: Uuid) -> PacResult<Option<Email>> {
        self.inner.mark_email_sent(id, challenge_id).await
    }
    async fn get_scenario(&self, id: Uuid) -> PacResult<Option<Scenario>> {
        self.inner.get_scenario(id).await
    }
    async fn get_member(&self, id: Uuid) -> PacResult<Option<OrgMember>> {
        self.inner.get_member(id).await
    }
}
