//! Core library for Phishward.  This module wires the stores, provider
//! clients and services into shared state and exposes them over a single
//! axum router: the monitoring surface (challenges, exchanges, ingestion,
//! dispatch) and the agentic surface (email flow, hook generation).

mod config;
pub mod agents;
pub mod auth;
pub mod chain;
pub mod challenges;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod llm;
pub mod marker;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod util;

pub use config::AppConfig;
pub use error::{ErrorResponse, PacError, PacResult};

use anyhow::Context;
use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection, QueryRejection},
    DefaultBodyLimit, Query, State,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;
use uuid::Uuid;

use crate::agents::AgentPipeline;
use crate::auth::{Authenticator, Caller, HttpAuthenticator, Member, SUPER_CLOCK_HEADER};
use crate::challenges::{ChallengeService, StatusOverride};
use crate::dispatch::PendingDispatcher;
use crate::gateway::{MailTransport, ResendGateway};
use crate::ingest::ReplyIngestor;
use crate::llm::{CompletionClient, OpenAiClient};
use crate::model::ChallengeStatus;
use crate::orchestrator::ChallengeOrchestrator;
use crate::store::{MemoryStore, PostgrestStore, Store};

/// Process-wide counters exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub flows_total: AtomicU64,
    pub flow_failures_total: AtomicU64,
    pub replies_stored_total: AtomicU64,
    pub emails_sent_total: AtomicU64,
    pub dispatch_failures_total: AtomicU64,
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<dyn Authenticator>,
    pub challenges: ChallengeService,
    pub ingestor: ReplyIngestor,
    pub dispatcher: PendingDispatcher,
    pub orchestrator: ChallengeOrchestrator,
    pub super_clock_token: Option<String>,
    pub max_request_bytes: Option<usize>,
    pub metrics: Arc<Metrics>,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Assemble the services around already-built collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        mail: Arc<dyn MailTransport>,
        llm: Arc<dyn CompletionClient>,
        auth: Arc<dyn Authenticator>,
        super_clock_token: Option<String>,
    ) -> Self {
        let agents = AgentPipeline::new(llm);
        Self {
            challenges: ChallengeService::new(store.clone(), mail.clone()),
            ingestor: ReplyIngestor::new(store.clone(), mail.clone()),
            dispatcher: PendingDispatcher::new(store.clone(), mail),
            orchestrator: ChallengeOrchestrator::new(store.clone(), agents),
            store,
            auth,
            super_clock_token: super_clock_token.filter(|t| !t.is_empty()),
            max_request_bytes: None,
            metrics: Arc::new(Metrics::default()),
            process_start_instant: Instant::now(),
        }
    }

    pub fn with_max_request_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_request_bytes = limit;
        self
    }
}

/// Build state from a loaded configuration.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn Store> = match &config.database {
        Some(db) => Arc::new(
            PostgrestStore::new(&db.url, &db.key, config.timeouts.peer)
                .context("failed to build PostgREST store")?,
        ),
        None => {
            tracing::warn!("SUPABASE_URL not set; using the in-memory store, data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let mail = ResendGateway::new(
        &config.mail.api_base,
        config.mail.api_key.clone(),
        &config.mail.from_address,
        config.timeouts.provider,
    )
    .context("failed to build mail gateway")?;
    if config.mail.api_key.is_none() {
        tracing::warn!("RESEND_API_KEY not set; sending and inbound polling will fail");
    }
    let llm = OpenAiClient::new(
        &config.llm.api_base,
        config.llm.api_key.clone(),
        &config.llm.model,
        config.timeouts.llm,
    )
    .context("failed to build LLM client")?;
    let auth = HttpAuthenticator::new(&config.auth_service_url, config.timeouts.peer)
        .context("failed to build authentication client")?;
    if config.super_clock_token.is_none() {
        tracing::warn!("SUPER_CLOCK_TOKEN not set; clock-triggered endpoints are disabled");
    }

    Ok(AppState::new(
        store,
        Arc::new(mail),
        Arc::new(llm),
        Arc::new(auth),
        config.super_clock_token.clone(),
    )
    .with_max_request_bytes(config.max_request_bytes))
}

/// Build state from environment variables.  See [`AppConfig::from_env`] for
/// the recognised variables.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    build_state(&config).map_err(|e| e.into())
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/start-challenge", post(start_challenge_handler))
        .route("/retrieve-status", get(retrieve_status_handler))
        .route(
            "/challenges",
            get(list_challenges_handler).delete(delete_challenge_handler),
        )
        .route("/challenges/status", put(update_status_handler))
        .route("/get-exchanges", get(get_exchanges_handler))
        .route("/get-exchanges/count", get(exchange_count_handler))
        .route("/challenge-last-email-status", get(last_email_status_handler))
        .route("/retrieve-answers", get(retrieve_answers_handler))
        .route("/send-all-pending", post(send_all_pending_handler))
        .route("/send-all-pending-emails", post(send_all_pending_handler))
        .route("/email-agentic-flow", post(email_flow_handler))
        .route("/email-agentic-flow-all", post(email_flow_all_handler))
        .route("/generate-hook-email", post(generate_hook_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct StartChallengeQuery {
    employee_id: Uuid,
    scenario_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct StatusFilterQuery {
    #[serde(default)]
    status: Option<ChallengeStatus>,
}

#[derive(Debug, Deserialize)]
struct ScenarioQuery {
    scenario_id: Uuid,
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn error_response(err: &PacError) -> axum::response::Response {
    if err.http_status() >= 500 {
        tracing::warn!(error=%err, code=err.error_code(), "request failed");
    } else {
        tracing::debug!(error=%err, code=err.error_code(), "request rejected");
    }
    respond_with_error(ErrorResponse::from(err))
}

fn query_error(rejection: QueryRejection) -> axum::response::Response {
    error_response(&PacError::BadRequest(rejection.body_text()))
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            let message = match state.max_request_bytes {
                Some(limit) => {
                    tracing::warn!(limit, "request body exceeded configured limit");
                    format!("Request too large (body exceeded limit {} bytes)", limit)
                }
                None => "Request too large".to_string(),
            };
            respond_with_error(ErrorResponse {
                error_code: 4130,
                message,
                http_status: 413,
            })
        }
        JsonRejection::BytesRejection(bytes) => bytes.into_response(),
        other => other.into_response(),
    }
}

/// Resolve a member from the bearer token.
async fn member_from_headers(state: &AppState, headers: &HeaderMap) -> PacResult<Member> {
    let token = auth::extract_bearer_token(headers)?;
    let user = state.auth.current_user(&token).await?;
    auth::require_member(&user)
}

/// The super-clock header wins when present; otherwise a member is required.
async fn caller_from_headers(state: &AppState, headers: &HeaderMap) -> PacResult<Caller> {
    if headers.contains_key(SUPER_CLOCK_HEADER) {
        auth::verify_clock_token(headers, state.super_clock_token.as_deref())?;
        return Ok(Caller::Clock);
    }
    Ok(Caller::Member(member_from_headers(state, headers).await?))
}

fn ok_json<T: serde::Serialize>(status: StatusCode, value: T) -> axum::response::Response {
    (status, Json(value)).into_response()
}

async fn start_challenge_handler(
    State(state): State<AppState>,
    query: Result<Query<StartChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .start_challenge(&member, params.employee_id, params.scenario_id)
            .await
    }
    .await;
    match result {
        Ok(challenge) => {
            state.metrics.emails_sent_total.fetch_add(1, Ordering::Relaxed);
            ok_json(StatusCode::CREATED, challenge)
        }
        Err(err) => error_response(&err),
    }
}

async fn retrieve_status_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .retrieve_status(&member, params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(status) => ok_json(StatusCode::OK, serde_json::json!({ "status": status })),
        Err(err) => error_response(&err),
    }
}

async fn list_challenges_handler(
    State(state): State<AppState>,
    query: Result<Query<StatusFilterQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state.challenges.list_challenges(&member, params.status).await
    }
    .await;
    match result {
        Ok(items) => ok_json(StatusCode::OK, serde_json::json!({ "items": items })),
        Err(err) => error_response(&err),
    }
}

async fn delete_challenge_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .delete_challenge(&member, params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(()) => ok_json(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "message": format!("Challenge {} deleted successfully.", params.challenge_id),
            }),
        ),
        Err(err) => error_response(&err),
    }
}

async fn update_status_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
    payload: Result<Json<StatusOverride>, JsonRejection>,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let change = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .update_status(&member, params.challenge_id, change)
            .await
    }
    .await;
    match result {
        Ok(challenge) => ok_json(StatusCode::OK, challenge),
        Err(err) => error_response(&err),
    }
}

async fn get_exchanges_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .get_exchanges(&member, params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(exchanges) => ok_json(StatusCode::OK, serde_json::json!({ "exchanges": exchanges })),
        Err(err) => error_response(&err),
    }
}

async fn exchange_count_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .exchange_count(&member, params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(count) => ok_json(StatusCode::OK, serde_json::json!({ "count": count })),
        Err(err) => error_response(&err),
    }
}

async fn last_email_status_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .challenges
            .last_email_status(&member, params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(last) => ok_json(StatusCode::OK, last),
        Err(err) => error_response(&err),
    }
}

/// Reply ingestion, for the clock or a member.
async fn retrieve_answers_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let result = async {
        let caller = caller_from_headers(&state, &headers).await?;
        state.ingestor.retrieve_answers(&caller).await
    }
    .await;
    match result {
        Ok(report) => {
            state
                .metrics
                .replies_stored_total
                .fetch_add(report.stored as u64, Ordering::Relaxed);
            ok_json(
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "message": format!("Found {} received emails.", report.stored),
                    "stored": report.stored,
                    "dropped": report.dropped,
                    "errors": report.errors,
                }),
            )
        }
        Err(err) => error_response(&err),
    }
}

async fn send_all_pending_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let result = async {
        let caller = caller_from_headers(&state, &headers).await?;
        state.dispatcher.send_all_pending(&caller).await
    }
    .await;
    match result {
        Ok(report) => {
            state
                .metrics
                .emails_sent_total
                .fetch_add(report.succeeded as u64, Ordering::Relaxed);
            state
                .metrics
                .dispatch_failures_total
                .fetch_add(report.failed() as u64, Ordering::Relaxed);
            ok_json(
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "message": format!("Sent {} pending emails.", report.succeeded),
                    "sent": report.succeeded,
                    "failures": report.failures,
                }),
            )
        }
        Err(err) => error_response(&err),
    }
}

async fn email_flow_handler(
    State(state): State<AppState>,
    query: Result<Query<ChallengeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .orchestrator
            .run_email_flow(&Caller::Member(member), params.challenge_id)
            .await
    }
    .await;
    match result {
        Ok(outcome) => {
            state.metrics.flows_total.fetch_add(1, Ordering::Relaxed);
            ok_json(StatusCode::CREATED, outcome)
        }
        Err(err) => {
            state.metrics.flow_failures_total.fetch_add(1, Ordering::Relaxed);
            error_response(&err)
        }
    }
}

/// Bulk flow; clock only.
async fn email_flow_all_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(err) = auth::verify_clock_token(&headers, state.super_clock_token.as_deref()) {
        return error_response(&err);
    }
    match state.orchestrator.run_all().await {
        Ok(report) => {
            state
                .metrics
                .flows_total
                .fetch_add(report.succeeded as u64, Ordering::Relaxed);
            state
                .metrics
                .flow_failures_total
                .fetch_add(report.failed() as u64, Ordering::Relaxed);
            ok_json(
                StatusCode::OK,
                serde_json::json!({
                    "status": "ok",
                    "message": format!("Generated {} agentic responses.", report.succeeded),
                    "succeeded": report.succeeded,
                    "skipped": report.skipped,
                    "failures": report.failures,
                }),
            )
        }
        Err(err) => error_response(&err),
    }
}

async fn generate_hook_handler(
    State(state): State<AppState>,
    query: Result<Query<ScenarioQuery>, QueryRejection>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return query_error(rejection),
    };
    let result = async {
        let member = member_from_headers(&state, &headers).await?;
        state
            .orchestrator
            .generate_hook_email(member.organization_id, params.scenario_id)
            .await
    }
    .await;
    match result {
        Ok(draft) => ok_json(StatusCode::CREATED, draft),
        Err(err) => error_response(&err),
    }
}

async fn health_handler() -> axum::response::Response {
    ok_json(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let m = &state.metrics;
    let counters: [(&str, &str, &AtomicU64); 5] = [
        ("pac_flows_total", "Email flow runs that stored a reply", &m.flows_total),
        ("pac_flow_failures_total", "Email flow runs that failed", &m.flow_failures_total),
        ("pac_replies_stored_total", "Inbound replies stored", &m.replies_stored_total),
        ("pac_emails_sent_total", "Emails handed to the mail provider", &m.emails_sent_total),
        ("pac_dispatch_failures_total", "Pending emails that failed to send", &m.dispatch_failures_total),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value.load(Ordering::Relaxed)).ok();
    }
    writeln!(
        &mut buf,
        "# HELP pac_build_info Build information\n# TYPE pac_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pac_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pac_process_uptime_seconds Process uptime seconds\n# TYPE pac_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pac_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
