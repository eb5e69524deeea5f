#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use common::{reply_for, FakeMail, Fixture, ScriptedLlm, StaticAuth};
use phishward::app;
use phishward::model::{ChallengeStatus, CurrentUser, MemberRole};
use phishward::store::Store;

const TOKEN: &str = "member-token";
const CLOCK: &str = "clock-secret";

fn router(fx: &Fixture, mail: &Arc<FakeMail>) -> Router {
    let auth = StaticAuth::default()
        .with_member(TOKEN, &fx.member)
        .with_user(
            "admin-token",
            CurrentUser {
                id: Some(Uuid::new_v4()),
                email: Some("admin@corp.test".into()),
                role: Some(MemberRole::Admin),
                organization_id: Some(fx.member.organization_id),
            },
        );
    app(fx.state(mail.clone(), Arc::new(ScriptedLlm::ongoing()), auth))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn member_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn clock_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-super-clock-token", token)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let fx = Fixture::new();
    let app = router(&fx, &FakeMail::new());
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, json) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn challenge_lifecycle_over_http() {
    let fx = Fixture::new();
    let mail = FakeMail::new();
    let app = router(&fx, &mail);

    let (status, challenge) = send(
        &app,
        member_request(
            "POST",
            &format!(
                "/start-challenge?employee_id={}&scenario_id={}",
                fx.employee.id, fx.scenario.id
            ),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(challenge["status"], "ONGOING");
    let challenge_id: Uuid = challenge["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(mail.sent().len(), 1);

    mail.set_inbox(vec![vec![reply_for(
        challenge_id,
        Utc::now() + Duration::seconds(5),
        &fx.employee.email,
    )]]);
    let (status, ingest) = send(&app, clock_request("GET", "/retrieve-answers", CLOCK)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ingest["stored"], 1);
    assert_eq!(ingest["message"], "Found 1 received emails.");

    let (status, last) = send(
        &app,
        member_request(
            "GET",
            &format!("/challenge-last-email-status?challenge_id={challenge_id}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last["role"], "USER");
    assert_eq!(last["status"], "RECEIVED");

    let (status, flow) = send(
        &app,
        member_request(
            "POST",
            &format!("/email-agentic-flow?challenge_id={challenge_id}"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(flow["challenge_status"], "ONGOING");

    let (status, exchanges) = send(
        &app,
        member_request("GET", &format!("/get-exchanges?challenge_id={challenge_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let roles: Vec<&str> = exchanges["exchanges"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["HOOK", "AI", "USER", "AI"]);

    let (_, count) = send(
        &app,
        member_request(
            "GET",
            &format!("/get-exchanges/count?challenge_id={challenge_id}"),
        ),
    )
    .await;
    assert_eq!(count["count"], 4);

    let (status, sent) = send(&app, member_request("POST", "/send-all-pending")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["sent"], 1);
    assert_eq!(mail.sent().len(), 2);

    // Ongoing challenges cannot be deleted.
    let (status, err) = send(
        &app,
        member_request("DELETE", &format!("/challenges?challenge_id={challenge_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error_code"], 4000);

    let req = Request::builder()
        .method("PUT")
        .uri(format!("/challenges/status?challenge_id={challenge_id}"))
        .header("authorization", format!("Bearer {TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"status":"FAILURE","score":15}"#))
        .unwrap();
    let (status, closed) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["status"], "FAILURE");
    assert_eq!(closed["score"], 15);

    let (status, _) = send(
        &app,
        member_request("DELETE", &format!("/challenges?challenge_id={challenge_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        member_request("GET", &format!("/retrieve-status?challenge_id={challenge_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn finished_challenge_status_cannot_be_overridden_again() {
    let fx = Fixture::new();
    let mail = FakeMail::new();
    let app = router(&fx, &mail);

    let (status, started) = send(
        &app,
        member_request(
            "POST",
            &format!(
                "/start-challenge?employee_id={}&scenario_id={}",
                fx.employee.id, fx.scenario.id
            ),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let challenge_id: Uuid = started["id"].as_str().unwrap().parse().unwrap();

    let override_to = |body: &'static str| {
        Request::builder()
            .method("PUT")
            .uri(format!("/challenges/status?challenge_id={challenge_id}"))
            .header("authorization", format!("Bearer {TOKEN}"))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    };
    let (status, closed) = send(&app, override_to(r#"{"status":"SUCCESS","score":90}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["status"], "SUCCESS");

    let (status, err) = send(&app, override_to(r#"{"status":"FAILURE","score":10}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error_code"], 4001);
    assert_eq!(err["http_status"], 400);

    let current = fx.store.get_challenge(challenge_id).await.unwrap().unwrap();
    assert_eq!(current.status, ChallengeStatus::Success);
    assert_eq!(current.score, Some(90));
}

#[tokio::test]
async fn bulk_flow_requires_the_clock_secret() {
    let fx = Fixture::new();
    let app = router(&fx, &FakeMail::new());

    let req = Request::builder()
        .method("POST")
        .uri("/email-agentic-flow-all")
        .body(Body::empty())
        .unwrap();
    let (status, err) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error_code"], 2003);

    let (status, _) = send(&app, clock_request("POST", "/email-agentic-flow-all", "nope")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A member token is not enough either.
    let (status, _) = send(&app, member_request("POST", "/email-agentic-flow-all")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, report) = send(&app, clock_request("POST", "/email-agentic-flow-all", CLOCK)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["succeeded"], 0);
}

#[tokio::test]
async fn member_endpoints_reject_bad_callers() {
    let fx = Fixture::new();
    let app = router(&fx, &FakeMail::new());
    let uri = format!("/retrieve-status?challenge_id={}", Uuid::new_v4());

    let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
    let (status, err) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["error_code"], 2001);

    let req = Request::builder()
        .uri(&uri)
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let req = Request::builder()
        .uri(&uri)
        .header("authorization", "Bearer unknown")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, err) = send(&app, member_request("GET", "/retrieve-status?challenge_id=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error_code"], 4000);
}

#[tokio::test]
async fn oversized_status_body_is_rejected() {
    let fx = Fixture::new();
    let auth = StaticAuth::default().with_member(TOKEN, &fx.member);
    let state = fx
        .state(FakeMail::new(), Arc::new(ScriptedLlm::ongoing()), auth)
        .with_max_request_bytes(Some(64));
    let app = app(state);

    let padding = "x".repeat(256);
    let req = Request::builder()
        .method("PUT")
        .uri(format!("/challenges/status?challenge_id={}", Uuid::new_v4()))
        .header("authorization", format!("Bearer {TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(format!(
            r#"{{"status":"SUCCESS","score":90,"note":"{padding}"}}"#
        )))
        .unwrap();
    let (status, err) = send(&app, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(err["error_code"], 4130);
    assert!(err["message"].as_str().unwrap().contains("64 bytes"));
}

#[tokio::test]
async fn metrics_count_flows() {
    let fx = Fixture::new();
    let app = router(&fx, &FakeMail::new());

    // A failed flow still shows up in the failure counter.
    let _ = send(
        &app,
        member_request(
            "POST",
            &format!("/email-agentic-flow?challenge_id={}", Uuid::new_v4()),
        ),
    )
    .await;

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("pac_flows_total 0"));
    assert!(text.contains("pac_flow_failures_total 1"));
    assert!(text.contains("pac_build_info{version="));
    assert_eq!(text.matches("# HELP pac_emails_sent_total").count(), 1);
}
