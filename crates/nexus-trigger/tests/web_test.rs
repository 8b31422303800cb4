mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{Recorder, trigger};
use chrono::Utc;
use nexus_store::{Session, SessionStore, TriggerKind, User, UserDirectory};
use nexus_trigger::web::{INTERNAL_ERROR_BODY, MAX_BODY_BYTES, NOT_FOUND_BODY, TIMEOUT_BODY, TOO_LARGE_BODY};
use nexus_trigger::{TriggerError, TriggerHandler, WebTriggers};

fn get(path: &str) -> Request<Body> {
  Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
  let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
  String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_first_registered_match_wins() {
  let starter = Recorder::accepting();
  let web = WebTriggers::with_timeout(starter.clone(), Duration::from_millis(50));
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/a"))
    .await
    .unwrap();
  web
    .register(&trigger(2, 20, TriggerKind::Http, "^/a.*"))
    .await
    .unwrap();

  assert_eq!(web.find("/a/x").map(|t| t.uid), Some(1));

  web.handle(get("/a/x")).await;
  let starts = starter.starts();
  assert_eq!(starts.len(), 1);
  assert_eq!(starts[0].runnable_uid, 10);
  assert_eq!(starts[0].context.trigger_uid, Some(1));
  assert_eq!(starts[0].context.kind, TriggerKind::Http);
  assert_eq!(starts[0].seeds, vec!["request".to_string()]);
}

#[tokio::test]
async fn test_unmatched_path_is_not_found() {
  let starter = Recorder::accepting();
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/hooks/"))
    .await
    .unwrap();

  let response = web.handle(get("/elsewhere")).await;
  assert_eq!(response.status(), StatusCode::NOT_FOUND);
  assert_eq!(body_text(response).await, NOT_FOUND_BODY);
  assert!(starter.starts().is_empty());
}

#[tokio::test]
async fn test_invalid_pattern_is_skipped() {
  let web = WebTriggers::new(Recorder::accepting());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "(unclosed"))
    .await
    .unwrap();
  web
    .register(&trigger(2, 20, TriggerKind::Http, "^/b"))
    .await
    .unwrap();

  assert_eq!(web.find("/b").map(|t| t.uid), Some(2));
  assert_eq!(web.find("(unclosed"), None);
}

#[tokio::test]
async fn test_duplicate_and_delete() {
  let web = WebTriggers::new(Recorder::accepting());
  let t = trigger(1, 10, TriggerKind::Http, "^/");
  web.register(&t).await.unwrap();
  assert!(matches!(
    web.register(&t).await,
    Err(TriggerError::AlreadyRegistered { trigger_uid: 1 })
  ));

  web.delete(10).await.unwrap();
  web.delete(10).await.unwrap();
  assert_eq!(web.find("/anything"), None);
}

#[tokio::test]
async fn test_start_failure_is_internal_error() {
  let web = WebTriggers::new(Recorder::failing());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/"))
    .await
    .unwrap();

  let response = web.handle(get("/x")).await;
  assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(body_text(response).await, INTERNAL_ERROR_BODY);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_writes_response() {
  let script = r#"
    request.write_header(201)
    request.write("hello " .. request.method .. " " .. request.path .. " " .. request.query)
    request.done()
  "#;
  let starter = Recorder::running(&[(10, script)]).await;
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/hooks/"))
    .await
    .unwrap();

  let response = web.handle(get("/hooks/deploy?env=prod")).await;
  assert_eq!(response.status(), StatusCode::CREATED);
  assert_eq!(body_text(response).await, "hello GET /hooks/deploy env=prod");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_sees_body_and_headers() {
  let script = r#"
    request.write(request.headers["x-token"] .. "|" .. request.body)
    request.done()
  "#;
  let starter = Recorder::running(&[(10, script)]).await;
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/"))
    .await
    .unwrap();

  let request = Request::builder()
    .method("POST")
    .uri("/ingest")
    .header("X-Token", "secret")
    .body(Body::from("payload"))
    .unwrap();
  let response = web.handle(request).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(body_text(response).await, "secret|payload");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_header_rejects_non_integer() {
  let script = r#"
    local ok, err = pcall(request.write_header, "teapot")
    request.write(tostring(ok) .. ":" .. tostring(string.find(tostring(err), "integer argument", 1, true) ~= nil))
    request.done()
  "#;
  let starter = Recorder::running(&[(10, script)]).await;
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/"))
    .await
    .unwrap();

  let response = web.handle(get("/")).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(body_text(response).await, "false:true");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_without_done_times_out() {
  let timeout = Duration::from_millis(300);
  let starter = Recorder::running(&[(10, "request.write('never sent')")]).await;
  let web = WebTriggers::with_timeout(starter.clone(), timeout);
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/slow"))
    .await
    .unwrap();

  let started = Instant::now();
  let response = web.handle(get("/slow")).await;
  let elapsed = started.elapsed();

  assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  assert_eq!(body_text(response).await, TIMEOUT_BODY);
  assert!(elapsed >= timeout);
  assert!(elapsed < timeout + Duration::from_secs(2));

  let outcomes = starter.wait_for_outcomes(1, Duration::from_secs(5)).await;
  assert_eq!(outcomes[0].error, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_router_serves_over_tcp() {
  let script = r#"
    request.write(request.remote_addr ~= "" and "remote-known" or "remote-missing")
    request.done()
  "#;
  let starter = Recorder::running(&[(10, script)]).await;
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/"))
    .await
    .unwrap();

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let app = web.router().into_make_service_with_connect_info::<SocketAddr>();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });

  let response = reqwest::get(format!("http://{addr}/hello")).await.unwrap();
  assert_eq!(response.status(), reqwest::StatusCode::OK);
  assert_eq!(response.text().await.unwrap(), "remote-known");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
  let starter = Recorder::accepting();
  let web = WebTriggers::new(starter.clone());
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/"))
    .await
    .unwrap();

  let request = Request::builder()
    .method("POST")
    .uri("/upload")
    .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
    .unwrap();
  let response = web.handle(request).await;
  assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
  assert_eq!(body_text(response).await, TOO_LARGE_BODY);
  assert!(starter.starts().is_empty());
}

const AUTH_SCRIPT: &str = r#"
  local ok, auth = pcall(request.auth)
  if not ok then
    request.write("error:" .. tostring(string.find(tostring(auth), "web: ", 1, true) ~= nil))
  elseif auth == nil then
    request.write("anonymous")
  else
    request.write(auth.user.username .. "|" .. auth.session.authed_via .. "|" .. tostring(auth.authenticated))
  end
  request.done()
"#;

async fn auth_web() -> WebTriggers {
  let starter = Recorder::running(&[(10, AUTH_SCRIPT)]).await;
  starter
    .store
    .save_user(&User {
      uid: 3,
      username: "ada".to_string(),
      display_name: "Ada".to_string(),
      admin: false,
      created_at: Utc::now(),
    })
    .await
    .unwrap();
  starter
    .store
    .save_session(&Session {
      sid: "good-sid".to_string(),
      uid: 3,
      created_at: Utc::now(),
      revoked: false,
      can_access_web: true,
      can_access_sys_api: false,
      authed_via: "PASS".to_string(),
    })
    .await
    .unwrap();

  let store = Arc::new(starter.store.clone());
  let web = WebTriggers::new(starter.clone()).with_auth(store.clone(), store);
  web
    .register(&trigger(1, 10, TriggerKind::Http, "^/me"))
    .await
    .unwrap();
  web
}

fn with_cookie(cookie: &str) -> Request<Body> {
  Request::builder()
    .uri("/me")
    .header("Cookie", cookie)
    .body(Body::empty())
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_without_cookie_is_nil() {
  let web = auth_web().await;
  let response = web.handle(get("/me")).await;
  assert_eq!(body_text(response).await, "anonymous");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_resolves_session_and_user() {
  let web = auth_web().await;
  let response = web.handle(with_cookie("theme=dark; sid=good-sid")).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(body_text(response).await, "ada|PASS|true");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_with_unknown_session_raises_web_error() {
  let web = auth_web().await;
  let response = web.handle(with_cookie("sid=stale")).await;
  assert_eq!(body_text(response).await, "error:true");
}
