//! Web triggers.
//!
//! `val1` is a regular expression matched against the request path. Requests
//! are matched against triggers in registration order; the first match starts
//! a run whose sandbox holds a `request` object. The HTTP response is held
//! until the script calls `request.done()` or the timeout passes. Bodies over
//! [`MAX_BODY_BYTES`] are answered with 413 and start no run.

mod exchange;
mod request;

pub use exchange::{HttpExchange, INTERNAL_ERROR_BODY, NOT_FOUND_BODY, TIMEOUT_BODY};
pub use request::{RequestDetails, SESSION_COOKIE, WebAuth};

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nexus_host::{Capability, StartContext};
use nexus_runtime::RunStarter;
use nexus_store::{SessionStore, Trigger, TriggerKind, UserDirectory};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::error::TriggerError;
use crate::handler::TriggerHandler;
use request::RequestCapability;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

/// Largest request body passed to a script.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const TOO_LARGE_BODY: &str = "Request body too large";

struct Route {
  trigger: Trigger,
  /// `None` when `val1` did not compile; the route never matches.
  pattern: Option<Regex>,
}

struct WebInner {
  starter: Arc<dyn RunStarter>,
  routes: RwLock<Vec<Route>>,
  timeout: Duration,
}

/// Handler for [`TriggerKind::Http`], also the HTTP entry point.
#[derive(Clone)]
pub struct WebTriggers {
  inner: Arc<WebInner>,
  auth: Option<WebAuth>,
}

impl WebTriggers {
  pub fn new(starter: Arc<dyn RunStarter>) -> Self {
    Self::with_timeout(starter, DEFAULT_TIMEOUT)
  }

  pub fn with_timeout(starter: Arc<dyn RunStarter>, timeout: Duration) -> Self {
    Self {
      inner: Arc::new(WebInner {
        starter,
        routes: RwLock::new(Vec::new()),
        timeout,
      }),
      auth: None,
    }
  }

  /// Resolve `sid` cookies through `sessions` and `users` in `request.auth()`.
  pub fn with_auth(mut self, sessions: Arc<dyn SessionStore>, users: Arc<dyn UserDirectory>) -> Self {
    self.auth = Some(WebAuth { sessions, users });
    self
  }

  /// A router sending every request to [`WebTriggers::handle`].
  pub fn router(&self) -> Router {
    Router::new().fallback(serve).with_state(self.clone())
  }

  /// First registered trigger whose pattern matches `path`.
  pub fn find(&self, path: &str) -> Option<Trigger> {
    let routes = self.inner.routes.read().unwrap_or_else(|e| e.into_inner());
    routes
      .iter()
      .find(|r| r.pattern.as_ref().is_some_and(|p| p.is_match(path)))
      .map(|r| r.trigger.clone())
  }

  #[instrument(
    name = "web_request",
    skip(self, request),
    fields(method = %request.method(), path = %request.uri().path())
  )]
  pub async fn handle(&self, request: Request) -> Response {
    let Some(trigger) = self.find(request.uri().path()) else {
      debug!("web_no_route");
      return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
    };

    let remote = request
      .extensions()
      .get::<ConnectInfo<SocketAddr>>()
      .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    // A body that cannot be read within the limit is either too large or from
    // a client that already went away.
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(trigger_uid = trigger.uid, error = %e, "web_body_rejected");
        return (StatusCode::PAYLOAD_TOO_LARGE, TOO_LARGE_BODY).into_response();
      }
    };

    let exchange = HttpExchange::new();
    let seed: Arc<dyn Capability> = Arc::new(RequestCapability {
      details: RequestDetails::new(&trigger, &parts, remote, &body),
      exchange: exchange.clone(),
      auth: self.auth.clone(),
    });

    match self
      .inner
      .starter
      .start_run(trigger.parent_uid, StartContext::from_trigger(&trigger), vec![seed])
      .await
    {
      Ok(handle) => debug!(trigger_uid = trigger.uid, run_id = %handle.run_id, "web_run_started"),
      Err(e) => {
        warn!(trigger_uid = trigger.uid, error = %e, "web_run_failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
      }
    }

    let response = exchange.respond_within(self.inner.timeout).await;
    if response.status() == StatusCode::BAD_GATEWAY && !exchange.is_done() {
      warn!(trigger_uid = trigger.uid, "web_run_timeout");
    }
    response
  }
}

async fn serve(State(web): State<WebTriggers>, request: Request<Body>) -> Response {
  web.handle(request).await
}

#[async_trait]
impl TriggerHandler for WebTriggers {
  fn kind(&self) -> TriggerKind {
    TriggerKind::Http
  }

  async fn register(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    let mut routes = self.inner.routes.write().unwrap_or_else(|e| e.into_inner());
    if routes.iter().any(|r| r.trigger.uid == trigger.uid) {
      return Err(TriggerError::AlreadyRegistered {
        trigger_uid: trigger.uid,
      });
    }

    let pattern = match Regex::new(&trigger.val1) {
      Ok(pattern) => Some(pattern),
      Err(e) => {
        warn!(
          trigger_uid = trigger.uid,
          pattern = %trigger.val1,
          error = %e,
          "web_pattern_invalid"
        );
        None
      }
    };
    routes.push(Route {
      trigger: trigger.clone(),
      pattern,
    });
    Ok(())
  }

  async fn delete(&self, parent_uid: i64) -> Result<(), TriggerError> {
    let mut routes = self.inner.routes.write().unwrap_or_else(|e| e.into_inner());
    routes.retain(|r| r.trigger.parent_uid != parent_uid);
    Ok(())
  }
}
