use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::http::header::{COOKIE, HOST, HeaderMap, HeaderName, REFERER, USER_AGENT};
use axum::http::request::Parts;
use nexus_host::mlua::Value;
use nexus_host::value::{json_to_lua, to_display};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox, kind};
use nexus_store::{SessionStore, Trigger, UserDirectory};
use tracing::warn;

use super::exchange::HttpExchange;

pub const NAME: &str = "request";

/// Cookie carrying the login session id.
pub const SESSION_COOKIE: &str = "sid";

/// Session and account lookup behind `request.auth()`.
#[derive(Clone)]
pub struct WebAuth {
  pub sessions: Arc<dyn SessionStore>,
  pub users: Arc<dyn UserDirectory>,
}

/// What a script learns about the inbound request that started it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDetails {
  pub matched_pattern: String,
  pub matched_name: String,
  pub url: String,
  pub path: String,
  pub query: String,
  pub method: String,
  pub host: String,
  pub uri: String,
  pub user_agent: String,
  pub referer: String,
  pub remote_addr: String,
  /// Lower-cased header name to its first value.
  pub headers: BTreeMap<String, String>,
  pub body: String,
  /// Value of the `sid` cookie, if sent.
  pub session_id: Option<String>,
}

impl RequestDetails {
  pub fn new(trigger: &Trigger, parts: &Parts, remote: Option<SocketAddr>, body: &[u8]) -> Self {
    let header = |name: HeaderName| {
      parts
        .headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
    };

    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
      headers
        .entry(name.as_str().to_string())
        .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let host = match header(HOST) {
      host if host.is_empty() => parts.uri.authority().map(|a| a.to_string()).unwrap_or_default(),
      host => host,
    };
    let uri = parts
      .uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| parts.uri.path().to_string());

    Self {
      matched_pattern: trigger.val1.clone(),
      matched_name: trigger.name.clone(),
      url: parts.uri.to_string(),
      path: parts.uri.path().to_string(),
      query: parts.uri.query().unwrap_or_default().to_string(),
      method: parts.method.as_str().to_string(),
      host,
      uri,
      user_agent: header(USER_AGENT),
      referer: header(REFERER),
      remote_addr: remote.map(|a| a.to_string()).unwrap_or_default(),
      headers,
      body: String::from_utf8_lossy(body).into_owned(),
      session_id: cookie(&parts.headers, SESSION_COOKIE),
    }
  }
}

/// First value of cookie `name` across every `Cookie` header.
fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(';'))
    .filter_map(|pair| pair.trim().split_once('='))
    .find(|(n, _)| *n == name)
    .map(|(_, v)| v.trim_matches('"').to_string())
}

/// Binds `request`: the inbound request plus the response writer.
pub(crate) struct RequestCapability {
  pub(crate) details: RequestDetails,
  pub(crate) exchange: HttpExchange,
  pub(crate) auth: Option<WebAuth>,
}

impl Capability for RequestCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let request = lua.create_table()?;
    let d = &self.details;
    for (key, value) in [
      ("matched_pattern", &d.matched_pattern),
      ("matched_name", &d.matched_name),
      ("url", &d.url),
      ("path", &d.path),
      ("query", &d.query),
      ("method", &d.method),
      ("host", &d.host),
      ("uri", &d.uri),
      ("user_agent", &d.user_agent),
      ("referer", &d.referer),
      ("remote_addr", &d.remote_addr),
      ("body", &d.body),
    ] {
      request.set(key, value.as_str())?;
    }

    let headers = lua.create_table()?;
    for (name, value) in &d.headers {
      headers.set(name.as_str(), value.as_str())?;
    }
    request.set("headers", headers)?;

    let exchange = self.exchange.clone();
    let write = lua.create_function(move |_, data: Value| {
      match &data {
        Value::String(s) => exchange.write(&s.as_bytes()),
        other => exchange.write(to_display(other).as_bytes()),
      };
      Ok(())
    })?;
    request.set("write", write)?;

    let exchange = self.exchange.clone();
    let write_header = lua.create_function(move |_, code: Value| {
      let code = match code {
        Value::Integer(i) => i,
        Value::Number(n) if n.fract() == 0.0 => n as i64,
        _ => return Err(HostError::api("request.write_header takes integer argument").into()),
      };
      let status = u16::try_from(code)
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| HostError::api(format!("invalid status code {code}")))?;
      exchange.write_header(status);
      Ok(())
    })?;
    request.set("write_header", write_header)?;

    let exchange = self.exchange.clone();
    let done = lua.create_function(move |_, ()| {
      exchange.done();
      Ok(())
    })?;
    request.set("done", done)?;

    let session_id = self.details.session_id.clone();
    let auth = self.auth.clone();
    let info = run.clone();
    let authenticate = lua.create_function(move |lua, ()| {
      let Some(sid) = &session_id else {
        return Ok(Value::Nil);
      };
      let Some(auth) = &auth else {
        return Err(HostError::new(kind::WEB, "sessions are not available").into());
      };
      let lookup = async {
        let session = auth.sessions.get_session(sid).await?;
        let user = auth.users.get_user(session.uid).await?;
        Ok::<_, nexus_store::Error>((session, user))
      };
      let (session, user) = info.block_on(lookup).map_err(|e| {
        warn!(run_id = %info.run_id, error = %e, "web_auth_failed");
        HostError::new(kind::WEB, e.to_string())
      })?;
      let result = serde_json::json!({
        "session": session,
        "user": user,
        "authenticated": true,
      });
      json_to_lua(lua, &result)
    })?;
    request.set("auth", authenticate)?;

    sandbox.set_global(NAME, request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::Request;
  use nexus_store::TriggerKind;

  fn trigger() -> Trigger {
    Trigger {
      uid: 4,
      parent_uid: 2,
      owner_uid: 1,
      name: "hooks".to_string(),
      kind: TriggerKind::Http,
      val1: "^/hooks/".to_string(),
      val2: String::new(),
      val3: String::new(),
    }
  }

  #[test]
  fn test_details_from_request_parts() {
    let (parts, _) = Request::builder()
      .method("POST")
      .uri("/hooks/deploy?env=prod")
      .header("Host", "nexus.local:8080")
      .header("User-Agent", "curl/8.0")
      .header("X-Token", "one")
      .header("X-Token", "two")
      .body(())
      .unwrap()
      .into_parts();

    let remote: SocketAddr = "10.0.0.9:5555".parse().unwrap();
    let details = RequestDetails::new(&trigger(), &parts, Some(remote), b"payload");

    assert_eq!(details.matched_pattern, "^/hooks/");
    assert_eq!(details.matched_name, "hooks");
    assert_eq!(details.path, "/hooks/deploy");
    assert_eq!(details.query, "env=prod");
    assert_eq!(details.uri, "/hooks/deploy?env=prod");
    assert_eq!(details.method, "POST");
    assert_eq!(details.host, "nexus.local:8080");
    assert_eq!(details.user_agent, "curl/8.0");
    assert_eq!(details.referer, "");
    assert_eq!(details.remote_addr, "10.0.0.9:5555");
    assert_eq!(details.headers.get("x-token").map(String::as_str), Some("one"));
    assert_eq!(details.body, "payload");
    assert_eq!(details.session_id, None);
  }

  #[test]
  fn test_session_cookie_is_found_among_others() {
    let (parts, _) = Request::builder()
      .uri("/hooks/me")
      .header("Cookie", "theme=dark; sidebar=1")
      .header("Cookie", "lang=en; sid=\"abc123\"")
      .body(())
      .unwrap()
      .into_parts();

    let details = RequestDetails::new(&trigger(), &parts, None, b"");
    assert_eq!(details.session_id.as_deref(), Some("abc123"));
  }
}
