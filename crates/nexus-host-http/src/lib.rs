//! Web capability.
//!
//! Binds `web.get(url, [data], on_success, on_error)` and the matching
//! `web.post`. `data` is a table of strings or string arrays, encoded as the
//! query string for GET and as a form body for POST. The call blocks until the
//! response has been read, then invokes `on_success(body, status)`; transport
//! failures go to `on_error(message)` instead of raising.

use std::time::Duration;

use nexus_host::mlua::{Function, Table, Value, Variadic};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox};
use reqwest::{Client, Method};
use tracing::{debug, warn};
use url::Url;

pub const NAME: &str = "web";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebCapability {
  client: Client,
}

impl WebCapability {
  pub fn new(client: Client) -> Self {
    Self { client }
  }
}

impl Default for WebCapability {
  fn default() -> Self {
    let client = Client::builder()
      .timeout(DEFAULT_TIMEOUT)
      .build()
      .unwrap_or_default();
    Self::new(client)
  }
}

struct WebCall {
  url: Url,
  data: Vec<(String, String)>,
  on_success: Function,
  on_error: Function,
}

fn form_values(data: Table) -> Result<Vec<(String, String)>, HostError> {
  let mut values = Vec::new();
  for pair in data.pairs::<String, Value>() {
    let (key, value) = pair.map_err(|_| HostError::api("data keys must be strings"))?;
    match value {
      Value::String(s) => values.push((key, s.to_string_lossy().to_string())),
      Value::Table(items) => {
        for item in items.sequence_values::<String>() {
          let item = item.map_err(|_| HostError::api("data values must be strings or arrays of strings"))?;
          values.push((key.clone(), item));
        }
      }
      _ => return Err(HostError::api("data values must be strings or arrays of strings")),
    }
  }
  values.sort();
  Ok(values)
}

fn parse_args(mut args: Variadic<Value>) -> Result<WebCall, HostError> {
  if args.len() < 2 {
    return Err(HostError::api("need at least a url and a callback"));
  }
  let url = match args.remove(0) {
    Value::String(s) if !s.as_bytes().is_empty() => s.to_string_lossy().to_string(),
    _ => return Err(HostError::api("first argument must be the url")),
  };
  let url = Url::parse(&url).map_err(|e| HostError::api(format!("invalid url: {e}")))?;

  let data = match args.first() {
    Some(Value::Table(_)) => match args.remove(0) {
      Value::Table(t) => form_values(t)?,
      _ => Vec::new(),
    },
    _ => Vec::new(),
  };

  let mut callbacks = args.drain(..);
  let on_success = match callbacks.next() {
    Some(Value::Function(f)) => f,
    _ => return Err(HostError::api("on_success must be a function")),
  };
  let on_error = match callbacks.next() {
    Some(Value::Function(f)) => f,
    _ => return Err(HostError::api("on_error must be a function")),
  };

  Ok(WebCall {
    url,
    data,
    on_success,
    on_error,
  })
}

async fn perform(client: &Client, method: Method, call_url: Url, data: &[(String, String)]) -> Result<(String, u16), reqwest::Error> {
  let mut request = client.request(method.clone(), call_url);
  if !data.is_empty() {
    request = if method == Method::GET {
      request.query(data)
    } else {
      request.form(data)
    };
  }
  let response = request.send().await?;
  let status = response.status().as_u16();
  let body = response.text().await?;
  Ok((body, status))
}

impl Capability for WebCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let web = lua.create_table()?;

    for (name, method) in [("get", Method::GET), ("post", Method::POST)] {
      let (client, info) = (self.client.clone(), run.clone());
      let f = lua.create_function(move |_, args: Variadic<Value>| {
        let call = parse_args(args)?;
        debug!(run_id = %info.run_id, url = %call.url, method = %method, "web_call");
        match info.block_on(perform(&client, method.clone(), call.url, &call.data)) {
          Ok((body, status)) => call.on_success.call::<()>((body, status)),
          Err(e) => {
            warn!(run_id = %info.run_id, error = %e, "web_call_failed");
            call.on_error.call::<()>(e.to_string())
          }
        }
      })?;
      web.set(name, f)?;
    }

    sandbox.set_global(NAME, web)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use nexus_host::testing::{TestRun, runnable};
  use wiremock::matchers::{body_string, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn exec(source: String) -> Result<String, nexus_host::ScriptError> {
    let run = TestRun::new(runnable(1, &source));
    let sandbox = Sandbox::new().unwrap();
    WebCapability::default().bind(&sandbox, &run.info).unwrap();
    sandbox.exec_blocking("test".to_string(), source).await
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_get_with_query_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/search"))
      .and(query_param("q", "rust"))
      .respond_with(ResponseTemplate::new(200).set_body_string("found"))
      .mount(&server)
      .await;

    let source = format!(
      r#"
      local out
      web.get('{}/search', {{q = 'rust'}}, function(body, status) out = body .. status end, function(e) out = e end)
      return out
      "#,
      server.uri()
    );
    assert_eq!(exec(source).await.unwrap(), "found200");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_post_form_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/submit"))
      .and(body_string("a=1&b=x&b=y"))
      .respond_with(ResponseTemplate::new(201))
      .mount(&server)
      .await;

    let source = format!(
      r#"
      local out
      web.post('{}/submit', {{a = '1', b = {{'x', 'y'}}}}, function(body, status) out = status end, function(e) out = e end)
      return out
      "#,
      server.uri()
    );
    assert_eq!(exec(source).await.unwrap(), "201");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_transport_error_calls_on_error() {
    let source = r#"
      local out
      web.get('http://127.0.0.1:1/', function() out = 'ok' end, function(e) out = 'error' end)
      return out
    "#;
    assert_eq!(exec(source.to_string()).await.unwrap(), "error");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_missing_callback_raises_api_error() {
    let err = exec("web.get('http://localhost/', function() end)".to_string())
      .await
      .unwrap_err();
    assert!(err.to_string().contains("api-error: on_error must be a function"), "{err}");
  }
}
