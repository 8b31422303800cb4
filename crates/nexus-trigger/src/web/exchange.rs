use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;

pub const NOT_FOUND_BODY: &str = "Page not found";
pub const TIMEOUT_BODY: &str = "Timeout";
pub const INTERNAL_ERROR_BODY: &str = "Internal server error";

#[derive(Default)]
struct ResponseState {
  status: Option<StatusCode>,
  body: Vec<u8>,
  finalized: bool,
}

/// The response side of one inbound request, shared with the run serving it.
///
/// The script writes into a buffer and signals completion with `done()`. The
/// HTTP side waits for that signal for a bounded time. Once the response has
/// been produced, further writes are dropped.
#[derive(Clone, Default)]
pub struct HttpExchange {
  state: Arc<Mutex<ResponseState>>,
  done: CancellationToken,
}

impl HttpExchange {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append to the response body. Returns false once the response is gone.
  pub fn write(&self, data: &[u8]) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.finalized {
      return false;
    }
    state.body.extend_from_slice(data);
    true
  }

  /// Set the response status. The first call wins.
  pub fn write_header(&self, status: StatusCode) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.finalized || state.status.is_some() {
      return false;
    }
    state.status = Some(status);
    true
  }

  pub fn done(&self) {
    self.done.cancel();
  }

  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }

  /// Wait for `done()` and build the buffered response, or give up after
  /// `timeout` with a 502.
  pub async fn respond_within(&self, timeout: Duration) -> Response {
    tokio::select! {
      _ = self.done.cancelled() => self.finalize(),
      _ = tokio::time::sleep(timeout) => {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finalized = true;
        (StatusCode::BAD_GATEWAY, TIMEOUT_BODY).into_response()
      }
    }
  }

  fn finalize(&self) -> Response {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.finalized = true;
    let status = state.status.unwrap_or(StatusCode::OK);
    (status, std::mem::take(&mut state.body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::body::to_bytes;

  #[tokio::test]
  async fn test_buffered_response_is_released_on_done() {
    let exchange = HttpExchange::new();
    assert!(exchange.write_header(StatusCode::CREATED));
    assert!(!exchange.write_header(StatusCode::ACCEPTED));
    exchange.write(b"hello ");
    exchange.write(b"world");
    exchange.done();

    let response = exchange.respond_within(Duration::from_secs(5)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"hello world");
  }

  #[tokio::test]
  async fn test_timeout_yields_bad_gateway_and_drops_late_writes() {
    let exchange = HttpExchange::new();
    exchange.write(b"partial");

    let response = exchange.respond_within(Duration::from_millis(20)).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], TIMEOUT_BODY.as_bytes());

    assert!(!exchange.write(b"late"));
  }

  #[tokio::test]
  async fn test_status_defaults_to_ok() {
    let exchange = HttpExchange::new();
    exchange.done();
    let response = exchange.respond_within(Duration::from_secs(5)).await;
    assert_eq!(response.status(), StatusCode::OK);
  }
}
