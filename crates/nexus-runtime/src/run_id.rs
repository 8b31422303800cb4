use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::SchedulerError;

const RUN_ID_BYTES: usize = 8;

/// Generate a run id: 8 random bytes, base64 URL-safe encoded (12 characters).
pub fn generate_run_id() -> Result<String, SchedulerError> {
  let mut bytes = [0u8; RUN_ID_BYTES];
  OsRng
    .try_fill_bytes(&mut bytes)
    .map_err(|e| SchedulerError::RunId { message: e.to_string() })?;
  Ok(URL_SAFE.encode(bytes))
}
