//! Time capability.
//!
//! Lua has no time type, so timestamps are unix seconds. `t` provides `now()`,
//! `unix(secs)`, `nano(nanos)`, `addDate(ts, years, months, days)` with
//! calendar arithmetic, `addTime(ts, hours, minutes, seconds)` and
//! `format(ts, pattern)` using strftime patterns in UTC.

use std::fmt::Write;

use chrono::{DateTime, Duration, Months, Utc};
use nexus_host::{Capability, CapabilityError, HostError, RunInfo, Sandbox};

pub const NAME: &str = "t";

#[derive(Debug, Default, Clone, Copy)]
pub struct TimeCapability;

fn from_unix(ts: i64) -> Result<DateTime<Utc>, HostError> {
  DateTime::from_timestamp(ts, 0).ok_or_else(|| HostError::api(format!("timestamp {ts} out of range")))
}

/// Calendar addition: months first (clamping the day), then days.
pub fn add_date(ts: i64, years: i64, months: i64, days: i64) -> Result<i64, HostError> {
  let start = from_unix(ts)?;
  let total_months = years
    .checked_mul(12)
    .and_then(|m| m.checked_add(months))
    .ok_or_else(|| HostError::api("month offset overflow"))?;
  let magnitude = Months::new(
    u32::try_from(total_months.unsigned_abs()).map_err(|_| HostError::api("month offset overflow"))?,
  );
  let shifted = if total_months >= 0 {
    start.checked_add_months(magnitude)
  } else {
    start.checked_sub_months(magnitude)
  };
  let result = shifted
    .and_then(|dt| dt.checked_add_signed(Duration::try_days(days)?))
    .ok_or_else(|| HostError::api("date out of range"))?;
  Ok(result.timestamp())
}

pub fn add_time(ts: i64, hours: i64, minutes: i64, seconds: i64) -> Result<i64, HostError> {
  hours
    .checked_mul(3600)
    .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
    .and_then(|offset| offset.checked_add(seconds))
    .and_then(|offset| ts.checked_add(offset))
    .ok_or_else(|| HostError::api("time offset overflow"))
}

pub fn format(ts: i64, pattern: &str) -> Result<String, HostError> {
  let dt = from_unix(ts)?;
  let mut out = String::new();
  write!(out, "{}", dt.format(pattern)).map_err(|_| HostError::api(format!("invalid time format: {pattern}")))?;
  Ok(out)
}

impl Capability for TimeCapability {
  fn name(&self) -> &str {
    NAME
  }

  fn bind(&self, sandbox: &Sandbox, _run: &RunInfo) -> Result<(), CapabilityError> {
    let lua = sandbox.lua();
    let t = lua.create_table()?;

    t.set("now", lua.create_function(|_, ()| Ok(Utc::now().timestamp()))?)?;
    t.set(
      "unix",
      lua.create_function(|_, secs: i64| Ok(from_unix(secs)?.timestamp()))?,
    )?;
    t.set(
      "nano",
      lua.create_function(|_, nanos: i64| Ok(nanos.div_euclid(1_000_000_000)))?,
    )?;
    t.set(
      "addDate",
      lua.create_function(|_, (ts, years, months, days): (i64, Option<i64>, Option<i64>, Option<i64>)| {
        Ok(add_date(ts, years.unwrap_or(0), months.unwrap_or(0), days.unwrap_or(0))?)
      })?,
    )?;
    t.set(
      "addTime",
      lua.create_function(|_, (ts, hours, minutes, seconds): (i64, Option<i64>, Option<i64>, Option<i64>)| {
        Ok(add_time(ts, hours.unwrap_or(0), minutes.unwrap_or(0), seconds.unwrap_or(0))?)
      })?,
    )?;
    t.set(
      "format",
      lua.create_function(|_, (ts, pattern): (i64, Option<String>)| {
        Ok(format(ts, pattern.as_deref().unwrap_or("%Y-%m-%dT%H:%M:%SZ"))?)
      })?,
    )?;

    sandbox.set_global(NAME, t)
  }
}
