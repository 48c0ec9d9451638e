// Copyright 2025 Chisomo Makombo Sakala
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Time parsing helpers for the `status --since` window.

use chrono::DateTime;
use chrono::Duration;
use chrono::Local;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::TimeZone;

use crate::error::ValidationError;

/// Parses a `--since` value into a local timestamp.
///
/// Accepted formats:
/// * Relative — `"30m"`, `"2h"`, `"1d"`, `"90s"` (digits followed by one
///   of `s/m/h/d`), interpreted as "that long before now".
/// * Absolute — an ISO-like timestamp such as `"2026-02-23T18:00:00"`,
///   `"2026-02-23 18:00"`, or a bare date `"2026-02-23"` (midnight).
pub fn parse_since(value: &str) -> Result<DateTime<Local>, ValidationError> {
  let value = value.trim();

  if let Some(delta) = parse_relative(value) {
    return Ok(Local::now() - delta);
  }

  if let Some(dt) = parse_absolute(value) {
    return Ok(dt);
  }

  Err(ValidationError::BadSince(value.to_string()))
}

fn parse_relative(value: &str) -> Option<Duration> {
  let (digits, unit) = value.split_at(value.len().checked_sub(1)?);
  if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let amount: i64 = digits.parse().ok()?;

  match unit {
    "s" => Some(Duration::seconds(amount)),
    "m" => Some(Duration::minutes(amount)),
    "h" => Some(Duration::hours(amount)),
    "d" => Some(Duration::days(amount)),
    _ => None,
  }
}

fn parse_absolute(value: &str) -> Option<DateTime<Local>> {
  const FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
  ];

  for fmt in FORMATS {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
      return Local.from_local_datetime(&naive).single();
    }
  }

  // Bare date means midnight that day.
  if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
    let naive = date.and_hms_opt(0, 0, 0)?;
    return Local.from_local_datetime(&naive).single();
  }

  None
}
