// Timezone resolution — converts wall-clock UTC to a user's local time.
//
// Zones are stored as fixed-offset strings ("UTC+03:00", "UTC-5", "+0530",
// "UTC"). Slot matching compares the formatted local HH:MM against the
// configured slot to the minute.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::error::{DripError, Result};

/// Parse a fixed-offset timezone string into a `FixedOffset`.
///
/// Accepted forms: `UTC`, `UTC+3`, `UTC-05`, `UTC+03:00`, `+03:00`, `-0530`.
pub fn parse_offset(timezone: &str) -> Result<FixedOffset> {
    let tz = timezone.trim();
    let rest = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("GMT"))
        .unwrap_or(tz);

    if rest.is_empty() {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| DripError::InvalidTimezone(timezone.to_string()));
    }

    let (sign, digits) = match rest.as_bytes()[0] {
        b'+' => (1i32, &rest[1..]),
        b'-' => (-1i32, &rest[1..]),
        _ => return Err(DripError::InvalidTimezone(timezone.to_string())),
    };

    let (hours_str, minutes_str) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() > 2 => digits.split_at(digits.len() - 2),
        None => (digits, "0"),
    };

    let hours: i32 = hours_str
        .parse()
        .map_err(|_| DripError::InvalidTimezone(timezone.to_string()))?;
    let minutes: i32 = minutes_str
        .parse()
        .map_err(|_| DripError::InvalidTimezone(timezone.to_string()))?;

    if hours > 14 || minutes > 59 {
        return Err(DripError::InvalidTimezone(timezone.to_string()));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| DripError::InvalidTimezone(timezone.to_string()))
}

/// The user's local time-of-day as `HH:MM`, for slot matching.
pub fn local_hhmm(timezone: &str, now: DateTime<Utc>) -> Result<String> {
    let offset = parse_offset(timezone)?;
    Ok(now.with_timezone(&offset).format("%H:%M").to_string())
}

/// The user's local calendar date.
pub fn local_date(timezone: &str, now: DateTime<Utc>) -> Result<NaiveDate> {
    let offset = parse_offset(timezone)?;
    Ok(now.with_timezone(&offset).date_naive())
}
