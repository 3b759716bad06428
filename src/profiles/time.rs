use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::{OffsetDateTime, UtcOffset};

use super::{Profile, ProfileError, ToolSpec};

/// Clock utilities: current time and datetime parsing.
pub struct TimeProfile;

#[async_trait]
impl Profile for TimeProfile {
    fn id(&self) -> &str {
        "time"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "get_current_time".to_string(),
                description: "Get the current time, optionally shifted to a UTC offset"
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "offset": {
                            "type": "string",
                            "description": "UTC offset such as +02:00 or -05:30. Defaults to UTC.",
                        },
                    },
                }),
            },
            ToolSpec {
                name: "parse_datetime".to_string(),
                description: "Parse a datetime string (RFC 3339 or RFC 2822) and return structured information"
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "datetime": {
                            "type": "string",
                            "description": "Datetime string to parse",
                        },
                    },
                    "required": ["datetime"],
                }),
            },
        ]
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        _env: &HashMap<String, String>,
    ) -> Result<String, ProfileError> {
        match name {
            "get_current_time" => {
                let now = OffsetDateTime::now_utc();
                let offset = match arguments.get("offset").and_then(Value::as_str) {
                    Some(raw) => parse_utc_offset(raw)?,
                    None => UtcOffset::UTC,
                };
                now.to_offset(offset)
                    .format(&Rfc3339)
                    .map_err(|err| ProfileError::Failed(format!("failed to format time: {err}")))
            }
            "parse_datetime" => {
                let raw = arguments
                    .get("datetime")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProfileError::InvalidArguments("datetime is required".to_string())
                    })?;
                let parsed = parse_datetime(raw)?;
                Ok(format!(
                    "unix: {}\nrfc3339: {}\nweekday: {}\nday_of_year: {}",
                    parsed.unix_timestamp(),
                    parsed
                        .format(&Rfc3339)
                        .unwrap_or_else(|_| raw.to_string()),
                    parsed.weekday(),
                    parsed.ordinal(),
                ))
            }
            other => Err(ProfileError::UnknownTool(other.to_string())),
        }
    }
}

fn parse_datetime(raw: &str) -> Result<OffsetDateTime, ProfileError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc2822))
        .map_err(|_| ProfileError::InvalidArguments(format!("unrecognized datetime: {raw}")))
}

fn parse_utc_offset(raw: &str) -> Result<UtcOffset, ProfileError> {
    let invalid = || ProfileError::InvalidArguments(format!("invalid UTC offset: {raw}"));

    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1i8, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1i8, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i8 = hours.parse().map_err(|_| invalid())?;
    let minutes: i8 = minutes.parse().map_err(|_| invalid())?;
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| invalid())
}
