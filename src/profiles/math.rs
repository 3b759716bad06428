use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Profile, ProfileError, ToolSpec};

/// Numeric utilities: statistics, percentages, base conversion.
pub struct MathProfile;

#[async_trait]
impl Profile for MathProfile {
    fn id(&self) -> &str {
        "math"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "statistics".to_string(),
                description:
                    "Calculate statistics for a set of numbers (mean, median, std dev, min, max, sum)"
                        .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "numbers": {
                            "type": "string",
                            "description": "Comma-separated list of numbers",
                        },
                    },
                    "required": ["numbers"],
                }),
            },
            ToolSpec {
                name: "percentage".to_string(),
                description:
                    "Calculate percentages: 'what is X% of Y', 'X is what % of Y', 'change from X to Y'"
                        .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "operation": {
                            "type": "string",
                            "description": "Operation: 'of' (X% of Y), 'is' (X is what % of Y), 'change' (% change from X to Y)",
                        },
                        "x": { "type": "number", "description": "First value" },
                        "y": { "type": "number", "description": "Second value" },
                    },
                    "required": ["operation", "x", "y"],
                }),
            },
            ToolSpec {
                name: "number_base".to_string(),
                description: "Convert numbers between bases (binary, octal, decimal, hex)"
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "number": {
                            "type": "string",
                            "description": "Number to convert (prefix with 0b, 0o, 0x for non-decimal)",
                        },
                        "to_base": {
                            "type": "integer",
                            "description": "Target base (2, 8, 10, 16). Default shows all",
                        },
                    },
                    "required": ["number"],
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
            "statistics" => statistics(arguments),
            "percentage" => percentage(arguments),
            "number_base" => number_base(arguments),
            other => Err(ProfileError::UnknownTool(other.to_string())),
        }
    }
}

fn statistics(arguments: &Value) -> Result<String, ProfileError> {
    let raw = arguments
        .get("numbers")
        .and_then(Value::as_str)
        .ok_or_else(|| ProfileError::InvalidArguments("numbers is required".to_string()))?;

    let mut numbers = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let value: f64 = part
            .parse()
            .map_err(|_| ProfileError::InvalidArguments(format!("not a number: {part}")))?;
        numbers.push(value);
    }
    if numbers.is_empty() {
        return Err(ProfileError::InvalidArguments(
            "no numbers provided".to_string(),
        ));
    }

    let count = numbers.len();
    let sum: f64 = numbers.iter().sum();
    let mean = sum / count as f64;
    let variance = numbers
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / count as f64;

    let mut sorted = numbers.clone();
    sorted.sort_by(f64::total_cmp);
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };

    Ok(format!(
        "count: {count}\nsum: {}\nmean: {}\nmedian: {}\nstd_dev: {}\nmin: {}\nmax: {}",
        fmt(sum),
        fmt(mean),
        fmt(median),
        fmt(variance.sqrt()),
        fmt(sorted[0]),
        fmt(sorted[count - 1]),
    ))
}

fn percentage(arguments: &Value) -> Result<String, ProfileError> {
    let operation = arguments
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| ProfileError::InvalidArguments("operation is required".to_string()))?;
    let x = number_argument(arguments, "x")?;
    let y = number_argument(arguments, "y")?;

    match operation {
        "of" => Ok(format!("{}% of {} = {}", fmt(x), fmt(y), fmt(x / 100.0 * y))),
        "is" => {
            if y == 0.0 {
                return Err(ProfileError::InvalidArguments(
                    "cannot divide by zero".to_string(),
                ));
            }
            Ok(format!("{} is {}% of {}", fmt(x), fmt(x / y * 100.0), fmt(y)))
        }
        "change" => {
            if x == 0.0 {
                return Err(ProfileError::InvalidArguments(
                    "cannot compute change from zero".to_string(),
                ));
            }
            Ok(format!(
                "change from {} to {} = {}%",
                fmt(x),
                fmt(y),
                fmt((y - x) / x * 100.0)
            ))
        }
        other => Err(ProfileError::InvalidArguments(format!(
            "unknown operation: {other}"
        ))),
    }
}

fn number_base(arguments: &Value) -> Result<String, ProfileError> {
    let raw = arguments
        .get("number")
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| ProfileError::InvalidArguments("number is required".to_string()))?;

    let (digits, base) = if let Some(rest) = raw.strip_prefix("0b") {
        (rest, 2)
    } else if let Some(rest) = raw.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = raw.strip_prefix("0x") {
        (rest, 16)
    } else {
        (raw, 10)
    };
    let value = i64::from_str_radix(digits, base)
        .map_err(|_| ProfileError::InvalidArguments(format!("not a base-{base} number: {raw}")))?;

    match arguments.get("to_base").and_then(Value::as_u64) {
        Some(2) => Ok(format!("{value:#b}")),
        Some(8) => Ok(format!("{value:#o}")),
        Some(10) => Ok(format!("{value}")),
        Some(16) => Ok(format!("{value:#x}")),
        Some(other) => Err(ProfileError::InvalidArguments(format!(
            "unsupported base: {other}"
        ))),
        None => Ok(format!(
            "decimal: {value}\nbinary: {value:#b}\noctal: {value:#o}\nhex: {value:#x}"
        )),
    }
}

fn number_argument(arguments: &Value, key: &str) -> Result<f64, ProfileError> {
    arguments
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProfileError::InvalidArguments(format!("{key} must be a number")))
}

fn fmt(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.4}")
    }
}
