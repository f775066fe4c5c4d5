//! Normalization of status query responses.
//!
//! Servers in the wild answer status queries in two shapes. The modern shape
//! nests counts under `players` and carries a `description` chat component;
//! the legacy shape uses flat `playerCount`/`maxPlayers`/`motd` fields. No
//! single field reliably tells them apart, so a response counts as modern if
//! any one of three signals is present.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ProbeError;

/// Normalized answer of a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    /// Participants currently online.
    pub online: u32,
    /// Participant capacity.
    pub max: u32,
    /// Message of the day, flattened to plain text.
    pub motd: String,
    /// Server version name.
    pub version: String,
    /// Round trip of the ping exchange; zero when the server does not answer pings.
    pub latency: Duration,
    /// Whether the response used the modern shape.
    pub modern: bool,
}

impl PingResult {
    /// A server that reports no capacity is treated as offline.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.max > 0
    }

    /// Human-readable one-line summary.
    #[must_use]
    pub fn status_line(&self) -> String {
        let state = if self.is_online() { "Online" } else { "Offline" };
        let mut line = format!(
            "{state} | {}/{} players | {} ms",
            self.online,
            self.max,
            self.latency.as_millis()
        );
        if !self.version.is_empty() {
            line.push_str(&format!(" | {}", self.version));
        }
        if !self.motd.is_empty() {
            line.push_str(&format!(" | {}", self.motd));
        }
        line
    }
}

/// Whether a raw status object uses the modern shape.
#[must_use]
pub fn is_modern(raw: &Value) -> bool {
    raw.get("latency").is_some_and(Value::is_number)
        || raw.get("enforcesSecureChat").is_some_and(Value::is_boolean)
        || raw.get("favicon").is_some_and(Value::is_string)
}

/// Normalize a raw status object of either shape.
///
/// # Errors
///
/// Returns [`ProbeError::InvalidResponse`] if the object carries no
/// participant count in the shape it was detected as.
pub fn normalize(raw: &Value) -> Result<PingResult, ProbeError> {
    if is_modern(raw) {
        let players = raw.get("players");
        let online = players
            .and_then(|p| p.get("online"))
            .and_then(as_count)
            .ok_or_else(|| ProbeError::InvalidResponse("missing players.online".to_string()))?;
        let max = players.and_then(|p| p.get("max")).and_then(as_count).unwrap_or(0);
        let version = raw
            .get("version")
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(PingResult {
            online,
            max,
            motd: raw.get("description").map(flatten_chat).unwrap_or_default(),
            version,
            latency: latency_of(raw),
            modern: true,
        })
    } else {
        let online = raw
            .get("playerCount")
            .and_then(as_count)
            .ok_or_else(|| ProbeError::InvalidResponse("missing playerCount".to_string()))?;
        let version = match raw.get("version") {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None => String::new(),
        };
        Ok(PingResult {
            online,
            max: raw.get("maxPlayers").and_then(as_count).unwrap_or(0),
            motd: raw.get("motd").map(flatten_chat).unwrap_or_default(),
            version,
            latency: Duration::ZERO,
            modern: false,
        })
    }
}

fn as_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn latency_of(raw: &Value) -> Duration {
    raw.get("latency")
        .and_then(Value::as_f64)
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map_or(Duration::ZERO, |ms| Duration::from_millis(ms as u64))
}

/// Flatten a chat component (string, object with `text`/`extra`, or array) to plain text.
#[must_use]
pub fn flatten_chat(component: &Value) -> String {
    let mut out = String::new();
    flatten_into(component, &mut out);
    out
}

fn flatten_into(component: &Value, out: &mut String) {
    match component {
        Value::String(s) => out.push_str(s),
        Value::Array(parts) => parts.iter().for_each(|p| flatten_into(p, out)),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                out.push_str(text);
            } else if let Some(Value::String(key)) = map.get("translate") {
                out.push_str(key);
                if let Some(Value::Array(with)) = map.get("with") {
                    for arg in with {
                        out.push(' ');
                        flatten_into(arg, out);
                    }
                }
            }
            if let Some(extra) = map.get("extra") {
                flatten_into(extra, out);
            }
        }
        _ => {}
    }
}

/// Convert a legacy kick-packet payload into the legacy object shape.
///
/// Handles both the `§1\0proto\0version\0motd\0online\0max` layout and the
/// older `motd§online§max` one.
///
/// # Errors
///
/// Returns [`ProbeError::InvalidResponse`] if neither layout matches.
pub fn parse_legacy(payload: &str) -> Result<Value, ProbeError> {
    if let Some(rest) = payload.strip_prefix("\u{a7}1\0") {
        let fields: Vec<&str> = rest.split('\0').collect();
        if let [_protocol, version, motd, online, max] = fields[..] {
            return Ok(json!({
                "playerCount": online,
                "maxPlayers": max,
                "motd": motd,
                "version": version,
            }));
        }
    } else {
        let fields: Vec<&str> = payload.rsplitn(3, '\u{a7}').collect();
        if let [max, online, motd] = fields[..] {
            return Ok(json!({
                "playerCount": online,
                "maxPlayers": max,
                "motd": motd,
            }));
        }
    }
    Err(ProbeError::InvalidResponse(format!(
        "unrecognized legacy payload: {payload:?}"
    )))
}
