//! Wire messages exchanged with the main application.
//!
//! Worker messages use a `type` discriminator:
//!
//! ```text
//! page  -> worker  {"type":"SKIP_WAITING"}
//! worker -> page   {"type":"SW_ACTIVATED","cache":"appshell_cache_v3"}
//! ```
//!
//! Timer messages use `cmd` inbound and `type` outbound:
//!
//! ```text
//! {"cmd":"start","token":7,"mode":"countdown","plannedSec":300}
//! {"cmd":"stop","token":7}
//! {"type":"progress","token":7,"elapsedSec":1.2}
//! {"type":"complete","token":7}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sent by a page to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// The user approved the update; promote the waiting version.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl WorkerMessage {
    /// Parses a message, returning `None` for anything unrecognised.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Message broadcast by the worker to every open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Activation finished; `cache` names the live generation.
    #[serde(rename = "SW_ACTIVATED")]
    Activated {
        /// Active cache name.
        cache: String,
    },
}

/// Timer counting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
    /// Counts up to the planned duration, then completes.
    #[default]
    Countdown,
    /// Counts up until stopped; the planned duration is ignored.
    Stopwatch,
}

/// Command sent to the timer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum TimerCommand {
    /// Start a new session, replacing any running one.
    Start {
        /// Session token echoed on every event.
        token: i64,
        /// Counting mode.
        mode: TimerMode,
        /// Planned duration in seconds, never negative.
        #[serde(rename = "plannedSec")]
        planned_sec: f64,
    },
    /// Stop the session with this token. `None` stops whatever is running.
    Stop {
        /// Token of the session to stop.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<i64>,
    },
}

impl TimerCommand {
    /// Parses a command from JSON text. Malformed input yields `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        Self::from_value(&value)
    }

    /// Interprets a JSON value as a command.
    ///
    /// Missing or non-numeric tokens count as 0 on `start`, unknown modes
    /// fall back to countdown, and missing, negative or non-finite planned
    /// durations become 0. A `stop` whose token is absent or `null`
    /// targets any session.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("cmd")?.as_str()? {
            "start" => {
                let token = obj.get("token").and_then(as_token).unwrap_or(0);
                let mode = match obj.get("mode").and_then(Value::as_str) {
                    Some("stopwatch") => TimerMode::Stopwatch,
                    _ => TimerMode::Countdown,
                };
                let planned_sec = obj
                    .get("plannedSec")
                    .and_then(as_number)
                    .filter(|n| n.is_finite())
                    .map_or(0.0, |n| n.max(0.0));
                Some(Self::Start {
                    token,
                    mode,
                    planned_sec,
                })
            }
            "stop" => {
                let token = match obj.get("token") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(as_token(v)?),
                };
                Some(Self::Stop { token })
            }
            _ => None,
        }
    }
}

/// Numeric value of a JSON number or numeric string.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn as_token(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    as_number(value)
        .filter(|n| n.is_finite())
        .map(|n| n.trunc() as i64)
}

/// Event emitted by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TimerEvent {
    /// Elapsed time for the running session.
    Progress {
        /// Session token.
        token: i64,
        /// Seconds since the session started.
        #[serde(rename = "elapsedSec")]
        elapsed_sec: f64,
    },
    /// Countdown reached its planned duration. Sent once, then the session ends.
    Complete {
        /// Session token.
        token: i64,
    },
}

impl TimerEvent {
    /// Token carried by this event.
    #[must_use]
    pub const fn token(&self) -> i64 {
        match self {
            Self::Progress { token, .. } | Self::Complete { token } => *token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skip_waiting_parses() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"SKIP_WAITING"}"#),
            Some(WorkerMessage::SkipWaiting)
        );
        assert_eq!(WorkerMessage::parse(r#"{"type":"OTHER"}"#), None);
        assert_eq!(WorkerMessage::parse("null"), None);
        assert_eq!(WorkerMessage::parse("garbage"), None);
    }

    #[test]
    fn activated_wire_format() {
        let msg = ClientMessage::Activated {
            cache: "appshell_cache_v3".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "SW_ACTIVATED", "cache": "appshell_cache_v3"})
        );
    }

    #[test]
    fn start_command_parses() {
        let cmd = TimerCommand::parse(
            r#"{"cmd":"start","token":7,"mode":"stopwatch","plannedSec":12.5}"#,
        );
        assert_eq!(
            cmd,
            Some(TimerCommand::Start {
                token: 7,
                mode: TimerMode::Stopwatch,
                planned_sec: 12.5,
            })
        );
    }

    #[test]
    fn start_command_tolerates_loose_fields() {
        let cmd = TimerCommand::from_value(&json!({"cmd": "start", "mode": "weird", "plannedSec": -3}));
        assert_eq!(
            cmd,
            Some(TimerCommand::Start {
                token: 0,
                mode: TimerMode::Countdown,
                planned_sec: 0.0,
            })
        );

        let cmd = TimerCommand::from_value(&json!({"cmd": "start", "token": "42", "plannedSec": "5"}));
        assert_eq!(
            cmd,
            Some(TimerCommand::Start {
                token: 42,
                mode: TimerMode::Countdown,
                planned_sec: 5.0,
            })
        );
    }

    #[test]
    fn stop_command_token_optional() {
        assert_eq!(
            TimerCommand::parse(r#"{"cmd":"stop","token":3}"#),
            Some(TimerCommand::Stop { token: Some(3) })
        );
        assert_eq!(
            TimerCommand::parse(r#"{"cmd":"stop"}"#),
            Some(TimerCommand::Stop { token: None })
        );
        assert_eq!(
            TimerCommand::parse(r#"{"cmd":"stop","token":null}"#),
            Some(TimerCommand::Stop { token: None })
        );
        assert_eq!(TimerCommand::parse(r#"{"cmd":"stop","token":"abc"}"#), None);
    }

    #[test]
    fn malformed_commands_ignored() {
        assert_eq!(TimerCommand::parse("[]"), None);
        assert_eq!(TimerCommand::parse(r#"{"cmd":"pause"}"#), None);
        assert_eq!(TimerCommand::parse(r#"{"token":1}"#), None);
        assert_eq!(TimerCommand::parse("not json"), None);
    }

    #[test]
    fn timer_event_wire_format() {
        let progress = TimerEvent::Progress {
            token: 4,
            elapsed_sec: 1.5,
        };
        assert_eq!(
            serde_json::to_value(progress).unwrap(),
            json!({"type": "progress", "token": 4, "elapsedSec": 1.5})
        );
        assert_eq!(
            serde_json::to_value(TimerEvent::Complete { token: 4 }).unwrap(),
            json!({"type": "complete", "token": 4})
        );
        assert_eq!(progress.token(), 4);
    }

    #[test]
    fn start_command_serializes_like_page() {
        let cmd = TimerCommand::Start {
            token: 1,
            mode: TimerMode::Countdown,
            planned_sec: 5.0,
        };
        assert_eq!(
            serde_json::to_value(cmd).unwrap(),
            json!({"cmd": "start", "token": 1, "mode": "countdown", "plannedSec": 5.0})
        );
    }
}
