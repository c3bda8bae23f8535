//! The on-demand clone protocol as it appears on the wire: a structured
//! marker line emitted into the build log by the agent, and a status message
//! delivered back over the control channel by the server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message name inside the clone-request marker line.
pub const CLONE_REQUEST_MESSAGE: &str = "create-clone";

/// Control-channel method carrying a clone completion callback.
pub const CLONE_STATUS_METHOD: &str = "cloneStatus";

const MARKER_PREFIX: &str = "@@instaclone[";
const MARKER_SUFFIX: &str = "]";

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("clone name suffix must not contain quotes or newlines: {0:?}")]
    InvalidSuffix(String),
    #[error("malformed control payload: {0}")]
    BadPayload(String),
}

/// A build step's request for a new clone of the instance it runs on,
/// rendered as a single structured line in the build log.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneRequest {
    pub name_suffix: String,
    pub correlation_id: Uuid,
}

impl CloneRequest {
    pub fn new(name_suffix: impl Into<String>) -> Self {
        Self {
            name_suffix: name_suffix.into(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Renders the marker line. Fails if the suffix would break the
    /// single-quoted attribute framing.
    pub fn to_marker(&self) -> Result<String, ProtocolError> {
        if self.name_suffix.contains(['\'', '\n', '\r']) {
            return Err(ProtocolError::InvalidSuffix(self.name_suffix.clone()));
        }
        Ok(format!(
            "{MARKER_PREFIX}{CLONE_REQUEST_MESSAGE} nameSuffix='{}' correlationId='{}'{MARKER_SUFFIX}",
            self.name_suffix, self.correlation_id,
        ))
    }

    /// Recognizes a marker line inside arbitrary log output. Returns `None`
    /// for anything that is not a well-formed clone-request marker.
    pub fn parse_marker(line: &str) -> Option<Self> {
        let line = line.trim();
        let body = line
            .strip_prefix(MARKER_PREFIX)?
            .strip_suffix(MARKER_SUFFIX)?;
        let rest = body.strip_prefix(CLONE_REQUEST_MESSAGE)?;
        if !rest.starts_with(' ') {
            return None;
        }

        let name_suffix = attribute(rest, "nameSuffix")?;
        let correlation_id = Uuid::parse_str(&attribute(rest, "correlationId")?).ok()?;

        Some(Self {
            name_suffix,
            correlation_id,
        })
    }
}

fn attribute(body: &str, name: &str) -> Option<String> {
    let start = body.find(&format!("{name}='"))? + name.len() + 2;
    let end = body[start..].find('\'')? + start;
    Some(body[start..end].to_string())
}

/// Terminal outcome of a clone job, the only payload of the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneStatus {
    Ok,
    Fail,
}

impl CloneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneStatus::Ok => "OK",
            CloneStatus::Fail => "FAIL",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CloneStatus::Ok)
    }
}

impl fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(CloneStatus::Ok),
            "FAIL" => Ok(CloneStatus::Fail),
            other => Err(ProtocolError::BadPayload(other.to_string())),
        }
    }
}

/// Generic message envelope for the bidirectional agent/server control
/// channel: a method name, a correlation id and a typed JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub method: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

impl ControlMessage {
    pub fn clone_status(correlation_id: Uuid, status: CloneStatus) -> Self {
        Self {
            method: CLONE_STATUS_METHOD.to_string(),
            correlation_id,
            payload: serde_json::json!({ "status": status.as_str() }),
        }
    }

    /// Extracts the clone status from a [`CLONE_STATUS_METHOD`] envelope.
    pub fn parse_clone_status(&self) -> Result<CloneStatus, ProtocolError> {
        let raw = self
            .payload
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::BadPayload(self.payload.to_string()))?;
        raw.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        let request = CloneRequest::new("win10");
        let marker = request.to_marker().unwrap();
        assert!(marker.starts_with("@@instaclone[create-clone"));

        let parsed = CloneRequest::parse_marker(&marker).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn marker_with_empty_suffix() {
        let request = CloneRequest::new("");
        let parsed = CloneRequest::parse_marker(&request.to_marker().unwrap()).unwrap();
        assert_eq!(parsed.name_suffix, "");
        assert_eq!(parsed.correlation_id, request.correlation_id);
    }

    #[test]
    fn quoted_suffix_is_rejected() {
        let request = CloneRequest {
            name_suffix: "bad'one".to_string(),
            correlation_id: Uuid::new_v4(),
        };
        assert!(matches!(
            request.to_marker(),
            Err(ProtocolError::InvalidSuffix(_))
        ));
    }

    #[test]
    fn ordinary_log_lines_are_ignored() {
        assert_eq!(CloneRequest::parse_marker("building target release"), None);
        assert_eq!(
            CloneRequest::parse_marker("@@instaclone[other-message x='1']"),
            None
        );
        // missing correlation id
        assert_eq!(
            CloneRequest::parse_marker("@@instaclone[create-clone nameSuffix='a']"),
            None
        );
    }

    #[test]
    fn status_envelope_round_trips() {
        let id = Uuid::new_v4();
        let msg = ControlMessage::clone_status(id, CloneStatus::Fail);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.method, CLONE_STATUS_METHOD);
        assert_eq!(parsed.correlation_id, id);
        assert_eq!(parsed.parse_clone_status().unwrap(), CloneStatus::Fail);
    }
}
