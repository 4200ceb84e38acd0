//! WebSocket frames exchanged with agent clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from the server to every socket attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { agent_id: String },
    #[serde(rename = "message.start", rename_all = "camelCase")]
    MessageStart { message_id: String },
    #[serde(rename = "delta", rename_all = "camelCase")]
    Delta { part_id: String, delta: String },
    #[serde(rename = "part.updated", rename_all = "camelCase")]
    PartUpdated {
        part_id: String,
        part_type: String,
        text: String,
    },
    #[serde(rename = "message.complete", rename_all = "camelCase")]
    MessageComplete {
        message_id: String,
        tokens: Option<Value>,
        cost: Option<f64>,
    },
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Message { text: String },
    Cancel,
}

/// Parses a text frame from a client. The error string is sent back to that
/// client verbatim.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {e}"))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "Missing message type".to_string())?;

    match kind {
        "message" => {
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| "Message text is required".to_string())?;
            Ok(ClientFrame::Message {
                text: text.to_string(),
            })
        }
        "cancel" => Ok(ClientFrame::Cancel),
        other => Err(format!("Unknown message type: {other}")),
    }
}
