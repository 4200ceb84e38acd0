//! Server-sent event framing and decoding for the runtime's `/event` stream.

use serde_json::Value;

/// Incremental SSE parser. Chunks may split lines or events anywhere; each
/// completed event yields its `data:` lines joined by `\n`.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }

        events
    }
}

/// Decodes a byte stream into text without splitting multibyte characters.
/// An incomplete trailing sequence is held until the next chunk; invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        text
    }
}

/// A runtime event reduced to the kinds the bridge reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    MessageUpdated {
        message_id: String,
        role: String,
        completed: bool,
        tokens: Option<Value>,
        cost: Option<f64>,
    },
    PartDelta {
        message_id: Option<String>,
        part_id: String,
        delta: String,
    },
    PartUpdated {
        message_id: Option<String>,
        part_id: String,
        part_type: String,
        text: Option<String>,
        delta: Option<String>,
    },
    Idle,
    Other(String),
}

/// Session id embedded in a runtime event, wherever this event kind keeps it.
pub fn extract_session_id(payload: &Value) -> Option<String> {
    for key in ["session_id", "sessionID", "sessionId"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    [
        &["properties", "sessionID"][..],
        &["properties", "info", "sessionID"],
        &["properties", "part", "sessionID"],
        &["properties", "session", "id"],
    ]
    .iter()
    .find_map(|path| extract_nested_string(payload, path))
}

fn extract_nested_string(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().map(str::to_string)
}

pub fn decode_event(payload: &Value) -> RuntimeEvent {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");
    let properties = payload.get("properties").unwrap_or(&Value::Null);

    match kind {
        "message.updated" => {
            let info = properties.get("info").unwrap_or(&Value::Null);
            let Some(message_id) = info.get("id").and_then(Value::as_str) else {
                return RuntimeEvent::Other(kind.to_string());
            };
            RuntimeEvent::MessageUpdated {
                message_id: message_id.to_string(),
                role: info
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                completed: info
                    .get("time")
                    .and_then(|time| time.get("completed"))
                    .is_some_and(|completed| !completed.is_null()),
                tokens: info.get("tokens").cloned(),
                cost: info.get("cost").and_then(Value::as_f64),
            }
        }
        "message.part.delta" => {
            let (Some(part_id), Some(delta)) = (
                properties.get("partID").and_then(Value::as_str),
                properties.get("delta").and_then(Value::as_str),
            ) else {
                return RuntimeEvent::Other(kind.to_string());
            };
            RuntimeEvent::PartDelta {
                message_id: extract_nested_string(properties, &["messageID"]),
                part_id: part_id.to_string(),
                delta: delta.to_string(),
            }
        }
        "message.part.updated" => {
            let part = properties.get("part").unwrap_or(&Value::Null);
            let Some(part_id) = part.get("id").and_then(Value::as_str) else {
                return RuntimeEvent::Other(kind.to_string());
            };
            RuntimeEvent::PartUpdated {
                message_id: extract_nested_string(part, &["messageID"]),
                part_id: part_id.to_string(),
                part_type: part
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("text")
                    .to_string(),
                text: extract_nested_string(part, &["text"]),
                delta: extract_nested_string(properties, &["delta"]),
            }
        }
        "session.status" => {
            let idle = properties
                .get("status")
                .and_then(|status| status.get("type"))
                .and_then(Value::as_str)
                == Some("idle");
            if idle {
                RuntimeEvent::Idle
            } else {
                RuntimeEvent::Other(kind.to_string())
            }
        }
        "session.idle" => RuntimeEvent::Idle,
        other => RuntimeEvent::Other(other.to_string()),
    }
}
