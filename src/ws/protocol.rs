//! WebSocket Protocol - Messaggi JSON scambiati sui frame di testo
//!
//! I messaggi del client vengono decodificati una sola volta qui, al confine
//! del protocollo; il read loop lavora solo sul tipo `ClientMessage`.

use crate::core::error::ProtocolError;
use axum::extract::ws::Utf8Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

/// Messaggi di controllo inviati dal client
///
/// Serde deserializza questo come:
/// { "type": "ping" }
/// oppure
/// { "type": "subscribe", "metrics": ["cpu", "memory"] }
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        metrics: Vec<String>,
    },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) | None => return Err(ProtocolError::MissingType),
        };

        match kind.as_str() {
            "ping" | "subscribe" => {
                serde_json::from_value(value).map_err(|_| ProtocolError::InvalidMetrics)
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Messaggi inviati dal server oltre agli snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Pong,
    Error(String),
}

impl ServerMessage {
    pub fn encode(&self) -> Utf8Bytes {
        let value = match self {
            ServerMessage::Pong => json!({ "type": "pong" }),
            ServerMessage::Error(message) => json!({ "error": message }),
        };
        Utf8Bytes::from(value.to_string())
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(err: &ProtocolError) -> Self {
        ServerMessage::Error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ping() {
        assert_eq!(ClientMessage::decode(r#"{"type":"ping"}"#), Ok(ClientMessage::Ping));
    }

    #[test]
    fn test_decode_subscribe() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"subscribe","metrics":["cpu","memory"]}"#),
            Ok(ClientMessage::Subscribe {
                metrics: vec!["cpu".into(), "memory".into()]
            })
        );
        // senza lista = nessun filtro
        assert_eq!(
            ClientMessage::decode(r#"{"type":"subscribe"}"#),
            Ok(ClientMessage::Subscribe { metrics: vec![] })
        );
    }

    #[test]
    fn test_decode_errors() {
        let cases = [
            ("{ this is not valid json at all }", ProtocolError::InvalidJson),
            ("", ProtocolError::InvalidJson),
            ("[1, 2, 3]", ProtocolError::MissingType),
            ("42", ProtocolError::MissingType),
            (r#"{"metrics": ["cpu"]}"#, ProtocolError::MissingType),
            (r#"{"type": 7}"#, ProtocolError::MissingType),
            (r#"{"type":"subscribe","metrics":"cpu"}"#, ProtocolError::InvalidMetrics),
            (r#"{"type":"subscribe","metrics":[1,2]}"#, ProtocolError::InvalidMetrics),
            (r#"{"type":"dance"}"#, ProtocolError::UnknownType("dance".into())),
        ];
        for (input, expected) in cases {
            assert_eq!(ClientMessage::decode(input), Err(expected), "input: {}", input);
        }
    }

    #[test]
    fn test_encode_server_messages() {
        assert_eq!(ServerMessage::Pong.encode().as_str(), r#"{"type":"pong"}"#);
        let err = ServerMessage::from(&ProtocolError::InvalidJson).encode();
        let value: Value = serde_json::from_str(err.as_str()).unwrap();
        assert_eq!(value, json!({"error": "Invalid JSON format"}));
    }
}
