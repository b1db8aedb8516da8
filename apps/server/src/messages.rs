//! Downstream WebSocket message types.

use serde::{Deserialize, Serialize};
use ticker_core::{Pair, TickerData};

/// Request sent by a downstream client.
///
/// `{"type": "subscribe", "pair": {"fsym": "BTC", "tsym": "USD"}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub pair: Option<Pair>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Data,
    Message,
    Error,
}

/// Frame sent to a downstream client. Absent fields are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<Pair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TickerData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl ServerMessage {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            pair: None,
            data: None,
            message: None,
            reason: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn data(data: TickerData) -> Self {
        Self {
            pair: Some(data.pair()),
            data: Some(data),
            ..Self::new(MessageKind::Data)
        }
    }

    pub fn message(pair: Option<Pair>, text: impl Into<String>) -> Self {
        Self {
            pair,
            message: Some(text.into()),
            ..Self::new(MessageKind::Message)
        }
    }

    pub fn error(pair: Option<Pair>, text: impl Into<String>) -> Self {
        Self {
            pair,
            message: Some(text.into()),
            ..Self::new(MessageKind::Error)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_client_request() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"type":"subscribe","pair":{"fsym":"eth","tsym":"usdt"}}"#).unwrap();
        assert_eq!(req.kind, "subscribe");
        assert_eq!(req.pair.map(|p| p.normalized().key()), Some("ETH:USDT".to_string()));

        let req: ClientRequest = serde_json::from_str(r#"{"type":"close","reason":"bye"}"#).unwrap();
        assert!(req.pair.is_none());
        assert_eq!(req.reason.as_deref(), Some("bye"));
    }

    #[test]
    fn test_message_omits_absent_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&ServerMessage::message(None, "pong").to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"], "pong");
        assert!(json.get("pair").is_none());
        assert!(json.get("data").is_none());
        assert!(json.get("reason").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_data_message_carries_pair() {
        let msg = ServerMessage::data(TickerData::new("btc", "usd"));
        let json: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["pair"]["fsym"], "BTC");
        assert_eq!(json["data"]["to_sym"], "USD");
    }

    #[test]
    fn test_error_with_reason() {
        let msg = ServerMessage::error(None, "failed to get price").with_reason("upstream");
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.reason.as_deref(), Some("upstream"));
    }
}
