use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const TOKEN_LENGTH: usize = 10;

/// Closed set of signals exchanged between two links, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalBody {
    Requesting,
    Acknowledging,
    Synchronized,
    Offer { content: String, counter: u64 },
    Answer { content: String, counter: u64 },
    IceCandidate { content: String, counter: u64 },
}

/// Handshake message kinds; they carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSignal {
    Requesting,
    Acknowledging,
    Synchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Offer,
    Answer,
    IceCandidate,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Offer => "offer",
            ContentKind::Answer => "answer",
            ContentKind::IceCandidate => "ice-candidate",
        }
    }
}

impl SignalBody {
    pub fn handshake(kind: HandshakeSignal) -> Self {
        match kind {
            HandshakeSignal::Requesting => SignalBody::Requesting,
            HandshakeSignal::Acknowledging => SignalBody::Acknowledging,
            HandshakeSignal::Synchronized => SignalBody::Synchronized,
        }
    }

    pub fn content(kind: ContentKind, content: String, counter: u64) -> Self {
        match kind {
            ContentKind::Offer => SignalBody::Offer { content, counter },
            ContentKind::Answer => SignalBody::Answer { content, counter },
            ContentKind::IceCandidate => SignalBody::IceCandidate { content, counter },
        }
    }

    pub fn as_handshake(&self) -> Option<HandshakeSignal> {
        match self {
            SignalBody::Requesting => Some(HandshakeSignal::Requesting),
            SignalBody::Acknowledging => Some(HandshakeSignal::Acknowledging),
            SignalBody::Synchronized => Some(HandshakeSignal::Synchronized),
            _ => None,
        }
    }

    pub fn as_content(&self) -> Option<(ContentKind, &str, u64)> {
        match self {
            SignalBody::Offer { content, counter } => Some((ContentKind::Offer, content, *counter)),
            SignalBody::Answer { content, counter } => {
                Some((ContentKind::Answer, content, *counter))
            }
            SignalBody::IceCandidate { content, counter } => {
                Some((ContentKind::IceCandidate, content, *counter))
            }
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SignalBody::Requesting => "requesting",
            SignalBody::Acknowledging => "acknowledging",
            SignalBody::Synchronized => "synchronized",
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// A signal as received, stamped with the sender's relay session version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub to: String,
    pub from: String,
    pub token: String,
    pub version: u64,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: SignalMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        let message: SignalMessage = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.to.is_empty() {
            return Err(ProtocolError::MissingField("to"));
        }
        if self.from.is_empty() {
            return Err(ProtocolError::MissingField("from"));
        }
        if self.token.is_empty() {
            return Err(ProtocolError::MissingField("token"));
        }
        Ok(())
    }
}

/// A signal leaving a link. The relay stamps its own version; the control
/// channel stamps the remote version last seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSignal {
    pub to: String,
    pub from: String,
    pub token: String,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl OutboundSignal {
    pub fn with_version(self, version: u64) -> SignalMessage {
        SignalMessage {
            to: self.to,
            from: self.from,
            token: self.token,
            version,
            body: self.body,
        }
    }
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_handshake_message() {
        let text = r#"{"to":"b","from":"a","token":"abc","type":"requesting","version":3}"#;
        let message = SignalMessage::parse(text).unwrap();
        assert_eq!(message.body, SignalBody::Requesting);
        assert_eq!(message.version, 3);
        assert_eq!(message.body.as_handshake(), Some(HandshakeSignal::Requesting));
    }

    #[test]
    fn parses_ice_candidate_with_kebab_tag() {
        let value = json!({
            "to": "b",
            "from": "a",
            "token": "abc",
            "type": "ice-candidate",
            "content": "null",
            "counter": 4,
            "version": 1,
            "kind": "signal",
        });
        let message = SignalMessage::from_value(value).unwrap();
        let (kind, content, counter) = message.body.as_content().unwrap();
        assert_eq!(kind, ContentKind::IceCandidate);
        assert_eq!(content, "null");
        assert_eq!(counter, 4);
    }

    #[test]
    fn rejects_unknown_type_and_missing_fields() {
        let unknown = r#"{"to":"b","from":"a","token":"abc","type":"bye","version":1}"#;
        assert!(matches!(
            SignalMessage::parse(unknown),
            Err(ProtocolError::Decode(_))
        ));

        let missing_counter =
            r#"{"to":"b","from":"a","token":"abc","type":"offer","content":"x","version":1}"#;
        assert!(SignalMessage::parse(missing_counter).is_err());

        let empty_token = r#"{"to":"b","from":"a","token":"","type":"synchronized","version":1}"#;
        assert!(matches!(
            SignalMessage::parse(empty_token),
            Err(ProtocolError::MissingField("token"))
        ));
    }

    #[test]
    fn outbound_signal_serializes_flat() {
        let signal = OutboundSignal {
            to: "b".into(),
            from: "a".into(),
            token: "tok".into(),
            body: SignalBody::content(ContentKind::Answer, "sdp".into(), 2),
        };
        let value = serde_json::to_value(signal.clone().with_version(7)).unwrap();
        assert_eq!(
            value,
            json!({
                "to": "b",
                "from": "a",
                "token": "tok",
                "version": 7,
                "type": "answer",
                "content": "sdp",
                "counter": 2,
            })
        );
        let relay = serde_json::to_value(&signal).unwrap();
        assert!(relay.get("version").is_none());
    }

    #[test]
    fn tokens_are_fresh_alphanumerics() {
        let first = generate_token();
        let second = generate_token();
        assert_eq!(first.len(), TOKEN_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
    }
}
