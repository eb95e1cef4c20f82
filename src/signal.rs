//! Addressed signaling envelopes exchanged over a relay topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::session::{IceCandidate, SdpKind, SessionDescription};
use crate::types::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Ready,
    Offer,
    Answer,
    IceCandidate,
}

/// `{from, to, type, payload}`; immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn new(from: ParticipantId, to: ParticipantId, kind: SignalKind, payload: Value) -> Self {
        Self {
            from,
            to,
            kind,
            payload,
        }
    }

    /// Decode a relayed JSON value. Anything that is not a well-formed
    /// envelope (unknown `type`, missing addressing) yields `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!("Dropping malformed envelope: {}", e);
                None
            }
        }
    }

    pub fn is_addressed_to(&self, participant: &ParticipantId) -> bool {
        &self.to == participant
    }

    /// Payload of an `offer` / `answer` envelope. The description type must
    /// agree with the envelope type.
    pub fn description(&self) -> Option<SessionDescription> {
        let expected = match self.kind {
            SignalKind::Offer => SdpKind::Offer,
            SignalKind::Answer => SdpKind::Answer,
            _ => return None,
        };
        let description: SessionDescription = serde_json::from_value(self.payload.clone()).ok()?;
        (description.kind == expected).then_some(description)
    }

    pub fn candidate(&self) -> Option<IceCandidate> {
        if self.kind != SignalKind::IceCandidate {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: SignalKind, payload: Value) -> SignalEnvelope {
        SignalEnvelope::new("a1".into(), "b2".into(), kind, payload)
    }

    #[test]
    fn serialize_uses_kebab_case_type() {
        let msg = envelope(SignalKind::IceCandidate, json!({"candidate": "c"}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["from"], "a1");
        assert_eq!(json["to"], "b2");
    }

    #[test]
    fn parse_ready_without_payload() {
        let msg = SignalEnvelope::from_value(json!({"from": "a1", "to": "b2", "type": "ready"})).unwrap();
        assert_eq!(msg.kind, SignalKind::Ready);
        assert_eq!(msg.payload, Value::Null);
    }

    #[test]
    fn unknown_type_is_dropped() {
        let msg = SignalEnvelope::from_value(json!({"from": "a1", "to": "b2", "type": "renegotiate"}));
        assert!(msg.is_none());
    }

    #[test]
    fn missing_recipient_is_dropped() {
        assert!(SignalEnvelope::from_value(json!({"from": "a1", "type": "ready"})).is_none());
    }

    #[test]
    fn addressed_to_checks_recipient_only() {
        let msg = envelope(SignalKind::Ready, Value::Null);
        assert!(msg.is_addressed_to(&"b2".into()));
        assert!(!msg.is_addressed_to(&"a1".into()));
    }

    #[test]
    fn description_requires_matching_kind() {
        let offer = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert!(envelope(SignalKind::Offer, offer.clone()).description().is_some());
        assert!(envelope(SignalKind::Answer, offer).description().is_none());
    }

    #[test]
    fn candidate_payload_decodes() {
        let msg = envelope(SignalKind::IceCandidate, json!({"candidate": "c", "sdpMid": "0"}));
        let candidate = msg.candidate().unwrap();
        assert_eq!(candidate.candidate, "c");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert!(envelope(SignalKind::Ready, json!({"candidate": "c"})).candidate().is_none());
    }
}
