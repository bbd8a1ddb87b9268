use serde::{Deserialize, Serialize};

/// One frame on the signaling WebSocket.
///
/// `data` is itself a JSON document: a `SessionDescription` for
/// offer/answer, an `ICECandidateInit` for candidate, a bare JSON string
/// for change_quality. Keeping the payload opaque here means the envelope
/// never needs to change when the event vocabulary grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: String,
    pub data: String,
}

impl SignalMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// The signaling alphabet.
///
/// Two disjoint subsets: events arriving from the remote side
/// (`Offer`, `Answer`, `Candidate`, `ChangeQuality`) and internal
/// send-requests (`SendOffer`, `SendAnswer`, `SendCandidate`) that are
/// queued for delivery. The send-* names never appear on the wire; an
/// enqueued `SendOffer` is transmitted as a plain `offer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Offer,
    Answer,
    Candidate,
    ChangeQuality,
    SendOffer,
    SendAnswer,
    SendCandidate,
}

/// An event tag that is not part of the signaling alphabet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("undefined event: {0}")]
pub struct UndefinedEvent(pub String);

impl SignalEvent {
    /// Parse an event tag. Unknown tags are a hard protocol error.
    pub fn parse(tag: &str) -> Result<Self, UndefinedEvent> {
        match tag {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "candidate" => Ok(Self::Candidate),
            "change_quality" => Ok(Self::ChangeQuality),
            "send_offer" => Ok(Self::SendOffer),
            "send_answer" => Ok(Self::SendAnswer),
            "send_candidate" => Ok(Self::SendCandidate),
            other => Err(UndefinedEvent(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::ChangeQuality => "change_quality",
            Self::SendOffer => "send_offer",
            Self::SendAnswer => "send_answer",
            Self::SendCandidate => "send_candidate",
        }
    }

    /// The tag used on the wire. Send-requests are transmitted under the
    /// bare name the remote side understands.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::SendOffer => "offer",
            Self::SendAnswer => "answer",
            Self::SendCandidate => "candidate",
            other => other.as_str(),
        }
    }

    /// True for the internal send-request subset.
    pub fn is_send_request(&self) -> bool {
        matches!(self, Self::SendOffer | Self::SendAnswer | Self::SendCandidate)
    }
}
