//! Wire Protocol
//!
//! JSON text frames exchanged over the delta WebSocket.
//!
//! ```text
//! client -> server  {"action": "subscribe", "instrument": "btc"}
//! server -> client  {"instrument": "btc", "<source>": [DataPoint...], ...}
//! server -> client  {"error": "<code>", "reason": "<message>"}
//! ```
//!
//! A rejection never closes the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::DeltaBatch;
use crate::domain::subscription::{Instrument, InstrumentError};

// =============================================================================
// Client Requests
// =============================================================================

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Replace the connection's subscription.
    Subscribe {
        /// Requested instrument.
        instrument: Instrument,
    },
}

impl ClientRequest {
    /// Build a subscribe request.
    #[must_use]
    pub const fn subscribe(instrument: Instrument) -> Self {
        Self::Subscribe { instrument }
    }

    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] describing why the frame was rejected.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RequestError::MalformedJson(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(RequestError::MalformedJson(
                "request must be a JSON object".to_string(),
            ));
        };

        let action = object
            .get("action")
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingAction)?;
        if action != "subscribe" {
            return Err(RequestError::UnknownAction(action.to_string()));
        }

        let raw = object
            .get("instrument")
            .and_then(Value::as_str)
            .ok_or(RequestError::InvalidInstrument(InstrumentError::Empty))?;
        let instrument = Instrument::parse(raw).map_err(RequestError::InvalidInstrument)?;

        Ok(Self::Subscribe { instrument })
    }

    /// Encode as a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        match self {
            Self::Subscribe { instrument } => serde_json::json!({
                "action": "subscribe",
                "instrument": instrument.as_str(),
            })
            .to_string(),
        }
    }
}

/// Why a client frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Not valid JSON, or not a JSON object.
    #[error("malformed request: {0}")]
    MalformedJson(String),
    /// No string `action` field.
    #[error("request has no action")]
    MissingAction,
    /// Action is not recognized.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// Instrument missing or invalid.
    #[error("invalid instrument: {0}")]
    InvalidInstrument(InstrumentError),
    /// Binary frames are not accepted.
    #[error("binary frames are not supported")]
    UnsupportedFrame,
}

impl RequestError {
    /// Stable error code sent to the client.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedJson(_) => "malformed_json",
            Self::MissingAction => "missing_action",
            Self::UnknownAction(_) => "unknown_action",
            Self::InvalidInstrument(_) => "invalid_instrument",
            Self::UnsupportedFrame => "unsupported_frame",
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Rejection frame sent in reply to an unusable request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Stable error code.
    pub error: String,
    /// Human-readable reason.
    pub reason: String,
}

impl From<&RequestError> for Rejection {
    fn from(err: &RequestError) -> Self {
        Self {
            error: err.code().to_string(),
            reason: err.to_string(),
        }
    }
}

impl Rejection {
    /// Encode as a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"error":"{}","reason":"unencodable reason"}}"#, self.error)
        })
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// One poll tick's delta.
    Delta(DeltaBatch),
    /// A rejected request.
    Rejected(Rejection),
}

impl ServerMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is neither a delta nor a rejection.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let is_rejection = value
            .as_object()
            .is_some_and(|o| o.contains_key("error") && !o.contains_key("instrument"));
        if is_rejection {
            serde_json::from_value(value).map(Self::Rejected)
        } else {
            serde_json::from_value(value).map(Self::Delta)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn parse_subscribe() {
        let request = ClientRequest::parse(r#"{"action":"subscribe","instrument":"btc"}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::subscribe(Instrument::parse("btc").unwrap())
        );
    }

    #[test]
    fn subscribe_round_trips_through_json() {
        let request = ClientRequest::subscribe(Instrument::parse("eth").unwrap());
        assert_eq!(ClientRequest::parse(&request.to_json()).unwrap(), request);
    }

    #[test]
    fn extra_fields_ignored() {
        let request =
            ClientRequest::parse(r#"{"action":"subscribe","instrument":"sol","id":7}"#).unwrap();
        assert!(matches!(request, ClientRequest::Subscribe { .. }));
    }

    #[test_case("not json", "malformed_json" ; "garbage")]
    #[test_case("[1,2]", "malformed_json" ; "array")]
    #[test_case(r#"{"instrument":"btc"}"#, "missing_action" ; "no action")]
    #[test_case(r#"{"action":5,"instrument":"btc"}"#, "missing_action" ; "numeric action")]
    #[test_case(r#"{"action":"unsubscribe","instrument":"btc"}"#, "unknown_action" ; "unknown action")]
    #[test_case(r#"{"action":"subscribe"}"#, "invalid_instrument" ; "no instrument")]
    #[test_case(r#"{"action":"subscribe","instrument":""}"#, "invalid_instrument" ; "empty instrument")]
    #[test_case(r#"{"action":"subscribe","instrument":"b c"}"#, "invalid_instrument" ; "bad instrument")]
    fn parse_rejects(text: &str, code: &str) {
        let err = ClientRequest::parse(text).unwrap_err();
        assert_eq!(err.code(), code);
    }

    #[test]
    fn rejection_frame_shape() {
        let rejection = Rejection::from(&RequestError::UnknownAction("unsubscribe".to_string()));
        let value: Value = serde_json::from_str(&rejection.to_json()).unwrap();

        assert_eq!(value["error"], "unknown_action");
        assert_eq!(value["reason"], "unknown action: unsubscribe");
    }

    #[test]
    fn decode_delta_and_rejection() {
        let delta = ServerMessage::decode(r#"{"instrument":"btc","price":[]}"#).unwrap();
        assert!(matches!(delta, ServerMessage::Delta(batch) if batch.instrument() == "btc"));

        let rejected =
            ServerMessage::decode(r#"{"error":"missing_action","reason":"request has no action"}"#)
                .unwrap();
        assert!(matches!(rejected, ServerMessage::Rejected(r) if r.error == "missing_action"));

        assert!(ServerMessage::decode(r#"{"hello":"world"}"#).is_err());
    }
}
