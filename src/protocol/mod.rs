//! Boundary Protocol Shapes
//!
//! One strict inbound command shape and one typed outbound frame shape.
//! Inbound payloads are normalized here, at the edge: anything with a
//! missing or unknown field is rejected before it reaches a component, so
//! the core never has to guess between `receiver` and `receiverId` style
//! aliases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::PresenceUpdate;
use crate::shared::{RealtimeError, Result, UserId};

/// Outbound frame written to a connection handle.
///
/// The transport layer owns the actual wire encoding; these are the typed
/// shapes it serializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum Frame {
    /// Liveness probe; the client answers with a `PONG` command
    #[serde(rename = "PING")]
    Ping,

    /// A delivered payload, opaque to the engine
    #[serde(rename = "MESSAGE")]
    Message { payload: Value },

    /// Another user's presence changed
    #[serde(rename = "PRESENCE_UPDATE")]
    Presence(PresenceUpdate),

    /// Everyone else's presence, sent once to a freshly connected client
    #[serde(rename = "PRESENCE_SNAPSHOT")]
    PresenceSnapshot { entries: Vec<PresenceUpdate> },

    /// Typing indicator changed for a peer
    #[serde(rename = "TYPING_UPDATE")]
    Typing { user_id: UserId, is_typing: bool },

    /// Server-initiated disconnect notice, sent before the close
    #[serde(rename = "FORCE_DISCONNECT")]
    ForceDisconnect { reason: String },

    /// Acknowledgment of an explicit logout, sent before closure completes
    #[serde(rename = "LOGOUT_ACK")]
    LogoutAck,
}

/// Inbound command from an already-authenticated connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum ClientCommand {
    /// Heartbeat answer
    #[serde(rename = "PONG")]
    Pong,

    /// Explicit presence status change
    #[serde(rename = "SET_STATUS")]
    SetStatus(SetStatusCommand),

    /// Typing started towards a recipient
    #[serde(rename = "TYPING_START")]
    TypingStart(TypingCommand),

    /// Typing stopped towards a recipient
    #[serde(rename = "TYPING_STOP")]
    TypingStop(TypingCommand),

    /// Clean client-initiated disconnect
    #[serde(rename = "LOGOUT")]
    Logout,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetStatusCommand {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingCommand {
    pub receiver_id: UserId,
}

/// Parse a raw inbound text frame into a strict command.
///
/// # Errors
///
/// Returns `RealtimeError::Malformed` with the parse reason; no state is
/// mutated for a rejected payload.
pub fn parse_command(raw: &str) -> Result<ClientCommand> {
    serde_json::from_str(raw).map_err(|e| RealtimeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn parses_pong() {
        let cmd = parse_command(r#"{"t":"PONG"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Pong);
    }

    #[test]
    fn parses_typing_start() {
        let cmd = parse_command(r#"{"t":"TYPING_START","d":{"receiver_id":42}}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::TypingStart(TypingCommand { receiver_id: 42 })
        );
    }

    #[test_case(r#"{"t":"TYPING_START","d":{"receiver":42}}"# ; "aliased field name")]
    #[test_case(r#"{"t":"TYPING_START","d":{}}"# ; "missing recipient")]
    #[test_case(r#"{"t":"SET_STATUS","d":{"status":"away","extra":1}}"# ; "unknown field")]
    #[test_case(r#"{"t":"NOT_A_COMMAND"}"# ; "unknown command")]
    #[test_case("not json" ; "not json at all")]
    fn rejects_malformed(raw: &str) {
        assert!(matches!(
            parse_command(raw),
            Err(RealtimeError::Malformed(_))
        ));
    }

    #[test]
    fn frame_round_trips_tagged_layout() {
        let frame = Frame::Typing {
            user_id: 7,
            is_typing: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["t"], "TYPING_UPDATE");
        assert_eq!(json["d"]["user_id"], 7);
    }
}
