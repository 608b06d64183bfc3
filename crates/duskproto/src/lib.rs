//! `duskproto`: the duskmire wire protocol.
//!
//! Every message is one JSON object per line with a required string field
//! `type`. Inbound (client → server) shapes live in [`client`], outbound
//! (server → client) shapes in [`server`]. Decoding distinguishes "not
//! JSON", "no type tag", "unknown type" and "known type, bad fields" so the
//! gateway can log-and-drop unknown types without tearing the session down.

pub mod client;
pub mod server;
pub mod session;
pub mod types;

pub use client::ClientMsg;
pub use server::ServerMsg;
pub use session::SessionId;

#[derive(Debug, Clone)]
pub enum ProtoError {
    NotJson,
    MissingType,
    UnknownType(String),
    Malformed(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::NotJson => write!(f, "payload is not a json object"),
            ProtoError::MissingType => write!(f, "missing string field `type`"),
            ProtoError::UnknownType(t) => write!(f, "unknown message type: {t}"),
            ProtoError::Malformed(s) => write!(f, "malformed message: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}

/// Decode one inbound line.
pub fn decode_client(payload: &[u8]) -> Result<ClientMsg, ProtoError> {
    let v: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| ProtoError::NotJson)?;
    let Some(tag) = v.get("type").and_then(|t| t.as_str()) else {
        return Err(ProtoError::MissingType);
    };
    if !client::is_known_type(tag) {
        return Err(ProtoError::UnknownType(tag.to_string()));
    }
    serde_json::from_value::<ClientMsg>(v).map_err(|e| ProtoError::Malformed(e.to_string()))
}

/// Encode one outbound message as a single JSON line payload (no newline).
pub fn encode_server(msg: &ServerMsg) -> Vec<u8> {
    // ServerMsg contains only maps, vecs and primitives; serialization
    // cannot fail.
    serde_json::to_vec(msg).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ping() {
        let m = decode_client(b"{\"type\":\"ping\"}").unwrap();
        assert!(matches!(m, ClientMsg::Ping));
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let e = decode_client(b"{\"type\":\"teleportHome\"}").unwrap_err();
        assert!(matches!(e, ProtoError::UnknownType(t) if t == "teleportHome"));
    }

    #[test]
    fn missing_tag_and_garbage() {
        assert!(matches!(
            decode_client(b"{\"x\":1}"),
            Err(ProtoError::MissingType)
        ));
        assert!(matches!(decode_client(b"not json"), Err(ProtoError::NotJson)));
    }

    #[test]
    fn known_type_with_bad_fields_is_malformed() {
        let e = decode_client(b"{\"type\":\"login\",\"username\":7}").unwrap_err();
        assert!(matches!(e, ProtoError::Malformed(_)));
    }

    #[test]
    fn server_messages_carry_their_tag() {
        let v: serde_json::Value =
            serde_json::from_slice(&encode_server(&ServerMsg::Pong)).unwrap();
        assert_eq!(v["type"], "pong");
    }
}
