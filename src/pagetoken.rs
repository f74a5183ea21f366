//! Opaque continuation tokens: base64-wrapped JSON envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MapDbError, Result};

/// Serialize `value` into an opaque continuation token.
pub(crate) fn encode_token<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(raw))
}

/// Decode a continuation token produced by [`encode_token`].
///
/// Both a bad base64 wrapper and a bad envelope surface as
/// `InvalidPageToken`; callers that want lenient handling match on it.
pub(crate) fn decode_token<T: DeserializeOwned>(token: &str) -> Result<T> {
    let raw = STANDARD
        .decode(token)
        .map_err(|err| MapDbError::InvalidPageToken {
            reason: format!("bad base64: {err}"),
        })?;
    serde_json::from_slice(&raw).map_err(|err| MapDbError::InvalidPageToken {
        reason: format!("bad envelope: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Envelope {
        offset: usize,
        label: String,
    }

    #[test]
    fn round_trip() {
        let env = Envelope {
            offset: 42,
            label: "p".into(),
        };
        let token = encode_token(&env).expect("encode");
        let back: Envelope = decode_token(&token).expect("decode");
        assert_eq!(back, env);
    }

    #[test]
    fn rejects_bad_base64() {
        let err = decode_token::<Envelope>("not-base-64!").expect_err("bad base64");
        assert!(matches!(err, MapDbError::InvalidPageToken { .. }));
    }

    #[test]
    fn rejects_bad_envelope() {
        let token = STANDARD.encode(b"{\"offset\":\"nope\"}");
        let err = decode_token::<Envelope>(&token).expect_err("bad envelope");
        assert!(matches!(err, MapDbError::InvalidPageToken { .. }));
    }
}
