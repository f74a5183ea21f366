//! Baseline key codec: standard-alphabet base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::codec::StringCodec;
use crate::error::{MapDbError, Result};

/// Encodes key names as standard base64, the stock key transform for
/// hiding raw identifiers in on-disk documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64StringCodec;

impl StringCodec for Base64StringCodec {
    fn encode(&self, plain: &str) -> String {
        STANDARD.encode(plain.as_bytes())
    }

    fn decode(&self, encoded: &str) -> Result<String> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|err| MapDbError::CodecFailure {
                path: String::new(),
                reason: format!("base64 decode of {encoded:?} failed: {err}"),
            })?;
        String::from_utf8(raw).map_err(|err| MapDbError::CodecFailure {
            path: String::new(),
            reason: format!("base64 payload of {encoded:?} is not utf-8: {err}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = Base64StringCodec;
        let encoded = codec.encode("provider/model:v1");
        assert_ne!(encoded, "provider/model:v1");
        assert_eq!(codec.decode(&encoded).expect("decode"), "provider/model:v1");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Base64StringCodec.decode("!!!").is_err());
    }
}
