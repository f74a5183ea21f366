//! Baseline file codec: pretty-printed JSON.

use std::io::{Read, Write};

use serde_json::Value;

use crate::codec::EncoderDecoder;
use crate::error::Result;

/// Pretty-printed JSON with two-space indent and a trailing newline, the
/// default file codec for map stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoderDecoder;

impl EncoderDecoder for JsonEncoderDecoder {
    fn encode(&self, w: &mut dyn Write, value: &Value) -> Result<()> {
        serde_json::to_writer_pretty(&mut *w, value)?;
        w.write_all(b"\n")?;
        Ok(())
    }

    fn decode(&self, r: &mut dyn Read) -> Result<Value> {
        Ok(serde_json::from_reader(r)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trip_preserves_value() {
        let value = json!({"a": 1, "nested": {"b": [true, null, "s"]}});
        let mut buf = Vec::new();
        JsonEncoderDecoder
            .encode(&mut buf, &value)
            .expect("encode");
        let back = JsonEncoderDecoder
            .decode(&mut buf.as_slice())
            .expect("decode");
        assert_eq!(back, value);
    }

    #[test]
    fn output_is_indented() {
        let value = json!({"a": {"b": 1}});
        let mut buf = Vec::new();
        JsonEncoderDecoder
            .encode(&mut buf, &value)
            .expect("encode");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("  \"a\""), "two-space indent expected: {text}");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn invalid_input_fails() {
        let err = JsonEncoderDecoder
            .decode(&mut b"{broken".as_slice())
            .expect_err("invalid json");
        assert!(matches!(err, crate::error::MapDbError::Json(_)));
    }
}
