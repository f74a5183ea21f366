//! Recursive key/value transform pipeline applied during flush and load.
//!
//! Flush encodes values before keys so that provider lookups always see
//! in-memory key names; load decodes keys before values for the same
//! reason. A codec error aborts the whole pass and carries the offending
//! path.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::codec::{KeyCodecProvider, ValueCodecProvider};
use crate::error::{MapDbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Encode,
    Decode,
}

/// Apply the encode-direction pipeline to a copy of the document before it
/// is written to disk: value subtrees first, key renames second.
pub(crate) fn encode_for_disk(
    doc: &Map<String, Value>,
    key_provider: Option<&dyn KeyCodecProvider>,
    value_provider: Option<&dyn ValueCodecProvider>,
) -> Result<Map<String, Value>> {
    let mut copy = doc.clone();
    if let Some(provider) = value_provider {
        copy = transform_child_values(copy, &mut Vec::new(), provider, Mode::Encode)?;
    }
    if let Some(provider) = key_provider {
        transform_keys(&mut copy, &mut Vec::new(), provider, Mode::Encode)?;
    }
    Ok(copy)
}

/// Apply the decode-direction pipeline to a freshly loaded document: key
/// renames first, value subtrees second.
pub(crate) fn decode_from_disk(
    mut doc: Map<String, Value>,
    key_provider: Option<&dyn KeyCodecProvider>,
    value_provider: Option<&dyn ValueCodecProvider>,
) -> Result<Map<String, Value>> {
    if let Some(provider) = key_provider {
        transform_keys(&mut doc, &mut Vec::new(), provider, Mode::Decode)?;
    }
    if let Some(provider) = value_provider {
        doc = transform_child_values(doc, &mut Vec::new(), provider, Mode::Decode)?;
    }
    Ok(doc)
}

/// Rename the immediate child keys of `map` per the provider, then recurse
/// into child mappings with the renamed path.
fn transform_keys(
    map: &mut Map<String, Value>,
    path_so_far: &mut Vec<String>,
    provider: &dyn KeyCodecProvider,
    mode: Mode,
) -> Result<()> {
    // Collect renames for this level first; the map is not mutated while
    // iterating.
    let mut renames: Vec<(String, String)> = Vec::new();
    for key in map.keys() {
        path_so_far.push(key.clone());
        let codec = provider.codec_for(path_so_far);
        let result = codec.map(|codec| match mode {
            Mode::Encode => Ok(codec.encode(key)),
            Mode::Decode => codec.decode(key).map_err(|err| MapDbError::CodecFailure {
                path: path_so_far.join("."),
                reason: format!("failed to decode key {key:?}: {err}"),
            }),
        });
        path_so_far.pop();
        if let Some(new_key) = result.transpose()? {
            if new_key != *key {
                renames.push((key.clone(), new_key));
            }
        }
    }

    for (old, new) in renames {
        if let Some(val) = map.remove(&old) {
            map.insert(new, val);
        }
    }

    // Recurse using the renamed child keys.
    let child_keys: Vec<String> = map.keys().cloned().collect();
    for key in child_keys {
        if let Some(Value::Object(child)) = map.get_mut(&key) {
            path_so_far.push(key.clone());
            let res = transform_keys(child, path_so_far, provider, mode);
            path_so_far.pop();
            res?;
        }
    }
    Ok(())
}

/// Recurse into the children of a root mapping; the root itself (the empty
/// path) never gets a value codec since the document root must stay a
/// mapping on disk.
fn transform_child_values(
    map: Map<String, Value>,
    path_so_far: &mut Vec<String>,
    provider: &dyn ValueCodecProvider,
    mode: Mode,
) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in map {
        path_so_far.push(key.clone());
        let transformed = transform_value(value, path_so_far, provider, mode);
        path_so_far.pop();
        out.insert(key, transformed?);
    }
    Ok(out)
}

fn transform_value(
    value: Value,
    path_so_far: &mut Vec<String>,
    provider: &dyn ValueCodecProvider,
    mode: Mode,
) -> Result<Value> {
    if let Some(codec) = provider.codec_for(path_so_far) {
        return match mode {
            Mode::Encode => {
                let mut buf = Vec::new();
                codec
                    .encode(&mut buf, &value)
                    .map_err(|err| MapDbError::CodecFailure {
                        path: path_so_far.join("."),
                        reason: format!("value encode failed: {err}"),
                    })?;
                Ok(Value::String(STANDARD.encode(buf)))
            }
            Mode::Decode => {
                // Anything that is not a string cannot be an encoded
                // subtree; leave it untouched.
                let Value::String(encoded) = value else {
                    return Ok(value);
                };
                let raw = STANDARD
                    .decode(&encoded)
                    .map_err(|err| MapDbError::CodecFailure {
                        path: path_so_far.join("."),
                        reason: format!("base64 decode failed: {err}"),
                    })?;
                codec
                    .decode(&mut raw.as_slice())
                    .map_err(|err| MapDbError::CodecFailure {
                        path: path_so_far.join("."),
                        reason: format!("value decode failed: {err}"),
                    })
            }
        };
    }

    match value {
        Value::Object(map) => Ok(Value::Object(transform_child_values(
            map,
            path_so_far,
            provider,
            mode,
        )?)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::codec::{
        Base64StringCodec, EncoderDecoder, JsonEncoderDecoder, StringCodec,
    };

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("literal must be an object");
        };
        map
    }

    fn key_provider_for(prefix: &'static str) -> impl KeyCodecProvider {
        move |path: &[String]| -> Option<Arc<dyn StringCodec>> {
            if path.first().map(String::as_str) == Some(prefix) && path.len() == 2 {
                Some(Arc::new(Base64StringCodec))
            } else {
                None
            }
        }
    }

    fn value_provider_for(target: &'static [&'static str]) -> impl ValueCodecProvider {
        move |path: &[String]| -> Option<Arc<dyn EncoderDecoder>> {
            if path.len() == target.len() && path.iter().zip(target).all(|(a, b)| a == b) {
                Some(Arc::new(JsonEncoderDecoder))
            } else {
                None
            }
        }
    }

    #[test]
    fn key_transform_round_trips() {
        let doc = obj(json!({
            "providers": {"openai/gpt": {"enabled": true}, "local/llama": {"enabled": false}},
            "other": {"plain": 1},
        }));

        let provider = key_provider_for("providers");
        let encoded = encode_for_disk(&doc, Some(&provider), None).expect("encode");
        let providers = encoded["providers"].as_object().expect("map");
        assert!(providers.keys().all(|k| !k.contains('/')));

        let decoded = decode_from_disk(encoded, Some(&provider), None).expect("decode");
        assert_eq!(decoded, doc);
    }

    #[test]
    fn value_transform_wraps_subtree_as_base64_string() {
        let doc = obj(json!({
            "secrets": {"token": "abc", "nested": {"k": 1}},
            "visible": true,
        }));

        let provider = value_provider_for(&["secrets"]);
        let encoded = encode_for_disk(&doc, None, Some(&provider)).expect("encode");
        assert!(encoded["secrets"].is_string(), "subtree must be wrapped");
        assert_eq!(encoded["visible"], json!(true));

        let decoded = decode_from_disk(encoded, None, Some(&provider)).expect("decode");
        assert_eq!(decoded, doc);
    }

    #[test]
    fn value_then_key_order_keeps_paths_stable() {
        // The value codec is keyed on the *unencoded* key name; both
        // directions must agree even though the key is renamed on disk.
        let doc = obj(json!({"providers": {"inner": 7}}));
        let keyp = |path: &[String]| -> Option<Arc<dyn StringCodec>> {
            if path.len() == 1 && path[0] == "providers" {
                Some(Arc::new(Base64StringCodec))
            } else {
                None
            }
        };
        let valp = value_provider_for(&["providers"]);

        let encoded = encode_for_disk(&doc, Some(&keyp), Some(&valp)).expect("encode");
        let disk_key = Base64StringCodec.encode("providers");
        assert!(encoded.contains_key(&disk_key));
        assert!(encoded[&disk_key].is_string());

        let decoded = decode_from_disk(encoded, Some(&keyp), Some(&valp)).expect("decode");
        assert_eq!(decoded, doc);
    }

    #[test]
    fn decode_error_carries_path() {
        let doc = obj(json!({"secrets": "@@not-base64@@"}));
        let provider = value_provider_for(&["secrets"]);
        let err = decode_from_disk(doc, None, Some(&provider)).expect_err("bad payload");
        match err {
            MapDbError::CodecFailure { path, .. } => assert_eq!(path, "secrets"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bad_key_decode_carries_path() {
        let doc = obj(json!({"providers": {"%%%": 1}}));
        let provider = key_provider_for("providers");
        let err = decode_from_disk(doc, Some(&provider), None).expect_err("bad key");
        match err {
            MapDbError::CodecFailure { path, .. } => assert_eq!(path, "providers.%%%"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scalar_leaves_pass_through_untouched() {
        let doc = obj(json!({"a": [1, "two", null], "b": 3.5}));
        let provider = value_provider_for(&["missing"]);
        let encoded = encode_for_disk(&doc, None, Some(&provider)).expect("encode");
        assert_eq!(encoded, doc);
    }
}
