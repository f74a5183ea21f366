//! Pluggable codecs for file content, key names and value subtrees.
//!
//! Codecs are behavioral interfaces injected at store construction. The
//! file codec turns a whole document into bytes; key and value codecs are
//! selected per key path by provider callbacks and applied recursively by
//! the [`pipeline`] during flush and load.

mod base64str;
mod json;
pub(crate) mod pipeline;

use std::io::{Read, Write};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

pub use base64str::Base64StringCodec;
pub use json::JsonEncoderDecoder;

/// Encodes and decodes a JSON value to and from a byte stream.
///
/// Used both as the file codec (whole document) and as a value codec for
/// subtrees selected by a [`ValueCodecProvider`].
pub trait EncoderDecoder: Send + Sync {
    fn encode(&self, w: &mut dyn Write, value: &Value) -> Result<()>;
    fn decode(&self, r: &mut dyn Read) -> Result<Value>;
}

/// Encodes and decodes one string to another, for key-name transforms.
///
/// Encoding is infallible by contract; decoding can fail on malformed
/// input.
pub trait StringCodec: Send + Sync {
    fn encode(&self, plain: &str) -> String;
    fn decode(&self, encoded: &str) -> Result<String>;
}

/// Selects an optional key codec for the child key at `path_so_far`.
///
/// `path_so_far` is the in-memory (unencoded) path including the child key
/// itself. Implemented for plain closures.
pub trait KeyCodecProvider: Send + Sync {
    fn codec_for(&self, path_so_far: &[String]) -> Option<Arc<dyn StringCodec>>;
}

impl<F> KeyCodecProvider for F
where
    F: Fn(&[String]) -> Option<Arc<dyn StringCodec>> + Send + Sync,
{
    fn codec_for(&self, path_so_far: &[String]) -> Option<Arc<dyn StringCodec>> {
        self(path_so_far)
    }
}

/// Selects an optional value codec for the subtree rooted at `path_so_far`.
///
/// When a codec is returned, the whole subtree is encoded to bytes,
/// base64-wrapped and stored as a string in its place. Implemented for
/// plain closures.
pub trait ValueCodecProvider: Send + Sync {
    fn codec_for(&self, path_so_far: &[String]) -> Option<Arc<dyn EncoderDecoder>>;
}

impl<F> ValueCodecProvider for F
where
    F: Fn(&[String]) -> Option<Arc<dyn EncoderDecoder>> + Send + Sync,
{
    fn codec_for(&self, path_so_far: &[String]) -> Option<Arc<dyn EncoderDecoder>> {
        self(path_so_far)
    }
}
