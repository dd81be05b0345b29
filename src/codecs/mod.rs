//! Serialization codecs exposed to guest code.

pub mod json_patch;

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML stringify error: {0}")]
    TomlStringify(#[from] toml::ser::Error),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded bytes are not valid UTF-8")]
    Utf8,
    #[error("decompressed data exceeds {0} bytes")]
    TooLarge(usize),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("invalid JSON pointer `{0}`")]
    Pointer(String),
    #[error("JSON patch failed: {0}")]
    Patch(String),
}

pub fn yaml_parse(text: &str) -> Result<Value, CodecError> {
    Ok(serde_yaml::from_str(text)?)
}

pub fn yaml_stringify(value: &Value) -> Result<String, CodecError> {
    Ok(serde_yaml::to_string(value)?)
}

pub fn toml_parse(text: &str) -> Result<Value, CodecError> {
    let table: toml::Table = toml::from_str(text)?;
    // TOML has no null and every TOML value maps onto JSON.
    Ok(serde_json::to_value(table).unwrap_or(Value::Null))
}

pub fn toml_stringify(value: &Value) -> Result<String, CodecError> {
    Ok(toml::to_string(value)?)
}

pub fn base64_encode(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text)
}

pub fn base64_decode(encoded: &str) -> Result<String, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    String::from_utf8(bytes).map_err(|_| CodecError::Utf8)
}

/// Gzips `text` and returns the compressed bytes base64-encoded.
pub fn gzip(text: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Inflates base64-encoded gzip data into text of at most `limit` bytes.
pub fn gunzip(encoded: &str, limit: usize) -> Result<String, CodecError> {
    let compressed = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let mut bytes = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .take(limit as u64 + 1)
        .read_to_end(&mut bytes)?;
    if bytes.len() > limit {
        return Err(CodecError::TooLarge(limit));
    }
    String::from_utf8(bytes).map_err(|_| CodecError::Utf8)
}
