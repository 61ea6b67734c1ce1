//! Wire encodings for bus messages.
//!
//! Frame and metadata payloads travel as JSON with base64 bodies:
//!
//! - frame: `{"d": base64(frame_bytes), "i": [i1, i2]}`
//! - metadata: `{"codecName": name, "codecData": base64(bytes)}`

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::media::{EncodedFrame, EncodedMetadata, FrameId};

/// Encode an encoded frame as a bus message.
pub fn frame_to_value(frame: &EncodedFrame) -> Value {
    json!({
        "d": BASE64.encode(&frame.data),
        "i": [frame.id.i1, frame.id.i2],
    })
}

/// Decode a frame message.
pub fn frame_from_value(value: &Value) -> Result<EncodedFrame> {
    let data = value
        .get("d")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ResponseParsing("frame message missing \"d\"".into()))?;
    let data = BASE64
        .decode(data)
        .map_err(|e| Error::ResponseParsing(format!("frame payload: {e}")))?;

    let id = match value.get("i").and_then(Value::as_array) {
        Some(pair) if pair.len() == 2 => FrameId::new(
            pair[0].as_i64().unwrap_or_default(),
            pair[1].as_i64().unwrap_or_default(),
        ),
        _ => FrameId::default(),
    };

    Ok(EncodedFrame {
        data: Bytes::from(data),
        id,
        timestamp: None,
    })
}

/// Encode stream metadata as a bus message.
pub fn metadata_to_value(metadata: &EncodedMetadata) -> Value {
    json!({
        "codecName": metadata.codec_name,
        "codecData": BASE64.encode(&metadata.codec_data),
    })
}

/// Decode a metadata message.
pub fn metadata_from_value(value: &Value) -> Result<EncodedMetadata> {
    let codec_name = value
        .get("codecName")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ResponseParsing("metadata message missing \"codecName\"".into()))?;
    let codec_data = value
        .get("codecData")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let codec_data = BASE64
        .decode(codec_data)
        .map_err(|e| Error::ResponseParsing(format!("codec data: {e}")))?;

    Ok(EncodedMetadata {
        codec_name: codec_name.to_owned(),
        codec_data: Bytes::from(codec_data),
        image_size: None,
    })
}
