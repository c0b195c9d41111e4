//! Wire schema for the three pipeline messages.
//!
//! Payloads are validated when parsed: a message that reaches a handler
//! has every required field present and non-empty.

use crate::codec;
use facematch_core::MatchResult;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Result string for a request with no detectable face.
pub const NO_FACE: &str = "No-Face";
/// Result string for a face that matched no one.
pub const UNKNOWN: &str = "Unknown";

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] codec::DecodeError),
}

/// Image submitted to the edge stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Base64-encoded image file.
    #[serde(default)]
    pub encoded: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub filename: String,
}

impl ImageRequest {
    pub fn new(image: &[u8], request_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            encoded: codec::encode(image),
            request_id: request_id.into(),
            filename: filename.into(),
        }
    }

    /// Parse and validate a JSON payload.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let msg: Self = serde_json::from_slice(raw)?;
        require("encoded", &msg.encoded)?;
        require("request_id", &msg.request_id)?;
        require("filename", &msg.filename)?;
        Ok(msg)
    }

    /// Decoded image bytes.
    pub fn image_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(codec::decode(&self.encoded)?)
    }
}

/// Cropped face forwarded from edge to cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub filename: String,
    /// Base64-encoded JPEG crop.
    #[serde(default)]
    pub face: String,
}

impl FaceRequest {
    pub fn new(request_id: impl Into<String>, filename: impl Into<String>, jpeg: &[u8]) -> Self {
        Self {
            request_id: request_id.into(),
            filename: filename.into(),
            face: codec::encode(jpeg),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let msg: Self = serde_json::from_slice(raw)?;
        require("request_id", &msg.request_id)?;
        require("face", &msg.face)?;
        Ok(msg)
    }

    pub fn face_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(codec::decode(&self.face)?)
    }
}

/// Final answer published to the response queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub result: Verdict,
}

impl MatchResponse {
    pub fn new(request_id: impl Into<String>, filename: Option<String>, result: Verdict) -> Self {
        Self {
            request_id: request_id.into(),
            filename,
            result,
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let msg: Self = serde_json::from_slice(raw)?;
        require("request_id", &msg.request_id)?;
        Ok(msg)
    }
}

/// Outcome of one request, serialized as a bare string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Label(String),
    Unknown,
    NoFace,
}

impl Verdict {
    /// Whether `label` would read back as `Unknown` or `No-Face` instead of a label.
    pub fn is_reserved(label: &str) -> bool {
        label == UNKNOWN || label == NO_FACE
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verdict::Label(label) => label,
            Verdict::Unknown => UNKNOWN,
            Verdict::NoFace => NO_FACE,
        }
    }
}

impl From<MatchResult> for Verdict {
    fn from(result: MatchResult) -> Self {
        match result {
            MatchResult::Identified(label) => Verdict::Label(label),
            MatchResult::Unidentified => Verdict::Unknown,
        }
    }
}

impl From<String> for Verdict {
    fn from(s: String) -> Self {
        match s.as_str() {
            UNKNOWN => Verdict::Unknown,
            NO_FACE => Verdict::NoFace,
            _ => Verdict::Label(s),
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Verdict::from)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), MessageError> {
    if value.trim().is_empty() {
        Err(MessageError::MissingField(field))
    } else {
        Ok(())
    }
}
