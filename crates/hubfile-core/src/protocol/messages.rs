//! Control message bodies.
//!
//! Zero and empty fields are left out when encoding and defaulted when
//! decoding, so peers may send only what they need.

use serde::{Deserialize, Serialize};

/// Op name of an offer.
pub const OP_OFFER: &str = "offer";

/// Operations carried by a `read` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOp {
    /// Download a file from the target
    Pull,
    /// List a directory on the target
    List,
    /// Fetch a text preview from the target
    ReadText,
}

impl ReadOp {
    /// Wire name of the op.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::List => "list",
            Self::ReadText => "read_text",
        }
    }

    /// Parse an op, ignoring case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pull" => Some(Self::Pull),
            "list" => Some(Self::List),
            "read_text" => Some(Self::ReadText),
            _ => None,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(v: &bool) -> bool {
    !*v
}

/// `read` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadReq {
    /// `pull`, `list` or `read_text`
    pub op: String,
    /// Node the request is addressed to
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub target: u32,
    /// Directory relative to the target's base
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// File name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Whether the final file may be replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    /// Bytes the consumer already holds
    #[serde(skip_serializing_if = "is_zero")]
    pub resume_from: u64,
    /// Ask the provider to compute a digest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want_hash: Option<bool>,
    /// Recursive listing hint
    #[serde(skip_serializing_if = "is_false")]
    pub recursive: bool,
    /// Preview size limit for `read_text`
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_bytes: u32,
}

impl ReadReq {
    /// Parsed op, if recognised.
    pub fn read_op(&self) -> Option<ReadOp> {
        ReadOp::parse(&self.op)
    }
}

/// `read_resp` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadResp {
    /// `1` on success, an HTTP-like status otherwise
    pub code: u16,
    /// Human-readable status
    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg: String,
    /// Op being answered
    #[serde(skip_serializing_if = "String::is_empty")]
    pub op: String,
    /// Transfer session
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// Node holding the file
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub provider: u32,
    /// Node receiving the file
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub consumer: u32,
    /// Directory relative to the base
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// File name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// File size in bytes
    #[serde(skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Lowercase hex SHA-256, empty when not computed
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    /// Offset the provider starts sending from
    #[serde(skip_serializing_if = "is_zero")]
    pub start_from: u64,
    /// Provider chunk size
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub chunk_bytes: u32,
    /// Subdirectory names
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dirs: Vec<String>,
    /// File names
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Preview text
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Preview was cut at the size limit
    #[serde(skip_serializing_if = "is_false")]
    pub truncated: bool,
}

impl ReadResp {
    /// A failure response for `op`.
    pub fn error(code: u16, msg: &str, op: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            op: op.to_string(),
            ..Self::default()
        }
    }
}

/// `write` request body (an offer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteReq {
    /// Always `offer`
    pub op: String,
    /// Node that should receive the file
    pub target: u32,
    /// Session minted by the provider
    pub session_id: String,
    /// Directory relative to the base
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// File name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256, empty when not computed
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    /// Defaults to `true` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
}

/// `write_resp` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteResp {
    /// Response code
    pub code: u16,
    /// Human-readable status
    #[serde(skip_serializing_if = "String::is_empty")]
    pub msg: String,
    /// Op being answered
    #[serde(skip_serializing_if = "String::is_empty")]
    pub op: String,
    /// Transfer session
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// Node holding the file
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub provider: u32,
    /// Node receiving the file
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub consumer: u32,
    /// Directory relative to the base
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// File name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// File size in bytes
    #[serde(skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Lowercase hex SHA-256, empty when not computed
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    /// Whether the offer was accepted
    #[serde(skip_serializing_if = "is_false")]
    pub accept: bool,
    /// Where the provider should start sending
    #[serde(skip_serializing_if = "is_zero")]
    pub resume_from: u64,
}

impl WriteResp {
    /// A refusal for the offer identified by `session_id`.
    pub fn refuse(code: u16, msg: &str, session_id: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            op: OP_OFFER.to_string(),
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_op_parse() {
        assert_eq!(ReadOp::parse("Pull"), Some(ReadOp::Pull));
        assert_eq!(ReadOp::parse(" read_text"), Some(ReadOp::ReadText));
        assert_eq!(ReadOp::parse("delete"), None);
    }

    #[test]
    fn test_omits_zero_fields() {
        let resp = WriteResp::refuse(403, "rejected", "abc");
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["code"], 403);
        assert_eq!(json["op"], "offer");
        assert!(json.get("accept").is_none());
        assert!(json.get("resume_from").is_none());
    }

    #[test]
    fn test_decodes_partial_body() {
        let req: WriteReq =
            serde_json::from_str(r#"{"op":"offer","name":"a.txt","size":3}"#).expect("decode");
        assert_eq!(req.target, 0);
        assert_eq!(req.overwrite, None);
        assert_eq!(req.size, 3);

        let req: ReadReq = serde_json::from_str(r#"{"op":"pull","want_hash":false}"#)
            .expect("decode");
        assert_eq!(req.want_hash, Some(false));
        assert_eq!(req.read_op(), Some(ReadOp::Pull));
    }
}
