use serde::{Deserialize, Serialize};

/// A request line, dispatched on its `action` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    #[serde(rename = "list_shaders")]
    List { gpu: String, proto: String },
    #[serde(rename = "get_shader")]
    Fetch {
        #[serde(rename = "shaderHash")]
        shader_hash: String,
        gpu: String,
        proto: String,
    },
}

impl Request {
    pub fn proto(&self) -> &str {
        match self {
            Request::List { proto, .. } => proto,
            Request::Fetch { proto, .. } => proto,
        }
    }
}

/// Answer to `list_shaders`: every hash the serving store holds.
/// Hardware-class filtering happens on the client side, when choosing
/// which peers to ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub shaders: Vec<String>,
    pub count: usize,
    /// The server's own hardware class, informational.
    pub gpu: String,
}

/// Metadata line answering `get_shader`. When `found` is true the line
/// is immediately followed by the payload: exactly `size` bytes after
/// decompression, gzip-compressed on the wire iff `gzip` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gzip: Option<bool>,
}

impl FetchResponse {
    pub fn not_found() -> Self {
        Self {
            found: false,
            sha256: None,
            size: None,
            gzip: None,
        }
    }
}

/// Structured error line, sent instead of a response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
