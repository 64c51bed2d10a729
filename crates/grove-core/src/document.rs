//! Block model of a remote grovebook.
//!
//! A grovebook is stored remotely as `{ blocks: [...], version }`. Blocks are
//! deserialised leniently: any JSON value becomes a [`Block`], so a single
//! malformed block never prevents the rest of the document from loading.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Format-version literal written on every legacy upload.
///
/// Whether the server validates this value is unknown; it is preserved as-is.
pub const FORMAT_VERSION: &str = "2.22.2";

/// Code mode used when neither the fence nor the metadata names one.
pub const DEFAULT_CODE_MODE: &str = "javascript2";

/// Data carried by a `codeTool` block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeBlock {
    /// Source text
    pub value: String,
    pub pin_code: bool,
    /// Stable block identifier used by the remote renderer
    pub dname: String,
    /// Source-language tag (e.g. "javascript2")
    pub code_mode: String,
    pub hide: bool,
}

/// One typed content unit of a grovebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "RawBlock")]
pub enum Block {
    Code(CodeBlock),
    Header { level: u8, text: String },
    Paragraph { text: String },
    /// Unrecognised block type, kept verbatim
    Other { kind: String, data: Value },
}

impl Block {
    /// The wire type tag of this block.
    pub fn kind(&self) -> &str {
        match self {
            Block::Code(_) => "codeTool",
            Block::Header { .. } => "header",
            Block::Paragraph { .. } => "paragraph",
            Block::Other { kind, .. } => kind,
        }
    }
}

/// Wire shape of a block: `{ "type": ..., "data": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

impl From<Block> for RawBlock {
    fn from(block: Block) -> Self {
        let kind = block.kind().to_string();
        let data = match block {
            Block::Code(code) => serde_json::json!({
                "value": code.value,
                "pinCode": code.pin_code,
                "dname": code.dname,
                "codeMode": code.code_mode,
                "hide": code.hide,
            }),
            Block::Header { level, text } => serde_json::json!({ "level": level, "text": text }),
            Block::Paragraph { text } => serde_json::json!({ "text": text }),
            Block::Other { data, .. } => data,
        };
        RawBlock { kind, data }
    }
}

impl From<Value> for Block {
    fn from(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        match kind.as_str() {
            "codeTool" => Block::Code(CodeBlock {
                value: str_field(&data, "value"),
                pin_code: bool_field(&data, "pinCode"),
                dname: str_field(&data, "dname"),
                code_mode: str_field(&data, "codeMode"),
                hide: bool_field(&data, "hide"),
            }),
            "header" => Block::Header {
                level: clamp_level(data.get("level").and_then(Value::as_u64)),
                text: str_field(&data, "text"),
            },
            "paragraph" => Block::Paragraph {
                text: str_field(&data, "text"),
            },
            _ => Block::Other { kind, data },
        }
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(data: &Value, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Clamp a heading level into 1..=6, defaulting to 1.
pub(crate) fn clamp_level(level: Option<u64>) -> u8 {
    level.map(|l| l.clamp(1, 6) as u8).unwrap_or(1)
}

/// A grovebook in its remote (legacy JSON) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    FORMAT_VERSION.to_string()
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            version: FORMAT_VERSION.to_string(),
        }
    }

    /// Try to read a fetched payload as a legacy block document.
    ///
    /// Returns `None` when the payload is not JSON or has no `blocks` field;
    /// the caller then treats the payload as native text.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(payload).ok()?;
        let map: &Map<String, Value> = value.as_object()?;
        let blocks = map
            .get("blocks")?
            .as_array()?
            .iter()
            .cloned()
            .map(Block::from)
            .collect();
        let version = map
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_version);
        Some(Self { blocks, version })
    }

    /// Serialize for upload.
    pub fn to_json(&self) -> String {
        // Blocks are plain JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
