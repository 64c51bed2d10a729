//! Conversion between the block model and the local markdown text.
//!
//! Handles both directions:
//! - [`decode`]: remote blocks → flat markdown (what the user edits)
//! - [`encode`]: flat markdown → remote blocks (what gets uploaded)
//!
//! Code blocks carry a metadata comment (`<!--{...}-->`) on the line directly
//! above their fence so that `dname`, `pinCode` and `hide` survive the round
//! trip. Both directions are total: bad input degrades, it never errors.
//!
//! Encoding is a single pass over the lines. Fence detection takes precedence
//! over prose classification, so a `# heading` inside a fence stays source
//! code.

use crate::document::{clamp_level, Block, CodeBlock, Document, DEFAULT_CODE_MODE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

const FENCE: &str = "```";

/// Code mode ⇄ fence language alias pairs.
const ALIASES: &[(&str, &str)] = &[("javascript2", "js")];

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.+?)[ \t]*$").expect("valid heading regex"));

/// Map a code mode to the language tag shown on the fence.
pub fn encode_alias(mode: &str) -> &str {
    ALIASES
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, alias)| *alias)
        .unwrap_or(mode)
}

/// Map a fence language tag back to the code mode.
pub fn decode_alias(alias: &str) -> &str {
    ALIASES
        .iter()
        .find(|(_, a)| *a == alias)
        .map(|(mode, _)| *mode)
        .unwrap_or(alias)
}

// ============================================================================
// Remote → local
// ============================================================================

/// Render a remote document as local markdown text.
pub fn decode(document: &Document) -> String {
    document
        .blocks
        .iter()
        .map(render_block)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_block(block: &Block) -> String {
    match block {
        Block::Code(code) => {
            let meta = serde_json::json!({
                "codeMode": code.code_mode,
                "dname": code.dname,
                "hide": code.hide,
                "pinCode": code.pin_code,
            });
            format!(
                "<!--{}-->\n{FENCE}{}\n{}\n{FENCE}",
                meta,
                encode_alias(&code.code_mode),
                code.value
            )
        }
        Block::Header { level, text } => {
            if text.trim().is_empty() {
                String::new()
            } else {
                format!("{} {}", "#".repeat(usize::from(*level)), text.trim())
            }
        }
        Block::Paragraph { text } => {
            // A paragraph that starts like a heading needs the override
            // comment, otherwise it comes back as a header.
            let first_line = text.trim_start().lines().next().unwrap_or_default();
            if HEADING.is_match(first_line) {
                format!("<!--{{\"type\":\"paragraph\"}}-->\n{}", text)
            } else {
                text.clone()
            }
        }
        Block::Other { kind, data } => match data.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => {
                debug!("Dropping block of type {:?} with no text", kind);
                String::new()
            }
        },
    }
}

// ============================================================================
// Local → remote
// ============================================================================

/// Prose metadata waiting for the line it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingMeta {
    Header { level: Option<u8> },
    Paragraph,
}

/// Single-pass line classifier.
#[derive(Default)]
struct Encoder {
    blocks: Vec<Block>,
    paragraph: Vec<String>,
    pending: Option<PendingMeta>,
}

impl Encoder {
    fn flush_paragraph(&mut self) {
        let text = self.paragraph.join("\n").trim().to_string();
        self.paragraph.clear();
        if !text.is_empty() {
            self.blocks.push(Block::Paragraph { text });
        }
    }

    /// `body` holds raw lines; a `\r` inside them is part of the source.
    fn push_code(&mut self, tag: &str, meta: Option<&Map<String, Value>>, body: &[&str], crlf: bool) {
        let meta_str = |key: &str| {
            meta.and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };
        let meta_bool = |key: &str| {
            meta.and_then(|m| m.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        // The fence tag wins, unless the metadata names a mode that renders
        // to this exact tag (keeps `js` and modes with spaces intact).
        let code_mode = match meta_str("codeMode") {
            Some(mode) if tag.is_empty() || encode_alias(mode) == tag => mode.to_string(),
            _ if !tag.is_empty() => decode_alias(tag).to_string(),
            _ => DEFAULT_CODE_MODE.to_string(),
        };
        let dname = meta_str("dname")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut value = body.join("\n");
        // In a CRLF file the last body line's `\r` is its line ending
        if crlf && value.ends_with('\r') {
            value.pop();
        }

        self.blocks.push(Block::Code(CodeBlock {
            value,
            pin_code: meta_bool("pinCode"),
            dname,
            code_mode,
            hide: meta_bool("hide"),
        }));
    }

    fn prose_line(&mut self, line: &str) {
        let line = strip_cr(line);
        let blank = line.trim().is_empty();
        let heading = parse_heading(line);

        match (self.pending, heading) {
            (Some(_), _) if blank => {}
            (Some(PendingMeta::Header { level }), Some((counted, text))) => {
                self.flush_paragraph();
                self.blocks.push(Block::Header {
                    level: level.unwrap_or(counted),
                    text,
                });
                self.pending = None;
            }
            (Some(PendingMeta::Header { .. }), None) | (Some(PendingMeta::Paragraph), _) => {
                self.paragraph.push(line.to_string());
                self.pending = None;
            }
            (None, Some((level, text))) => {
                self.flush_paragraph();
                self.blocks.push(Block::Header { level, text });
            }
            (None, None) if blank => self.flush_paragraph(),
            (None, None) => self.paragraph.push(line.to_string()),
        }
    }

    fn finish(mut self) -> Document {
        self.flush_paragraph();
        Document::new(self.blocks)
    }
}

/// Convert local markdown text into a remote document.
pub fn encode(text: &str) -> Document {
    // Lines keep their `\r`; only prose and fence classification strip it
    let lines: Vec<&str> = text.split('\n').collect();
    let mut encoder = Encoder::default();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(comment) = metadata_comment(line) {
            let parsed = serde_json::from_str::<Map<String, Value>>(comment);

            if let Ok(meta) = &parsed {
                if let Some(pending) = prose_meta(meta) {
                    encoder.flush_paragraph();
                    encoder.pending = Some(pending);
                    i += 1;
                    continue;
                }
            }

            if let Some(close) = lines.get(i + 1).and_then(|_| fence_close(&lines, i + 1)) {
                let meta = match parsed {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        debug!("Ignoring unparseable metadata comment on line {}: {}", i + 1, e);
                        None
                    }
                };
                encoder.flush_paragraph();
                encoder.pending = None;
                let opening = lines[i + 1];
                encoder.push_code(
                    fence_tag(opening),
                    meta.as_ref(),
                    &lines[i + 2..close],
                    opening.ends_with('\r'),
                );
                i = close + 1;
                continue;
            }

            debug!("Dropping metadata comment on line {} with no fence below it", i + 1);
            i += 1;
            continue;
        }

        if let Some(close) = fence_close(&lines, i) {
            encoder.flush_paragraph();
            encoder.pending = None;
            encoder.push_code(fence_tag(line), None, &lines[i + 1..close], line.ends_with('\r'));
            i = close + 1;
            continue;
        }

        encoder.prose_line(line);
        i += 1;
    }

    encoder.finish()
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

/// If `lines[open]` opens a fence, return the index of its closing fence.
///
/// An unterminated fence is not a fence; its lines are read as prose.
fn fence_close(lines: &[&str], open: usize) -> Option<usize> {
    if !is_fence(lines[open]) {
        return None;
    }
    lines[open + 1..]
        .iter()
        .position(|l| is_fence(l))
        .map(|offset| open + 1 + offset)
}

/// Language tag of an opening fence: the trimmed rest of the line.
fn fence_tag(line: &str) -> &str {
    line.trim_start().trim_start_matches('`').trim()
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Inner JSON of a `<!--{...}-->` line, if the whole line is one.
fn metadata_comment(line: &str) -> Option<&str> {
    let inner = line.trim().strip_prefix("<!--")?.strip_suffix("-->")?.trim();
    inner.starts_with('{').then_some(inner)
}

fn prose_meta(meta: &Map<String, Value>) -> Option<PendingMeta> {
    match meta.get("type").and_then(Value::as_str)? {
        "header" => Some(PendingMeta::Header {
            level: meta
                .get("level")
                .and_then(Value::as_u64)
                .map(|l| clamp_level(Some(l))),
        }),
        "paragraph" => Some(PendingMeta::Paragraph),
        _ => None,
    }
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let caps = HEADING.captures(line)?;
    let level = caps.get(1)?.as_str().len() as u8;
    let text = caps.get(2)?.as_str().to_string();
    Some((level, text))
}
