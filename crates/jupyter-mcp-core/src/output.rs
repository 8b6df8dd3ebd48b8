//! Cell outputs, their construction from kernel messages, and their rendering
//! into tool-call content blocks.

use std::sync::LazyLock;

use jupyter_protocol::{JupyterMessageContent, Media};
use regex_lite::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type MimeBundle = Map<String, Value>;

/// One nbformat v4 output entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum CellOutput {
    Stream {
        name: String,
        #[serde(deserialize_with = "multiline")]
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    ExecuteResult {
        #[serde(default)]
        execution_count: Option<i64>,
        data: MimeBundle,
        #[serde(default)]
        metadata: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

/// nbformat multiline strings: either one string or a list of lines.
pub(crate) fn multiline<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        One(String),
        Lines(Vec<String>),
    }
    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::One(s) => s,
        Multiline::Lines(lines) => lines.concat(),
    })
}

fn bundle(media: &Media) -> MimeBundle {
    match serde_json::to_value(media) {
        Ok(Value::Object(map)) => map,
        _ => MimeBundle::new(),
    }
}

fn wire_name<T: Serialize>(value: &T, fallback: &str) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| fallback.to_string())
}

impl CellOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        CellOutput::Stream {
            name: "stdout".into(),
            text: text.into(),
        }
    }

    /// The output a kernel message contributes, if it is an output message.
    pub fn from_content(content: &JupyterMessageContent) -> Option<Self> {
        match content {
            JupyterMessageContent::StreamContent(stream) => Some(CellOutput::Stream {
                name: wire_name(&stream.name, "stdout"),
                text: stream.text.clone(),
            }),
            JupyterMessageContent::DisplayData(display) => Some(CellOutput::DisplayData {
                data: bundle(&display.data),
                metadata: display.metadata.clone(),
            }),
            JupyterMessageContent::ExecuteResult(result) => Some(CellOutput::ExecuteResult {
                execution_count: Some(result.execution_count.0 as i64),
                data: bundle(&result.data),
                metadata: result.metadata.clone(),
            }),
            JupyterMessageContent::ErrorOutput(error) => Some(CellOutput::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellOutput::Error { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A piece of a tool-call result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Image { .. } => None,
        }
    }
}

static ANSI: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").ok());

pub fn strip_ansi(text: &str) -> String {
    match ANSI.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

fn mime_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
        other => other.to_string(),
    }
}

fn render_bundle(kind: &str, data: &MimeBundle, allow_images: bool) -> ContentBlock {
    if let Some(png) = data.get("image/png") {
        return if allow_images {
            ContentBlock::Image {
                data: mime_text(png).replace('\n', ""),
                mime_type: "image/png".into(),
            }
        } else {
            ContentBlock::text("[Image Output (PNG) - Image display disabled]")
        };
    }
    if let Some(plain) = data.get("text/plain") {
        return ContentBlock::text(strip_ansi(&mime_text(plain)));
    }
    if data.contains_key("text/html") {
        return ContentBlock::text("[HTML Output]");
    }
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    ContentBlock::text(format!("[{kind} Data: keys={keys:?}]"))
}

/// Renders an output for a reader: ANSI colours stripped, images inlined
/// when allowed.
pub fn render(output: &CellOutput, allow_images: bool) -> ContentBlock {
    match output {
        CellOutput::Stream { text, .. } => ContentBlock::text(strip_ansi(text)),
        CellOutput::DisplayData { data, .. } => render_bundle("display_data", data, allow_images),
        CellOutput::ExecuteResult { data, .. } => render_bundle("execute_result", data, allow_images),
        CellOutput::Error {
            ename,
            evalue,
            traceback,
        } => {
            if traceback.is_empty() {
                ContentBlock::text(format!("{ename}: {evalue}"))
            } else {
                let lines: Vec<String> = traceback.iter().map(|line| strip_ansi(line)).collect();
                ContentBlock::text(lines.join("\n"))
            }
        }
    }
}

/// Renders outputs in order, dropping empty text.
pub fn render_all(outputs: &[CellOutput], allow_images: bool) -> Vec<ContentBlock> {
    outputs
        .iter()
        .map(|output| render(output, allow_images))
        .filter(|block| block.as_text().map_or(true, |text| !text.is_empty()))
        .collect()
}
