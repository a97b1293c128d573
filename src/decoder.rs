//! Artifact extraction from structurally unstable provider payloads.
//!
//! A finished job may carry its artifact as a bare URL string, `{url}`,
//! `{file: {url}}`, a list of such objects, nested under a `data`/`output`
//! wrapper, or merged into a proxy `{success, ...}` envelope. The
//! [`ResultDecoder`] tries an ordered list of extractors over the JSON tree and
//! the first one that finds something wins. Supporting a new provider shape means
//! adding an entry to [`DEFAULT_EXTRACTORS`].

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of file a capability produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Model3d,
    Audio,
    Weights,
}

impl MediaKind {
    /// Field names providers use for this media type, most specific first.
    fn fields(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &["image", "images"],
            MediaKind::Video => &["video", "videos"],
            MediaKind::Model3d => &["model_mesh", "model_glb", "glb", "mesh", "model", "model_urls"],
            MediaKind::Audio => &["audio", "audio_file", "music"],
            MediaKind::Weights => &["diffusers_lora_file", "lora_file", "weights"],
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &[".png", ".jpg", ".jpeg", ".webp", ".gif"],
            MediaKind::Video => &[".mp4", ".webm", ".mov"],
            MediaKind::Model3d => &[".glb", ".gltf", ".obj", ".fbx", ".usdz"],
            MediaKind::Audio => &[".mp3", ".wav", ".ogg", ".flac", ".m4a"],
            MediaKind::Weights => &[".safetensors", ".ckpt", ".bin"],
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &["image"],
            MediaKind::Video => &["video"],
            MediaKind::Model3d => &["model", "mesh"],
            MediaKind::Audio => &["audio", "music"],
            MediaKind::Weights => &["lora", "weights"],
        }
    }

    /// Whether a URL's file name hints at this media type. Host and directory
    /// segments are ignored: they name the model, not the output.
    fn matches_hint(self, candidate: &str) -> bool {
        let Ok(url) = Url::parse(candidate) else {
            return false;
        };
        let path = url.path().to_ascii_lowercase();
        let file_name = path.rsplit('/').next().unwrap_or_default();
        self.extensions().iter().any(|ext| file_name.ends_with(ext))
            || self.keywords().iter().any(|kw| file_name.contains(kw))
    }
}

// Generic fields tried after the media-specific ones.
const COMMON_FIELDS: &[&str] = &["url", "file", "output_url", "artifact"];

// Queue bookkeeping links; they point at the provider, never at an output.
const CONTROL_URL_FIELDS: &[&str] = &["response_url", "status_url", "cancel_url", "logs_url"];

// One level of wrapping, including the backend proxy's `{success, data}` envelope.
const WRAPPER_FIELDS: &[&str] = &["data", "output", "result"];

/// An extractor returns the artifact URLs it found, or `None`.
pub type Extractor = fn(&Value, MediaKind) -> Option<Vec<String>>;

/// Extractors in the order they are tried.
pub const DEFAULT_EXTRACTORS: &[(&str, Extractor)] = &[
    ("direct", extract_direct),
    ("wrapped", extract_wrapped),
    ("structural_search", extract_by_search),
];

/// Collect URL strings from a node shaped like `"..."`, `{url}`, `{file: ...}`
/// or a list of those.
fn urls_from(node: &Value) -> Option<Vec<String>> {
    let urls: Vec<String> = match node {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Object(map) => {
            if let Some(Value::String(url)) = map.get("url") {
                vec![url.trim().to_string()]
            } else if let Some(file) = map.get("file") {
                return urls_from(file);
            } else {
                return None;
            }
        }
        Value::Array(items) => items.iter().filter_map(urls_from).flatten().collect(),
        _ => return None,
    };
    if urls.is_empty() { None } else { Some(urls) }
}

/// Known field paths at the root, or the root itself when it is a string/list.
pub fn extract_direct(root: &Value, kind: MediaKind) -> Option<Vec<String>> {
    match root {
        Value::String(_) | Value::Array(_) => urls_from(root),
        Value::Object(map) => kind
            .fields()
            .iter()
            .chain(COMMON_FIELDS)
            .filter_map(|field| map.get(*field))
            .find_map(urls_from),
        _ => None,
    }
}

/// Same as [`extract_direct`] after unwrapping one `data`/`output`/`result` level.
pub fn extract_wrapped(root: &Value, kind: MediaKind) -> Option<Vec<String>> {
    let map = root.as_object()?;
    WRAPPER_FIELDS
        .iter()
        .filter_map(|field| map.get(*field))
        .find_map(|inner| extract_direct(inner, kind))
}

/// Depth-first search (depth ≤ 3) for an http(s) string hinting at the media type.
pub fn extract_by_search(root: &Value, kind: MediaKind) -> Option<Vec<String>> {
    search(root, kind, 0).map(|url| vec![url])
}

const MAX_SEARCH_DEPTH: usize = 3;

fn search(node: &Value, kind: MediaKind, depth: usize) -> Option<String> {
    match node {
        Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            let is_http = lower.starts_with("http://") || lower.starts_with("https://");
            (is_http && kind.matches_hint(s)).then(|| s.clone())
        }
        _ if depth >= MAX_SEARCH_DEPTH => None,
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| !CONTROL_URL_FIELDS.contains(&key.as_str()))
            .find_map(|(_, v)| search(v, kind, depth + 1)),
        Value::Array(items) => items.iter().find_map(|v| search(v, kind, depth + 1)),
        _ => None,
    }
}

/// A decoded job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub media: MediaKind,
    pub urls: Vec<String>,
}

impl Artifact {
    /// The first (main) artifact URL.
    pub fn primary(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Nothing usable was found. `excerpt` is a size-capped copy of the payload
    /// for logs; it must never be shown to end users.
    #[error("no artifact found ({reason}); payload: {excerpt}")]
    NoArtifactFound { reason: String, excerpt: String },

    #[error("response is not JSON (content-type: {content_type})")]
    NotJson { content_type: String },
}

/// Parse a raw response body, refusing anything that is not JSON (HTML error
/// pages from a CDN, plain-text gateway errors, ...).
pub fn parse_json_body(content_type: Option<&str>, body: &[u8]) -> Result<Value, DecodeError> {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    let trimmed = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &body[start..])
        .unwrap_or_default();

    let not_json = || DecodeError::NotJson {
        content_type: if content_type.is_empty() {
            "unknown".into()
        } else {
            content_type.clone()
        },
    };

    let looks_like_markup = trimmed.first() == Some(&b'<');
    let declared_other = !content_type.is_empty() && !content_type.contains("json");
    if looks_like_markup || declared_other {
        return Err(not_json());
    }

    serde_json::from_slice(trimmed).map_err(|_| not_json())
}

/// Truncate a payload rendering to `limit` bytes on a char boundary.
pub fn excerpt(value: &Value, limit: usize) -> String {
    let rendered = value.to_string();
    if rendered.len() <= limit {
        return rendered;
    }
    let mut end = limit;
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &rendered[..end])
}

pub struct ResultDecoder {
    extractors: Vec<(&'static str, Extractor)>,
    excerpt_limit: usize,
}

impl Default for ResultDecoder {
    fn default() -> Self {
        Self {
            extractors: DEFAULT_EXTRACTORS.to_vec(),
            excerpt_limit: 512,
        }
    }
}

impl ResultDecoder {
    pub fn with_extractors(extractors: Vec<(&'static str, Extractor)>) -> Self {
        Self {
            extractors,
            ..Default::default()
        }
    }

    pub fn decode(&self, raw: &Value, kind: MediaKind) -> Result<Artifact, DecodeError> {
        let found = self
            .extractors
            .iter()
            .find_map(|(name, extract)| extract(raw, kind).map(|urls| (*name, urls)));

        let Some((extractor, urls)) = found else {
            return Err(self.not_found(raw, "no extractor matched"));
        };

        for url in &urls {
            if !is_absolute_http_url(url) {
                tracing::debug!(extractor, url = %url, "Extracted value is not an absolute URL");
                return Err(self.not_found(raw, "malformed artifact URL"));
            }
        }

        tracing::debug!(extractor, count = urls.len(), "Decoded artifact");
        Ok(Artifact { media: kind, urls })
    }

    fn not_found(&self, raw: &Value, reason: &str) -> DecodeError {
        DecodeError::NoArtifactFound {
            reason: reason.to_string(),
            excerpt: excerpt(raw, self.excerpt_limit),
        }
    }
}

fn is_absolute_http_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}
