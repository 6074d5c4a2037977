use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stylization look offered by the wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Theme {
    BaseballCard,
    Superhero,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::BaseballCard => "baseball-card",
            Theme::Superhero => "superhero",
        }
    }

    /// Expand a theme plus the visitor-supplied pet details into the prompt
    /// sent to the image provider.
    pub fn prompt_for(&self, pet_details: &str) -> String {
        let details = pet_details.trim();
        match self {
            Theme::BaseballCard => format!(
                "A vintage baseball trading card portrait of {details}, heroic pose, \
                 stadium backdrop, card border and team typography, warm print grain"
            ),
            Theme::Superhero => format!(
                "A dynamic comic-book superhero portrait of {details}, caped costume, \
                 dramatic city skyline, bold ink lines and halftone shading"
            ),
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "baseball-card" | "baseball_card" | "baseball" => Ok(Theme::BaseballCard),
            "superhero" | "super-hero" => Ok(Theme::Superhero),
            other => Err(anyhow::anyhow!(
                "unknown theme '{other}' (expected baseball-card or superhero)"
            )),
        }
    }
}

/// One image payload extracted from a generation response, before any bytes
/// are fetched or decoded.
///
/// Providers return images in wildly different shapes: a bare URL string, an
/// array of URLs, `{"data": [{"b64_json": ...}]}`, data URLs, nested
/// `output`/`images` objects. All of that variance is normalized here, at the
/// boundary, into this tagged union; downstream code never inspects raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedPayload {
    /// Raw base64 image bytes.
    Base64(String),
    /// `data:<mime>;base64,<data>` URL, split into parts.
    DataUrl { mime: String, data: String },
    /// HTTP(S) URL to download.
    Url(String),
}

/// Base64 payloads shorter than this are assumed to be stray strings, not
/// image data.
const MIN_BASE64_PAYLOAD_CHARS: usize = 64;

/// Walk a generation response and collect every image payload it carries.
///
/// Errors only when the response contains no recognizable payload at all; a
/// response mixing recognizable and junk values yields the recognizable ones.
pub fn normalize_generation_output(payload: &Value) -> Result<Vec<GeneratedPayload>> {
    let mut out = Vec::new();
    collect_payloads(payload, &mut out);
    if out.is_empty() {
        bail!("generation response contained no image payloads");
    }
    Ok(out)
}

fn collect_payloads(value: &Value, out: &mut Vec<GeneratedPayload>) {
    match value {
        Value::String(raw) => push_string_payload(raw, out),
        Value::Array(rows) => {
            for row in rows {
                collect_payloads(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["b64_json", "base64", "image_base64"] {
                if let Some(Value::String(raw)) = obj.get(key) {
                    let trimmed = raw.trim();
                    if !trimmed.is_empty() {
                        out.push(GeneratedPayload::Base64(trimmed.to_string()));
                    }
                }
            }
            for key in ["url", "image_url", "data", "images", "image", "output", "artifacts"] {
                if let Some(nested) = obj.get(key) {
                    collect_payloads(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn push_string_payload(raw: &str, out: &mut Vec<GeneratedPayload>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    if let Some(rest) = trimmed.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            if !data.is_empty() {
                out.push(GeneratedPayload::DataUrl {
                    mime: mime.to_string(),
                    data: data.to_string(),
                });
            }
        }
        return;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let duplicate = out
            .iter()
            .any(|existing| matches!(existing, GeneratedPayload::Url(url) if url == trimmed));
        if !duplicate {
            out.push(GeneratedPayload::Url(trimmed.to_string()));
        }
        return;
    }
    if trimmed.len() >= MIN_BASE64_PAYLOAD_CHARS && looks_like_base64(trimmed) {
        out.push(GeneratedPayload::Base64(trimmed.to_string()));
    }
}

fn looks_like_base64(raw: &str) -> bool {
    raw.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\n' | b'\r'))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalizes_openai_b64_json_rows() {
        let payload = json!({
            "created": 1,
            "data": [
                {"b64_json": "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWZnaGlqa2xtbm9wcXJzdHV2d3h5ejAxMjM0NTY3ODk="},
                {"b64_json": "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXpBQkNERUZHSElKS0xNTk9QUVJTVFVWV1hZWjAxMjM0NTY3ODk="}
            ]
        });
        let payloads = normalize_generation_output(&payload).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(matches!(payloads[0], GeneratedPayload::Base64(_)));
    }

    #[test]
    fn normalizes_bare_and_nested_urls_with_dedup() {
        let payload = json!({
            "output": [
                "https://cdn.example.com/a.png",
                {"url": "https://cdn.example.com/b.png"},
                {"images": [{"url": "https://cdn.example.com/a.png"}]}
            ]
        });
        let payloads = normalize_generation_output(&payload).unwrap();
        assert_eq!(
            payloads,
            vec![
                GeneratedPayload::Url("https://cdn.example.com/a.png".to_string()),
                GeneratedPayload::Url("https://cdn.example.com/b.png".to_string()),
            ]
        );
    }

    #[test]
    fn normalizes_data_urls() {
        let payload = json!("data:image/png;base64,aGVsbG8=");
        let payloads = normalize_generation_output(&payload).unwrap();
        assert_eq!(
            payloads,
            vec![GeneratedPayload::DataUrl {
                mime: "image/png".to_string(),
                data: "aGVsbG8=".to_string(),
            }]
        );
    }

    #[test]
    fn short_strings_are_not_mistaken_for_base64() {
        let payload = json!({"data": ["ok"], "status": "succeeded"});
        assert!(normalize_generation_output(&payload).is_err());
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(normalize_generation_output(&json!({"status": "failed"})).is_err());
        assert!(normalize_generation_output(&json!(null)).is_err());
    }

    #[test]
    fn theme_prompts_mention_pet_details() {
        let prompt = Theme::BaseballCard.prompt_for("a corgi named Biscuit");
        assert!(prompt.contains("a corgi named Biscuit"));
        assert!(prompt.contains("baseball"));
        let prompt = Theme::Superhero.prompt_for("a tabby cat");
        assert!(prompt.contains("a tabby cat"));
    }

    #[test]
    fn theme_parses_kebab_case() {
        assert_eq!("baseball-card".parse::<Theme>().unwrap(), Theme::BaseballCard);
        assert_eq!("superhero".parse::<Theme>().unwrap(), Theme::Superhero);
        assert!("watercolor".parse::<Theme>().is_err());
    }
}
