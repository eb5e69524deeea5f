//! Defensive interpretation of free-text model output.
//!
//! Models are asked for JSON but routinely wrap it in Markdown fences, add
//! prose, or ignore the format entirely. Every function here returns a usable
//! value for any input; the fallback table is:
//!
//! | input                          | decision            | draft                          |
//! |--------------------------------|---------------------|--------------------------------|
//! | not JSON                       | ONGOING, no score   | whole text is the body         |
//! | status contains SUCCESS / PASS | SUCCESS             |                                |
//! | status contains FAIL           | FAILURE             |                                |
//! | unparsable score               | 90 / 35             |                                |
//! | missing subject                |                     | status-dependent subject       |
//! | empty body                     |                     | status-dependent canned text   |
//! | body without block tags        |                     | one `<p>` per line, wrapped    |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::ChallengeStatus;

pub const DEFAULT_SUCCESS_SCORE: u8 = 90;
pub const DEFAULT_FAILURE_SCORE: u8 = 35;
pub const HOOK_FALLBACK_SUBJECT: &str = "Quick request";

static BLOCK_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)<\s*/?\s*(html|body|p|div|br|hr|ul|ol|li|table|thead|tbody|tr|td|th|h[1-6]|blockquote|pre|section|article|header|footer)\b",
    )
    .expect("block tag pattern is valid")
});

/// Outcome classification produced by the decision stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub status: ChallengeStatus,
    /// `None` iff `status` is ONGOING.
    pub score: Option<u8>,
}

/// Subject and HTML body produced by a writer stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftedEmail {
    pub subject: String,
    pub body: String,
}

/// Remove Markdown code fences, keeping the first fenced block. A language
/// tag on the opening fence (```` ```json ````) is dropped.
pub fn strip_code_fences(content: &str) -> String {
    let cleaned = content.trim();
    if !cleaned.contains("```") {
        return cleaned.to_string();
    }
    let inner = cleaned.split("```").nth(1).unwrap_or("");
    let inner = match inner.split_once('\n') {
        Some((tag, rest)) if is_language_tag(tag) => rest,
        _ => inner,
    };
    inner.trim().to_string()
}

fn is_language_tag(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_object(cleaned: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn text_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        map.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

fn classify_status(raw: Option<&Value>) -> ChallengeStatus {
    let raw = match raw {
        Some(Value::String(s)) => s.to_uppercase(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string().to_uppercase(),
    };
    if raw.contains("SUCCESS") || raw.contains("PASS") {
        ChallengeStatus::Success
    } else if raw.contains("FAIL") {
        ChallengeStatus::Failure
    } else {
        ChallengeStatus::Ongoing
    }
}

fn integer_score(raw: Option<&Value>) -> Option<i64> {
    match raw? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Interpret decision-stage output as `{status, score}`.
pub fn parse_decision(content: &str) -> Decision {
    let parsed = parse_object(&strip_code_fences(content)).unwrap_or_default();
    let status = classify_status(parsed.get("status"));
    let score = match status {
        ChallengeStatus::Ongoing => None,
        terminal => {
            let fallback = if terminal == ChallengeStatus::Success {
                DEFAULT_SUCCESS_SCORE
            } else {
                DEFAULT_FAILURE_SCORE
            };
            Some(
                integer_score(parsed.get("score"))
                    .map(|v| v.clamp(0, 100) as u8)
                    .unwrap_or(fallback),
            )
        }
    };
    Decision { status, score }
}

pub fn fallback_subject(status: ChallengeStatus) -> &'static str {
    match status {
        ChallengeStatus::Success => "Training completed successfully",
        ChallengeStatus::Failure => "Training outcome and next steps",
        ChallengeStatus::Ongoing => "Continuing your training challenge",
    }
}

pub fn canned_body(status: ChallengeStatus) -> &'static str {
    match status {
        ChallengeStatus::Success => {
            "Great job completing this phishing awareness step. You recognized the threat and stayed safe."
        }
        ChallengeStatus::Failure => {
            "The last action compromised the training scenario. Review the warning signs and expect a follow-up with remediation steps."
        }
        ChallengeStatus::Ongoing => {
            "Let's keep going. Please review the situation and reply with your next action."
        }
    }
}

/// Interpret writer-stage output as `{subject, body}` with an HTML body.
pub fn parse_draft(content: &str, status: ChallengeStatus) -> DraftedEmail {
    let cleaned = strip_code_fences(content);
    let (subject, body) = match parse_object(&cleaned) {
        Some(map) => (
            text_field(&map, &["subject", "title"]),
            text_field(&map, &["body", "message"]),
        ),
        None => (None, Some(cleaned.trim().to_string())),
    };
    let body = body
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| canned_body(status).to_string());
    DraftedEmail {
        subject: subject.unwrap_or_else(|| fallback_subject(status).to_string()),
        body: ensure_html(&body),
    }
}

/// Interpret hook-writer output. Same rules as [`parse_draft`] with `html`
/// accepted as a body alias and no canned body.
pub fn parse_hook_draft(content: &str) -> DraftedEmail {
    let cleaned = strip_code_fences(content);
    let (subject, body) = match parse_object(&cleaned) {
        Some(map) => (
            text_field(&map, &["subject", "title"]),
            text_field(&map, &["body", "html"]),
        ),
        None => (None, Some(cleaned)),
    };
    DraftedEmail {
        subject: subject.unwrap_or_else(|| HOOK_FALLBACK_SUBJECT.to_string()),
        body: ensure_html(body.as_deref().unwrap_or("")),
    }
}

pub fn has_block_tag(body: &str) -> bool {
    BLOCK_TAG_RE.is_match(body)
}

/// Pass HTML through; turn plain text into one paragraph per non-blank line
/// inside a minimal document.
pub fn ensure_html(body: &str) -> String {
    if has_block_tag(body) {
        return body.to_string();
    }
    let paragraphs: String = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("<p>{line}</p>"))
        .collect();
    if paragraphs.is_empty() {
        return "<html><body><p></p></body></html>".to_string();
    }
    format!("<html><body>{paragraphs}</body></html>")
}
