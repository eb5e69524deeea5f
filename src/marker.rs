//! Challenge marker embedded in outbound HTML.
//!
//! Every outbound body carries a zero-visibility span holding
//! `data-pac-challenge-id="<uuid>"`. Mail clients quote the original HTML in
//! replies, which is how an inbound message finds its way back to a challenge.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

pub const MARKER_ATTRIBUTE: &str = "data-pac-challenge-id";

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"data-pac-challenge-id="([^"]+)""#).expect("marker pattern is valid")
});

/// Append the hidden marker span unless this exact marker is already present.
pub fn inject(html: Option<&str>, challenge_id: Uuid) -> String {
    let marker = format!("{MARKER_ATTRIBUTE}=\"{challenge_id}\"");
    let html = html.unwrap_or("");
    if html.contains(&marker) {
        return html.to_string();
    }
    format!(
        "{html}<span {marker} style=\"display:none; color:transparent; font-size:0;\" aria-hidden=\"true\">.</span>"
    )
}

/// Raw text of the first marker found in `html`.
pub fn extract(html: Option<&str>) -> Option<String> {
    let caps = MARKER_RE.captures(html?)?;
    let value = caps.get(1)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// First marker that parses as a challenge id.
pub fn extract_challenge_id(html: Option<&str>) -> Option<Uuid> {
    extract(html).and_then(|raw| Uuid::parse_str(&raw).ok())
}
