//! Prompt envelope formatting and reply cleanup.

use std::sync::LazyLock;

use chrono::SecondsFormat;
use regex::Regex;

use crate::store::StoredMessage;

static INTERNAL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(internal|thinking)>.*?</(internal|thinking)>").expect("static regex")
});

static INTERNAL_TRAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<(internal|thinking)>.*$").expect("static regex"));

/// Format a batch of inbound messages into the prompt envelope the container
/// consumes: one `<message>` element per inbound message, sender and
/// timestamp as attributes, oldest first.
pub fn format_prompt(messages: &[StoredMessage]) -> String {
    let mut out = String::from("<messages>\n");
    for message in messages {
        out.push_str(&format!(
            "  <message sender=\"{}\" timestamp=\"{}\">{}</message>\n",
            escape_xml(&message.sender),
            message
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            escape_xml(&message.content),
        ));
    }
    out.push_str("</messages>");
    out
}

/// Strip agent-internal reasoning spans from a reply before it reaches the
/// chat. Unclosed trailing markers (truncated output) are dropped too.
pub fn strip_internal_markers(text: &str) -> String {
    let without_blocks = INTERNAL_BLOCK.replace_all(text, "");
    let cleaned = INTERNAL_TRAILING.replace_all(&without_blocks, "");
    cleaned.trim().to_string()
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
