//! Telegram MarkdownV2 escaping.
//!
//! Producers escape their text before handing it to the outbox; the outbox and
//! the transport never touch the markup.

/// Characters that must be backslash-escaped anywhere outside code entities.
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    '\\',
];

/// Escape free text for MarkdownV2.
#[must_use]
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Escape the body of a `pre`/`code` entity. Only `` ` `` and `\` are special there.
#[must_use]
pub fn escape_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '`' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Bold heading followed by a fenced JSON block, e.g.
///
/// ```text
/// Insert *orders*:
/// ```json
/// { ... }
/// ```
/// ```
#[must_use]
pub fn json_block(heading: &str, subject: &str, body: &str) -> String {
    format!(
        "{} *{}*:\n```json\n{}\n```\n",
        escape_markdown_v2(heading),
        escape_markdown_v2(subject),
        escape_code(body)
    )
}

/// A bare fenced JSON block without heading.
#[must_use]
pub fn bare_json_block(body: &str) -> String {
    format!("```json\n{}\n```\n", escape_code(body))
}
