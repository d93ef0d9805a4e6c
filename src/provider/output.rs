//! Pull structured content out of model output
//!
//! Models wrap answers in markdown fences or surround them with prose;
//! these helpers find the payload.

use serde_json::Value;

/// Extract JSON from text, handling fenced blocks and surrounding prose
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = extract_code_block(text, &["json"])
        && let Ok(json) = serde_json::from_str(&block)
    {
        return Some(json);
    }

    if let Some(block) = extract_code_block(text, &[""])
        && let Ok(json) = serde_json::from_str(&block)
    {
        return Some(json);
    }

    if let Ok(json) = serde_json::from_str(text.trim()) {
        return Some(json);
    }

    find_json_in_text(text)
}

/// Contents of the first fenced block tagged with one of `langs`
///
/// An empty string in `langs` matches an untagged fence.
pub fn extract_code_block(text: &str, langs: &[&str]) -> Option<String> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let line_end = after_fence.find('\n')?;
        let tag = after_fence[..line_end].trim();
        let body = &after_fence[line_end + 1..];
        let end = body.find("```")?;

        if langs.iter().any(|l| l.eq_ignore_ascii_case(tag)) {
            return Some(body[..end].trim().to_string());
        }
        rest = &body[end + 3..];
    }
    None
}

fn find_json_in_text(text: &str) -> Option<Value> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = text.find(open)
            && let Some(json) = try_parse_from_position(text, start, open, close)
        {
            return Some(json);
        }
    }
    None
}

/// Scan for the balanced end of a JSON value, skipping string contents
fn try_parse_from_position(text: &str, start: usize, open: char, close: char) -> Option<Value> {
    let remaining = &text[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in remaining.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return serde_json::from_str(&remaining[..i + c.len_utf8()]).ok();
                }
            }
            _ => {}
        }
    }
    None
}
