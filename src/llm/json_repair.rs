// src/llm/json_repair.rs
// Extracts and repairs JSON from free-form LLM output. The pure path runs
// first (region extraction, comment/trailing-comma stripping); the router
// adds one LLM-assisted attempt on top when this fails.

use serde_json::Value;

/// Heuristic: does a reply plausibly contain JSON worth extracting?
pub fn looks_like_json(text: &str) -> bool {
    if text.contains("```json") {
        return true;
    }
    (text.contains('{') && text.contains('}')) || (text.contains('[') && text.contains(']'))
}

/// Best-effort parse of `input` into a JSON value.
///
/// Order: direct parse, fenced-block extraction, first balanced region,
/// then the same with comments and trailing commas stripped. Returns
/// `None` when nothing parseable is found; callers fall back to raw text.
pub fn repair(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let region = extract_json_region(input)?;
    if let Ok(value) = serde_json::from_str(&region) {
        return Some(value);
    }

    let cleaned = strip_trailing_commas(&strip_line_comments(&region));
    serde_json::from_str(&cleaned).ok()
}

/// Pull the JSON region out of surrounding prose: a fenced block wins,
/// otherwise the first balanced `{…}` or `[…]`.
pub fn extract_json_region(input: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced_block(input) {
        return Some(fenced);
    }
    extract_balanced(input)
}

fn extract_fenced_block(input: &str) -> Option<String> {
    let start = input.find("```json").map(|i| i + "```json".len()).or_else(|| {
        // A bare fence also counts if its body starts like JSON
        input.find("```").map(|i| i + 3)
    })?;
    let rest = &input[start..];
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    if body.starts_with('{') || body.starts_with('[') {
        Some(body.to_string())
    } else {
        None
    }
}

/// String-aware balance scan from the first opening bracket.
fn extract_balanced(input: &str) -> Option<String> {
    let open = input.find(['{', '['])?;
    let bytes: Vec<char> = input[open..].chars().collect();
    let (open_ch, close_ch) = if bytes[0] == '{' { ('{', '}') } else { ('[', ']') };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open_ch => depth += 1,
            c if c == close_ch => {
                depth -= 1;
                if depth == 0 {
                    return Some(bytes[..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove `//` line comments outside of strings.
fn strip_line_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        out.push(ch);
        i += 1;
    }
    out
}

/// Remove commas that directly precede a closing bracket.
fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            continue;
        }
        if ch == ',' {
            let next_significant = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next_significant, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}
