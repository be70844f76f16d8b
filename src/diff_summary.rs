//! Turns a unified diff into a short retrieval query.
//!
//! The summary names the changed files, then walks each hunk collecting the
//! hunk's trailing context, enclosing definitions, and the added and removed
//! lines with a little surrounding context. Collection stops once the
//! running summary is longer than the limit, and the result is cut back to
//! the last word boundary within it.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::collector::diff_header_paths;

/// Changed lines collected per hunk.
const MAX_LINES_PER_HUNK: usize = 15;
/// Unchanged lines shown before a change.
const CONTEXT_WINDOW: usize = 2;
/// Lines searched above a hunk header for an enclosing definition.
const DEFINITION_LOOKBACK: usize = 5;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@(.*)$").expect("valid hunk header regex")
});

static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:pub(?:\([^)]*\))?|async|export)\s+)*(def|class|fn|struct|enum|trait|impl|function|func|interface)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid definition regex")
});

/// Builds a summary while tracking its joined length in characters.
struct Summary {
    parts: Vec<String>,
    len: usize,
}

impl Summary {
    fn push(&mut self, part: String) {
        if !self.parts.is_empty() {
            self.len += 1;
        }
        self.len += part.chars().count();
        self.parts.push(part);
    }

    /// Whether one of the last two fragments records a change.
    fn follows_change(&self) -> bool {
        self.parts
            .iter()
            .rev()
            .take(2)
            .any(|p| p.starts_with("Added:") || p.starts_with("Removed:"))
    }
}

/// `(kind, name)` of a definition on `line`, ignoring any diff marker.
fn definition(line: &str) -> Option<(String, String)> {
    let code = line
        .strip_prefix(|c: char| c == '+' || c == '-' || c == ' ')
        .unwrap_or(line);
    DEFINITION_RE
        .captures(code)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

fn is_context(line: &str) -> bool {
    line.starts_with(' ')
}

/// Summarize `diff` into at most `max_len` characters.
pub fn extract_diff_summary(diff: &str, max_len: usize) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    let mut summary = Summary {
        parts: Vec::new(),
        len: 0,
    };

    let changed: Vec<String> = lines
        .iter()
        .filter_map(|line| diff_header_paths(line))
        .map(|(_, new)| format!("File changed: {}", new))
        .collect();
    if !changed.is_empty() {
        summary.push(format!("Changes in files: {}", changed.join(", ")));
    }

    let mut emitted_context: HashSet<usize> = HashSet::new();
    let mut hunk_lines = 0usize;

    for (i, line) in lines.iter().enumerate() {
        if summary.len > max_len {
            break;
        }

        if let Some(caps) = HUNK_HEADER_RE.captures(line) {
            let trailing = caps[1].trim();
            if !trailing.is_empty() {
                summary.push(format!("Change context: {}", trailing));
            }
            hunk_lines = 0;
            if let Some((kind, name)) = lines[i.saturating_sub(DEFINITION_LOOKBACK)..i]
                .iter()
                .find_map(|l| definition(l))
            {
                summary.push(format!("In {} {}:", kind, name));
            }
            continue;
        }

        let added = line.starts_with('+') && !line.starts_with("+++");
        let removed = line.starts_with('-') && !line.starts_with("---");

        if (added || removed) && hunk_lines < MAX_LINES_PER_HUNK {
            for k in i.saturating_sub(CONTEXT_WINDOW)..i {
                if is_context(lines[k]) && emitted_context.insert(k) {
                    summary.push(lines[k].trim().to_string());
                }
            }
            let label = if added { "Added" } else { "Removed" };
            summary.push(format!("{}: {}", label, line[1..].trim()));
            hunk_lines += 1;
        } else if is_context(line)
            && hunk_lines < MAX_LINES_PER_HUNK
            && summary.follows_change()
            && emitted_context.insert(i)
        {
            summary.push(line.trim().to_string());
        }

        if hunk_lines < MAX_LINES_PER_HUNK {
            if let Some((kind, name)) = definition(line) {
                summary.push(format!("Context: {} {}", kind, name));
            }
        }
    }

    truncate_at_word(summary.parts.join(" "), max_len)
}

/// Cut `text` to at most `max_len` characters, preferring the last space.
fn truncate_at_word(text: String, max_len: usize) -> String {
    let limit = match text.char_indices().nth(max_len) {
        Some((byte, _)) => byte,
        None => return text,
    };
    match text[..limit].rfind(' ') {
        Some(space) => text[..space].to_string(),
        None => text[..limit].to_string(),
    }
}
