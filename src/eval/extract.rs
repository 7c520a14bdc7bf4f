use std::sync::LazyLock;

use regex::Regex;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").expect("fenced block pattern is valid")
});

/// Pull the candidate document out of raw generator output.
///
/// Content of the first fenced code block wins over surrounding prose. Within
/// it, the first balanced `{...}` object is returned, honouring string
/// literals and escapes. Without an opening brace the trimmed text comes back
/// as-is; an unbalanced object runs to the end of the text. Either way the
/// syntax layer decides what to make of it.
pub fn extract_document(raw: &str) -> &str {
    let text = FENCED_BLOCK
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map(|block| block.as_str())
        .filter(|block| block.contains('{'))
        .unwrap_or(raw);

    let Some(start) = text.find('{') else {
        return text.trim();
    };

    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, character) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match character {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[start..=start + offset];
                }
            }
            _ => {}
        }
    }

    &text[start..]
}
