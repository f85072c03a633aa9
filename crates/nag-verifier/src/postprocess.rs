/// Clean-up of model output into the fixed verification format.
use std::sync::LazyLock;

use regex::Regex;

const DEFAULT_VERIFICATION: &str = "Verification: Please review diagnosis to ensure its intended";

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*\*{1,2}\s*(Verification|Guideline Used|Confidence Score|Explanation|Citation)\s*\*{1,2}\s*:",
    )
    .expect("valid regex")
});

static VERIFICATION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Verification\s*:").expect("valid regex"));

static VERIFICATION_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:\*{1,2}\s*)?verification(?:\s*\*{1,2})?\s*:\s*(.+)$")
        .expect("valid regex")
});

/// Strip markdown emphasis around field labels: `**Verification**:` becomes `Verification:`.
pub fn normalize_labels(text: &str) -> String {
    LABEL_RE.replace_all(text, "${1}:").into_owned()
}

/// Normalize labels and guarantee exactly one populated Verification line.
///
/// When the model repeats the line only the last one is kept; when it omits it a
/// "Please review" verdict is prepended.
pub fn ensure_verification_line(text: &str) -> String {
    let normalized = normalize_labels(text);

    let deduped = {
        let lines: Vec<&str> = normalized.lines().collect();
        let verification_idxs: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| VERIFICATION_LINE_RE.is_match(line))
            .map(|(i, _)| i)
            .collect();

        match verification_idxs.last() {
            Some(&keep) if verification_idxs.len() > 1 => Some(
                lines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i == keep || !verification_idxs.contains(i))
                    .map(|(_, line)| *line)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    };
    let text = deduped.unwrap_or(normalized);

    if VERIFICATION_VALUE_RE.is_match(&text) {
        text
    } else {
        format!("{DEFAULT_VERIFICATION}\n{text}")
    }
}
