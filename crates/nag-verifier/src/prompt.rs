/// Grounding prompt assembly for the verification model.
use serde_json::Value;

use crate::model::Candidate;

/// Snippets longer than this many characters are cut.
const MAX_SNIPPET_CHARS: usize = 700;

pub const SYSTEM_PRIMER: &str = "You are SmartPharma Verification System.\n\
Goal: judge whether the diagnosis/indication aligns with Malaysian NAG evidence and standard antimicrobial practice.\n\
\n\
OUTPUT (max 6 lines, no markdown/bullets, no extra text):\n\
Verification: Diagnosis is accurate / Diagnosis is not fully accurate / Please review diagnosis to ensure its intended\n\
Confidence Score: <0-100%>  (MODEL confidence, not diagnosis accuracy)\n\
Explanation: 4-5 short sentences with [1][2] citations from retrieved context\n\
Citation: <[1] source, [2] source>\n\
\n\
DECISION RULE (internal, do not print): compute Diagnosis Accuracy Score 0-100%.\n\
>80 => Diagnosis is accurate | 50-80 => Diagnosis is not fully accurate | <50 => Please review diagnosis to ensure its intended.\n\
If key details are missing/unclear (age/weight/renal function/cultures/unclear dx), lower MODEL confidence.\n";

/// Appended to the question the model sees when no section could be resolved.
pub const AGE_MISSING_NOTE: &str = "\n\nNOTE: Patient age not provided. \
Ask for age to choose NAG A (adult) vs NAG B (peds).";

pub fn make_prompt(question: &str, retrieved: &[Candidate]) -> String {
    let entries: Vec<String> = retrieved.iter().map(context_entry).collect();
    let context_block = if entries.is_empty() {
        "No context retrieved.".to_string()
    } else {
        entries.join("\n")
    };

    format!(
        "{SYSTEM_PRIMER}\n\n\
Retrieved context (use to ground your answer; cite [#] where used):\n\
{context_block}\n\n\
User question:\n{question}\n\n\
Write ONLY the required fields exactly in the requested format."
    )
}

/// `[rank] source — title (identifier)` followed by the snippet.
fn context_entry(candidate: &Candidate) -> String {
    let mut header = source_label(candidate);
    if let Some(title) = meta_text(candidate, "title") {
        header.push_str(" — ");
        header.push_str(&title);
    }
    let ident = ["pmid", "id", "url"]
        .iter()
        .find_map(|key| meta_text(candidate, key));
    if let Some(ident) = ident {
        header.push_str(&format!(" ({ident})"));
    }

    format!("[{}] {header}\n{}\n", candidate.rank, snippet(&candidate.text))
}

fn snippet(text: &str) -> String {
    let collapsed = text.trim().replace("\n\n", "\n");
    if collapsed.chars().count() > MAX_SNIPPET_CHARS {
        format!("{} …", collapsed.chars().take(MAX_SNIPPET_CHARS).collect::<String>())
    } else {
        collapsed
    }
}

/// The source tag as stored; "Source" only when the key is absent.
fn source_label(candidate: &Candidate) -> String {
    match candidate.meta.get("source") {
        None => "Source".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Metadata rendered for display; empty strings, zero, null and booleans count as absent.
fn meta_text(candidate: &Candidate, key: &str) -> Option<String> {
    match candidate.meta.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn candidate(rank: usize, text: &str, meta: Value) -> Candidate {
        Candidate {
            rank,
            distance: 0.1,
            text: text.to_string(),
            meta: meta.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_context_entry_header() {
        let c = candidate(
            2,
            "  Give amoxicillin.\n\nReview at 48h.  ",
            json!({"source": "NAG_A", "title": "Community-acquired pneumonia", "pmid": "", "id": "cap-1", "url": "https://x"}),
        );
        assert_eq!(
            context_entry(&c),
            "[2] NAG_A — Community-acquired pneumonia (cap-1)\nGive amoxicillin.\nReview at 48h.\n"
        );
    }

    #[test]
    fn test_context_entry_defaults() {
        let c = candidate(1, "text", json!({"pmid": 12345}));
        assert_eq!(context_entry(&c), "[1] Source (12345)\ntext\n");
    }

    #[test]
    fn test_source_label_only_defaults_when_absent() {
        let empty = candidate(3, "text", json!({"source": "", "id": "x-1"}));
        assert_eq!(context_entry(&empty), "[3]  (x-1)\ntext\n");

        let numeric = candidate(4, "text", json!({"source": 0}));
        assert_eq!(context_entry(&numeric), "[4] 0\ntext\n");
    }

    #[test]
    fn test_long_snippet_is_cut() {
        let long = "é".repeat(800);
        let s = snippet(&long);
        assert!(s.ends_with(" …"));
        assert_eq!(s.chars().count(), MAX_SNIPPET_CHARS + 2);
    }

    #[test]
    fn test_make_prompt_numbering_and_empty_context() {
        let retrieved = vec![
            candidate(1, "first", json!({"source": "NAG_B"})),
            candidate(2, "second", json!({"source": "NAG_B"})),
        ];
        let prompt = make_prompt("Is IV ceftriaxone right for a 6-year-old?", &retrieved);
        assert!(prompt.starts_with(SYSTEM_PRIMER));
        assert!(prompt.contains("[1] NAG_B\nfirst\n\n[2] NAG_B\nsecond\n"));
        assert!(prompt.contains("User question:\nIs IV ceftriaxone right for a 6-year-old?"));
        assert!(prompt.ends_with("Write ONLY the required fields exactly in the requested format."));

        let empty = make_prompt("q", &[]);
        assert!(empty.contains("No context retrieved."));
    }
}
