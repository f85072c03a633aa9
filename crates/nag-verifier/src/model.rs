use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::SectionCode;

/// One retrieved passage.
///
/// `rank` is 1-based and reflects presentation order; it is reassigned whenever the
/// retrieval pipeline produces its final sequence. `meta` must carry a `source` tag for
/// policy matching; `pmid`, `id`, `url` and `title` are only read by prompt assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub rank: usize,
    pub distance: f32,
    pub text: String,
    pub meta: Map<String, Value>,
}

impl Candidate {
    pub fn source(&self) -> Option<&str> {
        self.meta_str("source")
    }

    /// String-valued metadata field, `None` when missing, empty or not a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// One line of a JSONL source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl SourceDocument {
    pub fn source(&self) -> &str {
        self.meta.get("source").and_then(Value::as_str).unwrap_or("")
    }
}

/// Body of `POST /ask`, extracted leniently from arbitrary JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AskRequest {
    pub question: String,
    pub age: Option<Value>,
    pub section: Option<String>,
    pub k: Option<Value>,
}

impl AskRequest {
    /// Undecodable bodies and non-object JSON are treated as an empty request.
    pub fn from_body(body: &[u8]) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        let present = |key: &str| map.get(key).filter(|v| !v.is_null()).cloned();

        Self {
            question: map
                .get("question")
                .and_then(Value::as_str)
                .map(|q| q.trim().to_string())
                .unwrap_or_default(),
            age: present("age"),
            section: map
                .get("section")
                .and_then(Value::as_str)
                .map(str::to_string),
            k: present("k"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub question: String,
    pub section: SectionCode,
    pub answer: String,
    pub retrieved: Vec<Candidate>,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub docs: usize,
    pub model: String,
}
