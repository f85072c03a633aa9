/// Section policy: which guideline corpora a question may draw evidence from.
///
/// Resolution is deliberately permissive. A malformed age or an unknown section string
/// is never an error; it falls through to the next rule and finally to `ALL`, so a
/// request is always answerable.
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Adults are patients of this age or older.
const ADULT_AGE: i64 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SectionCode {
    /// NAG section A, adult guidelines.
    #[serde(rename = "A")]
    A,
    /// NAG section B, pediatric guidelines.
    #[serde(rename = "B")]
    B,
    /// Section unknown or unspecified.
    #[serde(rename = "ALL")]
    All,
}

impl SectionCode {
    /// Case-insensitive parse of an explicit section code. Unknown codes yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::All => "ALL",
        }
    }

    /// Sections that carry a source preference for fallback re-ranking.
    pub fn is_specific(self) -> bool {
        matches!(self, Self::A | Self::B)
    }
}

impl fmt::Display for SectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static mapping from section to the set of allowed source tags.
///
/// Built once at startup and shared read-only between requests.
#[derive(Debug, Clone)]
pub struct SectionPolicy {
    groups: HashMap<SectionCode, HashSet<String>>,
    all: HashSet<String>,
}

impl SectionPolicy {
    /// `all` is the group used for `ALL` and for any section without its own entry.
    pub fn new<I, S>(groups: I, all: impl IntoIterator<Item = S>) -> Self
    where
        I: IntoIterator<Item = (SectionCode, Vec<S>)>,
        S: Into<String>,
    {
        let groups = groups
            .into_iter()
            .map(|(code, tags)| (code, tags.into_iter().map(Into::into).collect()))
            .collect();
        Self {
            groups,
            all: all.into_iter().map(Into::into).collect(),
        }
    }

    /// The NAG table: `A → {NAG_A}`, `B → {NAG_B}`, `ALL → {NAG_A, NAG_B}`.
    pub fn nag() -> Self {
        Self::new(
            [
                (SectionCode::A, vec!["NAG_A"]),
                (SectionCode::B, vec!["NAG_B"]),
            ],
            ["NAG_A", "NAG_B"],
        )
    }

    pub fn allowed_sources(&self, section: SectionCode) -> &HashSet<String> {
        match section {
            SectionCode::All => &self.all,
            code => self.groups.get(&code).unwrap_or(&self.all),
        }
    }
}

/// Resolve the section for a request.
///
/// Priority: an integer age wins (`A` at 18 and over, otherwise `B`), then a recognised
/// explicit section code, then `ALL`.
pub fn resolve(age: Option<&Value>, explicit_section: Option<&str>) -> SectionCode {
    section_from_age(age)
        .or_else(|| section_from_explicit(explicit_section))
        .unwrap_or(SectionCode::All)
}

fn section_from_age(age: Option<&Value>) -> Option<SectionCode> {
    let age = parse_age(age?)?;
    Some(if age >= ADULT_AGE {
        SectionCode::A
    } else {
        SectionCode::B
    })
}

fn section_from_explicit(explicit_section: Option<&str>) -> Option<SectionCode> {
    SectionCode::parse(explicit_section?)
}

/// Integer value of a raw age field.
///
/// Accepts JSON integers, JSON floats (truncated toward zero) and integer strings with
/// surrounding whitespace. Everything else, including blank strings, is absent.
/// Booleans are absent too: `true` is not an age of 1, so it falls through to the
/// explicit section.
pub fn parse_age(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
