/// Policy-governed retrieval.
///
/// Pipeline for one request: over-fetch candidates from the similarity search, keep the
/// ones whose source is allowed for the section, and when none survive fall back to a
/// source-biased re-ranking of everything that was fetched. The final sequence is
/// truncated to `k` and re-numbered 1..N.
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::AppError;
use crate::model::Candidate;
use crate::policy::{SectionCode, SectionPolicy};

/// Nearest-neighbour lookup over the document index.
///
/// Implementations return at most `k` candidates ordered by ascending distance, each with
/// `meta.source` populated. Fewer than `k` come back when the index holds fewer documents.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Candidate>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    /// Used when a request asks for zero results.
    pub default_k: usize,
    /// Distance subtracted from preferred-source candidates during fallback re-ranking.
    pub source_bonus: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            default_k: 5,
            source_bonus: 0.15,
        }
    }
}

/// Number of candidates to request for a final result of `k`.
pub fn overfetch_count(k: usize) -> usize {
    std::cmp::max(k.saturating_mul(3), k.saturating_add(5))
}

/// Keep candidates whose source is in `allowed`, preserving order.
pub fn filter_by_section(candidates: &[Candidate], allowed: &HashSet<String>) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| c.source().is_some_and(|s| allowed.contains(s)))
        .cloned()
        .collect()
}

/// Reorder candidates by distance, treating preferred sources as `bonus` closer.
///
/// Never drops items. Equal effective distances keep their input order.
pub fn rank_with_source_bonus(
    candidates: Vec<Candidate>,
    preferred: &HashSet<String>,
    bonus: f32,
) -> Vec<Candidate> {
    let mut scored: Vec<(f32, Candidate)> = candidates
        .into_iter()
        .map(|c| {
            let preferred_source = c.source().is_some_and(|s| preferred.contains(s));
            let effective = if preferred_source {
                c.distance - bonus
            } else {
                c.distance
            };
            (effective, c)
        })
        .collect();
    // Stable: ties keep input order.
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.into_iter().map(|(_, c)| c).collect()
}

fn renumber(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| Candidate { rank: i + 1, ..c })
        .collect()
}

pub struct Retriever {
    search: Arc<dyn SimilaritySearch>,
    policy: Arc<SectionPolicy>,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        search: Arc<dyn SimilaritySearch>,
        policy: Arc<SectionPolicy>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            search,
            policy,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Retrieve up to `k` grounding candidates for `query` under `section`.
    ///
    /// `k == 0` means the configured default. An empty result is a valid outcome; only a
    /// failure of the similarity search is an error.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        section: SectionCode,
    ) -> Result<Vec<Candidate>, AppError> {
        let k = if k == 0 { self.settings.default_k } else { k };
        let allowed = self.policy.allowed_sources(section);
        let fetch = overfetch_count(k);

        let fetched = self.search.search(query, fetch).await?;
        let filtered = filter_by_section(&fetched, allowed);
        debug!(
            %section,
            fetch,
            fetched = fetched.len(),
            filtered = filtered.len(),
            "section filter applied"
        );

        let selected = if !filtered.is_empty() {
            filtered
        } else if section.is_specific() {
            info!(%section, candidates = fetched.len(), "no section match, re-ranking with source bonus");
            rank_with_source_bonus(fetched, allowed, self.settings.source_bonus)
        } else {
            fetched
        };

        Ok(renumber(selected.into_iter().take(k).collect()))
    }
}
