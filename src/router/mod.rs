//! Track routing: scores a query against both policy sets and picks the
//! verification track, ranking the relevant records within it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RouterConfig;
use crate::corpus::{significant_words, CorpusIndex, PolicyClass, PolicyRecord};

/// Phrases that lean a query toward the procedural (how-to-comply) track.
const PROCEDURAL_INDICATORS: &[&str] = &[
    "professional judgment",
    "may use",
    "may disclose",
    "is permitted",
    "common practice",
    "minimum necessary",
    "does not apply",
    "opportunity to",
    "family",
    "treatment",
    "payment",
    "operations",
];

/// Phrases that lean a query toward the primary (substantive rule) track.
const PRIMARY_INDICATORS: &[&str] = &[
    "prohibited",
    "may not",
    "except as",
    "authorization required",
    "consent required",
    "violation",
    "must obtain",
    "is required",
];

const INDICATOR_BOOST: f64 = 0.1;
const SECTION_CITATION_BOOST: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Procedural,
    Primary,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Procedural => f.write_str("procedural"),
            Self::Primary => f.write_str("primary"),
        }
    }
}

impl Track {
    pub fn policy_class(self) -> PolicyClass {
        match self {
            Self::Procedural => PolicyClass::Procedural,
            Self::Primary => PolicyClass::Primary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub track: Track,
    pub ranked: Vec<PolicyRecord>,
    pub procedural_score: f64,
    pub primary_score: f64,
    /// Both affinity scores were zero; the cheaper procedural track was
    /// chosen by default.
    pub degenerate: bool,
}

pub struct Router {
    corpus: Arc<CorpusIndex>,
    config: RouterConfig,
}

impl Router {
    pub fn new(corpus: Arc<CorpusIndex>, config: RouterConfig) -> Self {
        Self { corpus, config }
    }

    /// Pick a verification track for the query and rank the relevant
    /// records within it. Deterministic for identical input.
    pub fn route(&self, query: &str) -> RouteDecision {
        let query_lower = query.to_lowercase();
        let query_words = significant_words(&query_lower);

        let mut procedural_score = self.affinity(&query_words, PolicyClass::Procedural);
        let mut primary_score = self.affinity(&query_words, PolicyClass::Primary);

        procedural_score += indicator_boost(&query_lower, PROCEDURAL_INDICATORS);
        primary_score += indicator_boost(&query_lower, PRIMARY_INDICATORS);

        let degenerate = procedural_score == 0.0 && primary_score == 0.0;

        // Ties and near-ties favor the cheaper tier.
        let track = if degenerate
            || procedural_score >= self.config.procedural_bias * primary_score
        {
            Track::Procedural
        } else {
            Track::Primary
        };

        let ranked = self.rank_records(
            &query_lower,
            track.policy_class(),
            self.config.max_ranked_records,
        );

        debug!(
            procedural_score,
            primary_score,
            track = %track,
            ranked = ranked.len(),
            degenerate,
            "Query routed"
        );

        RouteDecision {
            track,
            ranked,
            procedural_score,
            primary_score,
            degenerate,
        }
    }

    /// Fraction of significant query words present in the set's keyword
    /// index.
    fn affinity(&self, query_words: &HashSet<String>, class: PolicyClass) -> f64 {
        if query_words.is_empty() {
            return 0.0;
        }
        let matches = query_words
            .iter()
            .filter(|w| self.corpus.contains_keyword(class, w))
            .count();
        matches as f64 / query_words.len() as f64
    }

    /// Top records of a class by keyword overlap with the query, with a
    /// flat boost when the record's exact section citation appears in the
    /// query text.
    pub fn rank_records(
        &self,
        query_lower: &str,
        class: PolicyClass,
        limit: usize,
    ) -> Vec<PolicyRecord> {
        let query_words = significant_words(query_lower);

        let mut scored: Vec<(usize, &PolicyRecord)> = self
            .corpus
            .records(class)
            .iter()
            .filter_map(|record| {
                let record_words = significant_words(&record.text);
                let mut overlap = query_words.intersection(&record_words).count();
                if overlap == 0 {
                    return None;
                }
                let section = record.section.replace('§', "");
                let section = section.trim();
                if !section.is_empty() && query_lower.contains(section) {
                    overlap += SECTION_CITATION_BOOST;
                }
                Some((overlap, record))
            })
            .collect();

        // Stable sort keeps corpus order for equal scores, so ranking is
        // deterministic.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Top procedural records formatted as numbered excerpts for the
    /// assisted classifier prompt. Long clause bodies are truncated.
    pub fn procedural_excerpts(&self, query: &str) -> String {
        let relevant = self.rank_records(
            &query.to_lowercase(),
            PolicyClass::Procedural,
            self.config.max_excerpt_policies,
        );

        if relevant.is_empty() {
            return String::new();
        }

        relevant
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let mut text = record.text.clone();
                if text.len() > self.config.max_excerpt_chars {
                    let cut = floor_char_boundary(&text, self.config.max_excerpt_chars);
                    text.truncate(cut);
                    text.push_str("...");
                }
                let mut header = format!("{}. [{}]", i + 1, record.section);
                if !record.title.is_empty() {
                    header.push(' ');
                    header.push_str(&record.title);
                }
                format!("{}\n{}", header, text)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn indicator_boost(query_lower: &str, indicators: &[&str]) -> f64 {
    indicators
        .iter()
        .filter(|phrase| query_lower.contains(*phrase))
        .count() as f64
        * INDICATOR_BOOST
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut cut = index.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::PolicyRecord;

    fn corpus() -> Arc<CorpusIndex> {
        Arc::new(CorpusIndex::from_records(
            vec![
                PolicyRecord::new(
                    "164.506(c)(2)",
                    "Treatment disclosures",
                    "A covered entity may disclose protected health information for \
                     treatment activities of a health care provider",
                    PolicyClass::Procedural,
                ),
                PolicyRecord::new(
                    "164.510(b)(3)",
                    "Family pickup",
                    "Professional judgment permits family members to pick up \
                     prescriptions and medical supplies",
                    PolicyClass::Procedural,
                ),
            ],
            vec![PolicyRecord::new(
                "164.502(a)",
                "Prohibited uses",
                "A covered entity may not use or disclose protected health \
                 information except as permitted; authorization required otherwise",
                PolicyClass::Primary,
            )],
        ))
    }

    fn router() -> Router {
        Router::new(corpus(), RouterConfig::default())
    }

    #[test]
    fn test_treatment_query_routes_procedural() {
        let decision = router().route("Can a hospital share records for treatment purposes?");
        assert_eq!(decision.track, Track::Procedural);
        assert!(!decision.degenerate);
    }

    #[test]
    fn test_prohibition_query_routes_primary() {
        let decision =
            router().route("Is marketing disclosure prohibited? Authorization required? \
                            Consent required? What counts as a violation?");
        assert_eq!(decision.track, Track::Primary);
    }

    #[test]
    fn test_zero_scores_default_procedural() {
        let decision = router().route("xyzzy quux");
        assert_eq!(decision.track, Track::Procedural);
        assert!(decision.degenerate);
        assert_eq!(decision.procedural_score, 0.0);
        assert_eq!(decision.primary_score, 0.0);
    }

    #[test]
    fn test_route_is_deterministic() {
        let r = router();
        let query = "Can a hospital share records for treatment?";
        let first = r.route(query);
        let second = r.route(query);
        assert_eq!(first.track, second.track);
        assert_eq!(first.procedural_score, second.procedural_score);
        assert_eq!(first.ranked, second.ranked);
    }

    #[test]
    fn test_section_citation_boost_ranks_first() {
        let r = router();
        let ranked = r.rank_records(
            "does 164.510(b)(3) cover prescriptions for treatment disclosure?",
            PolicyClass::Procedural,
            20,
        );
        assert_eq!(ranked[0].section, "164.510(b)(3)");
    }

    #[test]
    fn test_excerpts_are_numbered_and_truncated() {
        let long_text = "disclosure ".repeat(100);
        let corpus = Arc::new(CorpusIndex::from_records(
            vec![PolicyRecord::new(
                "164.506",
                "Long clause",
                long_text,
                PolicyClass::Procedural,
            )],
            vec![],
        ));
        let router = Router::new(corpus, RouterConfig::default());

        let excerpts = router.procedural_excerpts("disclosure rules");
        assert!(excerpts.starts_with("1. [164.506] Long clause\n"));
        assert!(excerpts.ends_with("..."));
        assert!(excerpts.len() < 600);
    }

    #[test]
    fn test_no_matches_yields_empty_excerpts() {
        assert!(router().procedural_excerpts("xyzzy").is_empty());
    }
}
