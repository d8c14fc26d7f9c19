//! Tier 1A: fast, purely local matching of a query and its facts against
//! a static catalog of named exception templates. No external calls.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PatternConfig;
use crate::fact::FactSet;
use crate::verdict::{ProceduralException, Provenance};

/// Structural requirements checked against the extracted facts and raw
/// query text. An empty list means that dimension is not checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactPattern {
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub purposes: Vec<String>,
    #[serde(default)]
    pub recipient_types: Vec<String>,
    #[serde(default)]
    pub phi_types: Vec<String>,
}

/// Static configuration for one named exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionTemplate {
    pub name: String,
    pub citation: String,
    pub keywords: Vec<String>,
    pub min_keywords: usize,
    pub pattern: FactPattern,
    pub base_confidence: f64,
    pub rationale: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The built-in exception catalog covering the most frequent procedural
/// exceptions.
pub fn builtin_catalog() -> Vec<ExceptionTemplate> {
    vec![
        ExceptionTemplate {
            name: "Treatment Use (Internal)".into(),
            citation: "45 CFR §164.506(c)(1)".into(),
            keywords: strings(&["treatment", "use", "care", "patient", "records"]),
            min_keywords: 1,
            pattern: FactPattern {
                entity_types: strings(&[
                    "covered_entity",
                    "provider",
                    "hospital",
                    "clinic",
                    "pharmacy",
                ]),
                purposes: strings(&["treatment", "@Treatment", "care"]),
                ..Default::default()
            },
            base_confidence: 0.95,
            rationale: "A covered entity may use protected health information for its \
                        own treatment purposes without patient authorization \
                        (45 CFR §164.506(c)(1))."
                .into(),
        },
        ExceptionTemplate {
            name: "Treatment Referral".into(),
            citation: "45 CFR §164.506(c)(2)".into(),
            keywords: strings(&["treatment", "referral", "specialist", "consult", "refer"]),
            min_keywords: 1,
            pattern: FactPattern {
                entity_types: strings(&["provider", "hospital", "clinic"]),
                recipient_types: strings(&["specialist", "provider", "doctor", "physician"]),
                purposes: strings(&["treatment", "@Treatment", "referral"]),
                ..Default::default()
            },
            base_confidence: 0.98,
            rationale: "Covered entities may disclose PHI for treatment activities of \
                        another healthcare provider without authorization \
                        (45 CFR §164.506(c)(2))."
                .into(),
        },
        ExceptionTemplate {
            name: "Family Prescription Pickup".into(),
            citation: "45 CFR §164.510(b)(3)".into(),
            keywords: strings(&["family", "prescription", "pick", "medication", "relative"]),
            min_keywords: 2,
            pattern: FactPattern {
                entity_types: strings(&["pharmacy", "provider"]),
                recipient_types: strings(&["family", "relative", "spouse", "parent"]),
                phi_types: strings(&["prescription", "medication"]),
                purposes: strings(&["pickup", "pick up"]),
            },
            base_confidence: 0.95,
            rationale: "Professional judgment allows family members to pick up \
                        prescriptions, medical supplies, or X-rays without explicit \
                        authorization (45 CFR §164.510(b)(3))."
                .into(),
        },
        ExceptionTemplate {
            name: "Payment Activities".into(),
            citation: "45 CFR §164.506(c)(3)".into(),
            keywords: strings(&["payment", "billing", "insurance", "claim", "bill"]),
            min_keywords: 1,
            pattern: FactPattern {
                purposes: strings(&["payment", "@Payment", "billing"]),
                ..Default::default()
            },
            base_confidence: 0.95,
            rationale: "Covered entities may disclose PHI for payment purposes without \
                        patient authorization (45 CFR §164.506(c)(3))."
                .into(),
        },
        ExceptionTemplate {
            name: "Healthcare Operations".into(),
            citation: "45 CFR §164.506(c)(4)".into(),
            keywords: strings(&["operations", "quality", "improvement", "accreditation"]),
            min_keywords: 1,
            pattern: FactPattern {
                purposes: strings(&["@HealthcareOperations", "operations", "quality"]),
                ..Default::default()
            },
            base_confidence: 0.85,
            rationale: "Covered entities may use PHI for healthcare operations \
                        including quality assessment and improvement \
                        (45 CFR §164.506(c)(4))."
                .into(),
        },
        ExceptionTemplate {
            name: "Public Health Reporting".into(),
            citation: "45 CFR §164.512(b)".into(),
            keywords: strings(&["public health", "disease", "reporting", "outbreak", "cdc"]),
            min_keywords: 2,
            pattern: FactPattern {
                recipient_types: strings(&["public_health", "health_department", "cdc"]),
                purposes: strings(&["@PublicHealth", "disease", "reporting"]),
                ..Default::default()
            },
            base_confidence: 0.98,
            rationale: "Covered entities may disclose PHI to public health authorities \
                        for public health activities including disease surveillance \
                        (45 CFR §164.512(b))."
                .into(),
        },
    ]
}

pub struct PatternMatcher {
    templates: Vec<ExceptionTemplate>,
    config: PatternConfig,
}

impl PatternMatcher {
    pub fn new(config: PatternConfig) -> Self {
        Self::with_catalog(builtin_catalog(), config)
    }

    pub fn with_catalog(templates: Vec<ExceptionTemplate>, config: PatternConfig) -> Self {
        Self { templates, config }
    }

    /// Score every template and return the best candidate, or an
    /// inapplicable exception when nothing clears the template keyword
    /// gates. `applies` is set iff the confidence clears the acceptance
    /// threshold.
    pub fn evaluate(&self, query: &str, facts: &FactSet) -> ProceduralException {
        let query_lower = query.to_lowercase();
        let mut best: Option<ProceduralException> = None;

        for template in &self.templates {
            let matched = template
                .keywords
                .iter()
                .filter(|kw| query_lower.contains(kw.as_str()))
                .count();
            if matched < template.min_keywords {
                continue;
            }

            // Keyword evidence saturates once the required minimum is met.
            let keyword_ratio = (matched as f64 / template.min_keywords.max(1) as f64).min(1.0);
            let pattern_score = score_pattern(&template.pattern, facts, &query_lower);

            let confidence = (self.config.keyword_weight * keyword_ratio
                + self.config.pattern_weight * pattern_score)
                * template.base_confidence;

            debug!(
                template = %template.name,
                matched_keywords = matched,
                pattern_score,
                confidence,
                "Template scored"
            );

            if best.as_ref().is_none_or(|b| confidence > b.confidence) {
                best = Some(ProceduralException {
                    name: template.name.clone(),
                    citation: template.citation.clone(),
                    rationale: template.rationale.clone(),
                    applies: confidence >= self.config.accept_threshold,
                    confidence,
                    provenance: Provenance::Pattern,
                });
            }
        }

        best.unwrap_or_else(|| ProceduralException::inapplicable(Provenance::Pattern))
    }
}

/// Fraction of structural checks satisfied, in [0, 1]. The purpose check
/// earns full credit from facts and half credit from the raw query text.
fn score_pattern(pattern: &FactPattern, facts: &FactSet, query_lower: &str) -> f64 {
    let mut total_checks: f64 = 0.0;
    let mut matches: f64 = 0.0;

    if !pattern.entity_types.is_empty() {
        total_checks += 1.0;
        if let Some(entity) = facts.first_argument("coveredEntity") {
            if pattern.entity_types.iter().any(|et| fuzzy_match(et, entity)) {
                matches += 1.0;
            }
        }
    }

    if !pattern.purposes.is_empty() {
        total_checks += 1.0;
        let fact_purpose_matches = facts.iter().filter_map(|f| f.purpose()).any(|purpose| {
            pattern.purposes.iter().any(|p| fuzzy_match(p, purpose))
        });
        if fact_purpose_matches {
            matches += 1.0;
        }
        let query_purpose_matches = pattern
            .purposes
            .iter()
            .any(|p| query_lower.contains(&p.to_lowercase().replace('@', "")));
        if query_purpose_matches {
            matches += 0.5;
        }
    }

    if !pattern.recipient_types.is_empty() {
        total_checks += 1.0;
        let recipient_matches = facts.iter().filter_map(|f| f.recipient()).any(|recipient| {
            pattern
                .recipient_types
                .iter()
                .any(|rt| fuzzy_match(rt, recipient))
        });
        if recipient_matches {
            matches += 1.0;
        }
    }

    if !pattern.phi_types.is_empty() {
        total_checks += 1.0;
        if pattern.phi_types.iter().any(|t| query_lower.contains(t.as_str())) {
            matches += 1.0;
        }
    }

    if total_checks == 0.0 {
        return 0.0;
    }
    (matches / total_checks).clamp(0.0, 1.0)
}

/// Normalized substring match in either direction. Empty sides never
/// match, so a missing fact argument cannot satisfy a check.
fn fuzzy_match(pattern: &str, text: &str) -> bool {
    let normalize = |s: &str| {
        s.to_lowercase()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | '@'))
            .collect::<String>()
    };
    let pattern = normalize(pattern);
    let text = normalize(text);
    if pattern.is_empty() || text.is_empty() {
        return false;
    }
    pattern.contains(&text) || text.contains(&pattern)
}
