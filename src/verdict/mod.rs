//! Adjudicated verification outcome types.
//!
//! A `VerificationResult` is constructed exactly once per request by the
//! orchestrator and never mutated afterward. The constructors enforce the
//! tier/exception invariants so malformed results cannot be built.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::oracle::OracleResponse;

/// Which verification strategy produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Pattern,
    AssistedProcedural,
    Formal,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern => f.write_str("pattern"),
            Self::AssistedProcedural => f.write_str("assisted_procedural"),
            Self::Formal => f.write_str("formal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Pattern,
    Assisted,
}

/// A procedural exception that permits the disclosure without explicit
/// authorization, found by Tier 1A or 1B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralException {
    pub name: String,
    pub citation: String,
    pub rationale: String,
    pub applies: bool,
    pub confidence: f64,
    pub provenance: Provenance,
}

impl ProceduralException {
    pub fn inapplicable(provenance: Provenance) -> Self {
        Self {
            name: "None".to_string(),
            citation: String::new(),
            rationale: String::new(),
            applies: false,
            confidence: 0.0,
            provenance,
        }
    }
}

/// Complete adjudicated result for one verification request. The warnings
/// list is the audit trail of every degradation the pipeline took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub compliant: bool,
    pub tier: Tier,
    pub confidence: f64,
    pub explanation: String,
    pub citations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedural_exception: Option<ProceduralException>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formal_response: Option<OracleResponse>,
    pub warnings: Vec<String>,
}

impl VerificationResult {
    /// Verdict from an accepted procedural exception (Tier 1A/1B).
    /// An accepted exception always permits the disclosure.
    pub fn from_exception(
        tier: Tier,
        exception: ProceduralException,
        warnings: Vec<String>,
    ) -> Self {
        debug_assert!(matches!(tier, Tier::Pattern | Tier::AssistedProcedural));
        debug_assert!(exception.applies && exception.confidence > 0.0);
        Self {
            compliant: true,
            tier,
            confidence: clamp_confidence(exception.confidence),
            explanation: exception.rationale.clone(),
            citations: vec![exception.citation.clone()],
            procedural_exception: Some(exception),
            formal_response: None,
            warnings,
        }
    }

    /// Verdict from the formal oracle (Tier 2).
    pub fn formal(
        compliant: bool,
        confidence: f64,
        explanation: impl Into<String>,
        citations: Vec<String>,
        response: OracleResponse,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            compliant,
            tier: Tier::Formal,
            confidence: guard_compliant_confidence(compliant, confidence),
            explanation: explanation.into(),
            citations,
            procedural_exception: None,
            formal_response: Some(response),
            warnings,
        }
    }

    /// Verdict from the heuristic fallback, reported under the formal tier
    /// it substitutes for, with no raw oracle payload.
    pub fn fallback(
        compliant: bool,
        confidence: f64,
        explanation: impl Into<String>,
        citations: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            compliant,
            tier: Tier::Formal,
            confidence: guard_compliant_confidence(compliant, confidence),
            explanation: explanation.into(),
            citations,
            procedural_exception: None,
            formal_response: None,
            warnings,
        }
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

/// A compliant verdict must carry strictly positive confidence; a zero
/// score only ever accompanies a non-compliant fallback.
fn guard_compliant_confidence(compliant: bool, confidence: f64) -> f64 {
    let clamped = clamp_confidence(confidence);
    debug_assert!(!compliant || clamped > 0.0);
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applicable_exception(provenance: Provenance) -> ProceduralException {
        ProceduralException {
            name: "Treatment Referral".into(),
            citation: "45 CFR §164.506(c)(2)".into(),
            rationale: "Disclosure for treatment activities of another provider".into(),
            applies: true,
            confidence: 0.95,
            provenance,
        }
    }

    #[test]
    fn test_exception_result_carries_exception() {
        let result = VerificationResult::from_exception(
            Tier::Pattern,
            applicable_exception(Provenance::Pattern),
            vec![],
        );

        assert!(result.compliant);
        assert_eq!(result.tier, Tier::Pattern);
        assert!(result.procedural_exception.is_some());
        assert!(result.formal_response.is_none());
        assert_eq!(result.citations, vec!["45 CFR §164.506(c)(2)".to_string()]);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn test_formal_result_has_no_exception() {
        let result = VerificationResult::formal(
            false,
            0.90,
            "violations found",
            vec!["P12".into()],
            OracleResponse::default(),
            vec![],
        );

        assert_eq!(result.tier, Tier::Formal);
        assert!(result.procedural_exception.is_none());
        assert!(result.formal_response.is_some());
    }

    #[test]
    fn test_fallback_zero_confidence_non_compliant() {
        let result = VerificationResult::fallback(
            false,
            0.0,
            "unable to verify",
            vec![],
            vec!["oracle unavailable".into()],
        );

        assert!(!result.compliant);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_confidence_clamped() {
        let mut exception = applicable_exception(Provenance::Assisted);
        exception.confidence = 1.4;
        let result =
            VerificationResult::from_exception(Tier::AssistedProcedural, exception, vec![]);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_tier_serialization_names() {
        assert_eq!(
            serde_json::to_string(&Tier::AssistedProcedural).unwrap(),
            "\"assisted_procedural\""
        );
        assert_eq!(serde_json::to_string(&Tier::Pattern).unwrap(), "\"pattern\"");
    }
}
