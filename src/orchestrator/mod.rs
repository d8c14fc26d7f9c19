//! Pipeline orchestration: sequences the verification tiers per the
//! router's decision, enforces acceptance thresholds, and substitutes the
//! heuristic fallback when every tier degrades.
//!
//! The orchestrator never lets a tier fault propagate: every request
//! terminates in a complete `VerificationResult` whose warnings list is
//! the audit trail of the degradations taken.

mod signal;
mod state;

pub use signal::CancelSignal;
pub use state::{PipelineState, PipelineTransition};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{AssistedClassifier, ClassifierCache, ReasoningService};
use crate::config::{FallbackConfig, VerifyConfig};
use crate::corpus::CorpusIndex;
use crate::error::{Result, VerifyError};
use crate::fact::{Fact, FactSet, FormalQuery};
use crate::oracle::{FormalVerifierAdapter, OracleClient};
use crate::pattern::PatternMatcher;
use crate::router::{RouteDecision, Router, Track};
use crate::verdict::{Tier, VerificationResult};

/// One compliance question with its externally extracted facts and formal
/// query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub query: String,
    pub facts: Vec<Fact>,
    pub formula: FormalQuery,
}

const TREATMENT_INDICATORS: &[&str] = &["treatment", "care", "specialist", "doctor", "physician"];
const PAYMENT_INDICATORS: &[&str] = &["payment", "billing", "insurance", "claim"];
const OPERATIONS_INDICATORS: &[&str] = &["operations", "quality", "improvement"];

/// Tracks the pipeline state machine for one request, logging every
/// transition.
struct Trace {
    state: PipelineState,
    transitions: Vec<PipelineTransition>,
}

impl Trace {
    fn new() -> Self {
        Self {
            state: PipelineState::Routing,
            transitions: Vec::new(),
        }
    }

    fn advance(&mut self, to: PipelineState, reason: &str) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal pipeline transition {} -> {}",
            self.state,
            to
        );
        debug!(from = %self.state, to = %to, reason, "Pipeline transition");
        self.transitions.push(PipelineTransition::new(self.state, to, reason));
        self.state = to;
    }
}

pub struct Orchestrator {
    router: Router,
    matcher: PatternMatcher,
    classifier: AssistedClassifier,
    adapter: FormalVerifierAdapter,
    classifier_accept: f64,
    compliant_confidence: f64,
    violation_confidence: f64,
    fallback: FallbackConfig,
}

impl Orchestrator {
    pub fn new(
        corpus: Arc<CorpusIndex>,
        reasoning: Arc<dyn ReasoningService>,
        oracle: Arc<dyn OracleClient>,
        cache: Arc<ClassifierCache>,
        config: &VerifyConfig,
    ) -> Self {
        Self {
            router: Router::new(corpus, config.router.clone()),
            matcher: PatternMatcher::new(config.pattern.clone()),
            classifier: AssistedClassifier::new(reasoning, cache, config.classifier.clone()),
            adapter: FormalVerifierAdapter::new(oracle, config.oracle.clone()),
            classifier_accept: config.classifier.accept_threshold,
            compliant_confidence: config.oracle.compliant_confidence,
            violation_confidence: config.oracle.violation_confidence,
            fallback: config.fallback.clone(),
        }
    }

    /// Expose routing for callers that only want the track decision.
    pub fn route(&self, query: &str) -> RouteDecision {
        self.router.route(query)
    }

    pub async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult> {
        self.verify_with_cancel(request, &CancelSignal::new()).await
    }

    /// Run the full pipeline. Fails only on caller contract violations
    /// (empty query, malformed formula); every tier fault degrades into
    /// the returned result instead.
    pub async fn verify_with_cancel(
        &self,
        request: &VerificationRequest,
        cancel: &CancelSignal,
    ) -> Result<VerificationResult> {
        if request.query.trim().is_empty() {
            return Err(VerifyError::InvalidRequest("empty query".into()));
        }
        request.formula.validate()?;

        let request_id = Uuid::new_v4();
        debug!(
            request_id = %request_id,
            query = %request.query,
            facts = request.facts.len(),
            "Verification pipeline started"
        );

        let (facts, mut warnings) = FactSet::validate(request.facts.clone());
        let mut trace = Trace::new();

        let decision = self.router.route(&request.query);
        if decision.degenerate {
            warnings.push(
                "Routing degeneracy: no affinity with either policy set; \
                 defaulting to procedural track"
                    .to_string(),
            );
        }

        let result = match decision.track {
            Track::Procedural => {
                self.run_procedural_track(request, &facts, cancel, &mut trace, warnings)
                    .await
            }
            Track::Primary => {
                trace.advance(PipelineState::Tier2, "primary track selected");
                self.run_formal_tier(request, &facts, cancel, &mut trace, warnings)
                    .await
            }
        };

        info!(
            request_id = %request_id,
            tier = %result.tier,
            compliant = result.compliant,
            confidence = result.confidence,
            warnings = result.warnings.len(),
            steps = trace.transitions.len(),
            "Verification pipeline complete"
        );
        debug_assert!(trace.state.is_terminal());

        Ok(result)
    }

    async fn run_procedural_track(
        &self,
        request: &VerificationRequest,
        facts: &FactSet,
        cancel: &CancelSignal,
        trace: &mut Trace,
        mut warnings: Vec<String>,
    ) -> VerificationResult {
        trace.advance(PipelineState::Tier1A, "procedural track selected");

        let candidate = self.matcher.evaluate(&request.query, facts);
        if candidate.applies {
            debug!(
                exception = %candidate.name,
                confidence = candidate.confidence,
                "Tier 1A pattern accepted"
            );
            trace.advance(PipelineState::Done, "pattern match accepted");
            return VerificationResult::from_exception(Tier::Pattern, candidate, warnings);
        }
        debug!(
            confidence = candidate.confidence,
            "Tier 1A inconclusive, trying assisted classification"
        );
        trace.advance(PipelineState::Tier1B, "pattern match inconclusive");

        if cancel.is_cancelled() {
            warnings.push(
                "Cancellation requested before assisted classification; \
                 applying heuristic fallback"
                    .to_string(),
            );
            trace.advance(PipelineState::Fallback, "cancelled");
            return self.heuristic_fallback(&request.query, trace, warnings);
        }

        let excerpts = self.router.procedural_excerpts(&request.query);
        let outcome = tokio::select! {
            outcome = self.classifier.classify(&request.query, facts, &excerpts) => Some(outcome),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(outcome) => {
                warnings.extend(outcome.warnings);
                let exception = outcome.exception;
                if exception.applies && exception.confidence >= self.classifier_accept {
                    debug!(
                        exception = %exception.name,
                        confidence = exception.confidence,
                        from_cache = outcome.from_cache,
                        "Tier 1B classification accepted"
                    );
                    trace.advance(PipelineState::Done, "assisted classification accepted");
                    return VerificationResult::from_exception(
                        Tier::AssistedProcedural,
                        exception,
                        warnings,
                    );
                }
                debug!(
                    confidence = exception.confidence,
                    "Tier 1B inconclusive, escalating to formal verification"
                );
                trace.advance(PipelineState::Tier2, "no procedural exception found");
                self.run_formal_tier(request, facts, cancel, trace, warnings)
                    .await
            }
            None => {
                warn!("Cancellation during assisted classification");
                warnings.push(
                    "Cancellation requested during assisted classification; \
                     applying heuristic fallback"
                        .to_string(),
                );
                trace.advance(PipelineState::Fallback, "cancelled");
                self.heuristic_fallback(&request.query, trace, warnings)
            }
        }
    }

    async fn run_formal_tier(
        &self,
        request: &VerificationRequest,
        facts: &FactSet,
        cancel: &CancelSignal,
        trace: &mut Trace,
        mut warnings: Vec<String>,
    ) -> VerificationResult {
        if cancel.is_cancelled() {
            warnings.push(
                "Cancellation requested before formal verification; \
                 applying heuristic fallback"
                    .to_string(),
            );
            trace.advance(PipelineState::Fallback, "cancelled");
            return self.heuristic_fallback(&request.query, trace, warnings);
        }

        let outcome = tokio::select! {
            outcome = self.adapter.verify(&request.formula, facts) => Some(outcome),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(formal)) => {
                trace.advance(PipelineState::Done, "oracle verdict received");
                let confidence = if formal.compliant {
                    self.compliant_confidence
                } else {
                    self.violation_confidence
                };
                VerificationResult::formal(
                    formal.compliant,
                    confidence,
                    formal.explanation,
                    formal.citations,
                    formal.response,
                    warnings,
                )
            }
            Some(Err(e)) => {
                warn!(error = %e, "Oracle fault, degrading to heuristic fallback");
                warnings.push(format!(
                    "Formal verification failed: {}; applying heuristic fallback",
                    e
                ));
                trace.advance(PipelineState::Fallback, "oracle fault");
                self.heuristic_fallback(&request.query, trace, warnings)
            }
            None => {
                warn!("Cancellation during formal verification");
                warnings.push(
                    "Cancellation requested during formal verification; \
                     applying heuristic fallback"
                        .to_string(),
                );
                trace.advance(PipelineState::Fallback, "cancelled");
                self.heuristic_fallback(&request.query, trace, warnings)
            }
        }
    }

    /// Keyword heuristics approximating the common permitted purposes.
    /// Always produces a complete result; confidence stays low because
    /// nothing was formally checked.
    fn heuristic_fallback(
        &self,
        query: &str,
        trace: &mut Trace,
        mut warnings: Vec<String>,
    ) -> VerificationResult {
        let query_lower = query.to_lowercase();

        let matched = [
            (
                TREATMENT_INDICATORS,
                "45 CFR §164.506(c)(1)",
                "treatment use, which is generally permitted",
            ),
            (
                PAYMENT_INDICATORS,
                "45 CFR §164.506(c)(3)",
                "payment activities, which are generally permitted",
            ),
            (
                OPERATIONS_INDICATORS,
                "45 CFR §164.506(c)(4)",
                "healthcare operations, which are generally permitted",
            ),
        ]
        .into_iter()
        .find(|(indicators, _, _)| indicators.iter().any(|kw| query_lower.contains(kw)));

        trace.advance(PipelineState::Done, "fallback verdict emitted");

        match matched {
            Some((_, citation, description)) => {
                warnings.push(
                    "Formal verification unavailable; heuristic keyword analysis applied"
                        .to_string(),
                );
                VerificationResult::fallback(
                    true,
                    self.fallback.compliant_confidence,
                    format!(
                        "Formal verification unavailable. Heuristic analysis suggests {} \
                         under {}.",
                        description, citation
                    ),
                    vec![citation.to_string()],
                    warnings,
                )
            }
            None => {
                warnings.push(
                    "Formal verification unavailable and no heuristic rule applied; \
                     defaulting to non-compliant"
                        .to_string(),
                );
                VerificationResult::fallback(
                    false,
                    0.0,
                    "Unable to verify compliance: formal verification unavailable and \
                     no clear procedural exception applies.",
                    Vec::new(),
                    warnings,
                )
            }
        }
    }
}
