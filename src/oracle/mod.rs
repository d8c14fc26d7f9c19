//! Tier 2: adapter to the external formal verification oracle.
//!
//! The oracle is an opaque engine reached over a single bounded
//! request/response exchange. This module filters conclusion facts out of
//! the request, wraps the formula in the fixed regulation envelope, and
//! interprets the structured response through one canonical rule.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::{Result, VerifyError};
use crate::fact::{is_conclusion_predicate, Fact, FactSet, FormalQuery};

/// Request payload submitted to the oracle.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub formula: String,
    pub facts: FactsEnvelope,
    pub regulation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactsEnvelope {
    pub facts: Vec<FactPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactPayload {
    pub predicate: String,
    pub arguments: Vec<String>,
}

impl From<&Fact> for FactPayload {
    fn from(fact: &Fact) -> Self {
        Self {
            predicate: fact.predicate.clone(),
            arguments: fact.arguments.clone(),
        }
    }
}

/// Structured oracle response: either per-policy evaluations or a
/// violation identifier list, optionally with an overall verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    #[serde(default)]
    pub evaluations: Vec<PolicyEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_compliant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub evaluation: EvaluationBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationBody {
    #[serde(default)]
    pub result: String,
}

/// Canonical verdict extracted from an oracle response.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleVerdict {
    pub compliant: bool,
    pub citations: Vec<String>,
    pub violation_count: usize,
}

/// The single authoritative interpretation of an oracle response. Every
/// consumer of a verdict goes through this function.
pub fn interpret_response(response: &OracleResponse) -> Result<OracleVerdict> {
    if let Some(error) = &response.error {
        return Err(VerifyError::Oracle(format!("oracle reported: {}", error)));
    }

    if !response.evaluations.is_empty() {
        let failed: Vec<&PolicyEvaluation> = response
            .evaluations
            .iter()
            .filter(|e| e.evaluation.result != "true")
            .collect();
        let citations = response
            .evaluations
            .iter()
            .filter_map(|e| e.policy_id.clone())
            .collect();
        return Ok(OracleVerdict {
            compliant: failed.is_empty(),
            citations,
            violation_count: failed.len(),
        });
    }

    if let Some(violations) = &response.violations {
        return Ok(OracleVerdict {
            compliant: violations.is_empty(),
            citations: violations.clone(),
            violation_count: violations.len(),
        });
    }

    if let Some(overall) = response.overall_compliant {
        return Ok(OracleVerdict {
            compliant: overall,
            citations: Vec::new(),
            violation_count: usize::from(!overall),
        });
    }

    Err(VerifyError::Oracle(
        "response contained no evaluations, violations, or overall verdict".into(),
    ))
}

/// Boundary to the formal verification engine.
#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn submit(&self, request: &OracleRequest) -> Result<OracleResponse>;
}

/// Oracle engine invoked as a subprocess in JSON mode: request on stdin,
/// response on stdout, hard timeout, no retry.
pub struct SubprocessOracle {
    program: PathBuf,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl SubprocessOracle {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            working_dir: None,
            timeout,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        let mut oracle = Self::new(&config.program, Duration::from_secs(config.timeout_secs));
        if let Some(dir) = &config.working_dir {
            oracle = oracle.with_working_dir(dir);
        }
        oracle
    }
}

#[async_trait]
impl OracleClient for SubprocessOracle {
    async fn submit(&self, request: &OracleRequest) -> Result<OracleResponse> {
        let payload = serde_json::to_string(request)?;
        debug!(program = %self.program.display(), bytes = payload.len(), "Submitting to oracle");

        let mut command = Command::new(&self.program);
        command
            .arg("json")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| VerifyError::Oracle(format!("failed to spawn oracle: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VerifyError::Timeout(format!("oracle after {}s", self.timeout.as_secs()))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VerifyError::Oracle(format!(
                "oracle exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(VerifyError::Oracle("oracle produced no output".into()));
        }

        serde_json::from_str(stdout.trim())
            .map_err(|e| VerifyError::Oracle(format!("malformed oracle output: {}", e)))
    }
}

/// Interpreted outcome of a formal verification round trip.
#[derive(Debug, Clone)]
pub struct FormalOutcome {
    pub compliant: bool,
    pub citations: Vec<String>,
    pub explanation: String,
    pub response: OracleResponse,
}

pub struct FormalVerifierAdapter {
    client: Arc<dyn OracleClient>,
    config: OracleConfig,
}

impl FormalVerifierAdapter {
    pub fn new(client: Arc<dyn OracleClient>, config: OracleConfig) -> Self {
        Self { client, config }
    }

    /// Facts safe to forward: conclusion predicates assert the permission
    /// under test and are stripped.
    pub fn filter_facts<'a>(facts: &'a FactSet) -> Vec<&'a Fact> {
        facts
            .iter()
            .filter(|f| !is_conclusion_predicate(&f.predicate))
            .collect()
    }

    fn wrap_formula(&self, formula: &str) -> String {
        format!(
            "regulation {} version \"{}\"\npolicy starts\n{}\n;\npolicy ends",
            self.config.regulation, self.config.version, formula
        )
    }

    /// Submit the formal query with the filtered facts and interpret the
    /// response. Any oracle fault is reported upward unchanged; the caller
    /// decides how to degrade.
    pub async fn verify(&self, formula: &FormalQuery, facts: &FactSet) -> Result<FormalOutcome> {
        let forwarded = Self::filter_facts(facts);
        debug!(
            total = facts.len(),
            forwarded = forwarded.len(),
            "Filtered facts for formal verification"
        );

        let request = OracleRequest {
            formula: self.wrap_formula(formula.as_str()),
            facts: FactsEnvelope {
                facts: forwarded.into_iter().map(FactPayload::from).collect(),
            },
            regulation: self.config.regulation.clone(),
        };

        let response = self.client.submit(&request).await?;
        let verdict = interpret_response(&response)?;

        let explanation = if verdict.compliant {
            format!(
                "Formal verification confirms compliance with {} primary policies.",
                self.config.regulation
            )
        } else {
            format!(
                "Formal verification found {} policy violation(s).",
                verdict.violation_count
            )
        };

        debug!(
            compliant = verdict.compliant,
            citations = verdict.citations.len(),
            "Oracle verdict interpreted"
        );

        Ok(FormalOutcome {
            compliant: verdict.compliant,
            citations: verdict.citations,
            explanation,
            response,
        })
    }

    /// Round-trip a formula with no facts to check that the oracle accepts
    /// its syntax inside the policy envelope.
    pub async fn validate_formula(&self, formula: &FormalQuery) -> Result<()> {
        let request = OracleRequest {
            formula: self.wrap_formula(formula.as_str()),
            facts: FactsEnvelope { facts: Vec::new() },
            regulation: self.config.regulation.clone(),
        };

        let response = self.client.submit(&request).await?;
        if let Some(error) = response.error {
            warn!(error = %error, "Oracle rejected formula");
            return Err(VerifyError::InvalidFormula(error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;

    struct FixedOracle {
        response: OracleResponse,
    }

    #[async_trait]
    impl OracleClient for FixedOracle {
        async fn submit(&self, _request: &OracleRequest) -> Result<OracleResponse> {
            Ok(self.response.clone())
        }
    }

    fn adapter(response: OracleResponse) -> FormalVerifierAdapter {
        FormalVerifierAdapter::new(Arc::new(FixedOracle { response }), OracleConfig::default())
    }

    fn evaluation(policy_id: &str, result: &str) -> PolicyEvaluation {
        PolicyEvaluation {
            policy_id: Some(policy_id.to_string()),
            evaluation: EvaluationBody {
                result: result.to_string(),
            },
        }
    }

    #[test]
    fn test_interpret_all_true_evaluations() {
        let response = OracleResponse {
            evaluations: vec![evaluation("P1", "true"), evaluation("P2", "true")],
            ..Default::default()
        };
        let verdict = interpret_response(&response).unwrap();
        assert!(verdict.compliant);
        assert_eq!(verdict.citations, vec!["P1", "P2"]);
    }

    #[test]
    fn test_interpret_false_evaluation_fails() {
        let response = OracleResponse {
            evaluations: vec![evaluation("P1", "true"), evaluation("P2", "false")],
            ..Default::default()
        };
        let verdict = interpret_response(&response).unwrap();
        assert!(!verdict.compliant);
        assert_eq!(verdict.violation_count, 1);
    }

    #[test]
    fn test_interpret_violations_list() {
        let response = OracleResponse {
            violations: Some(vec!["P12".to_string()]),
            ..Default::default()
        };
        let verdict = interpret_response(&response).unwrap();
        assert!(!verdict.compliant);
        assert_eq!(verdict.citations, vec!["P12"]);
    }

    #[test]
    fn test_interpret_empty_violations_compliant() {
        let response = OracleResponse {
            violations: Some(Vec::new()),
            ..Default::default()
        };
        assert!(interpret_response(&response).unwrap().compliant);
    }

    #[test]
    fn test_interpret_overall_flag_fallback() {
        let response = OracleResponse {
            overall_compliant: Some(true),
            ..Default::default()
        };
        assert!(interpret_response(&response).unwrap().compliant);
    }

    #[test]
    fn test_interpret_empty_response_is_fault() {
        assert!(interpret_response(&OracleResponse::default()).is_err());
    }

    #[test]
    fn test_interpret_error_field_is_fault() {
        let response = OracleResponse {
            error: Some("parse failure at line 3".into()),
            ..Default::default()
        };
        let err = interpret_response(&response).unwrap_err();
        assert!(err.to_string().contains("parse failure"));
    }

    #[test]
    fn test_conclusion_facts_stripped() {
        let (facts, _) = FactSet::validate(vec![
            Fact::new("coveredEntity", vec!["H".into()]),
            Fact::new(
                "permittedUseOrDisclosure",
                vec!["H".into(), "S".into(), "R".into(), "T".into()],
            ),
            Fact::new("hasAuthorization", vec!["H".into(), "S".into(), "R".into()]),
            Fact::new("requiredByLaw", vec!["L".into()]),
        ]);

        let forwarded = FormalVerifierAdapter::filter_facts(&facts);
        let predicates: Vec<&str> = forwarded.iter().map(|f| f.predicate.as_str()).collect();
        assert_eq!(predicates, vec!["coveredEntity", "requiredByLaw"]);
    }

    #[test]
    fn test_formula_envelope() {
        let adapter = adapter(OracleResponse::default());
        let wrapped = adapter.wrap_formula("forall x. coveredEntity(x)");
        assert_eq!(
            wrapped,
            "regulation HIPAA version \"1.0\"\npolicy starts\nforall x. coveredEntity(x)\n;\npolicy ends"
        );
    }

    #[tokio::test]
    async fn test_verify_interprets_violations() {
        let adapter = adapter(OracleResponse {
            violations: Some(vec!["P12".to_string()]),
            ..Default::default()
        });
        let (facts, _) = FactSet::validate(vec![Fact::new("coveredEntity", vec!["H".into()])]);

        let outcome = adapter
            .verify(&FormalQuery::new("forall x. coveredEntity(x)"), &facts)
            .await
            .unwrap();
        assert!(!outcome.compliant);
        assert_eq!(outcome.citations, vec!["P12"]);
        assert!(outcome.explanation.contains("1 policy violation"));
    }

    #[tokio::test]
    async fn test_validate_formula_propagates_oracle_error() {
        let adapter = adapter(OracleResponse {
            error: Some("syntax error".into()),
            ..Default::default()
        });
        let err = adapter
            .validate_formula(&FormalQuery::new("forall x. coveredEntity(x)"))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidFormula(_)));
    }
}
