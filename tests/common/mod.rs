//! Shared fixtures: programmable mock reasoning service and oracle, plus
//! a small in-memory policy corpus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tierverify::classifier::{ClassifierCache, EvictionPolicy, ReasoningService};
use tierverify::config::VerifyConfig;
use tierverify::corpus::{CorpusIndex, PolicyClass, PolicyRecord};
use tierverify::error::{Result, VerifyError};
use tierverify::oracle::{OracleClient, OracleRequest, OracleResponse};
use tierverify::orchestrator::Orchestrator;

/// Scripted reasoning service responses.
pub enum ReasoningScenario {
    Static(String),
    /// One response per call, in order; repeats the last when exhausted.
    Sequential(Vec<String>),
    Fail(String),
    /// Never completes; used to exercise cancellation and timeouts.
    Hang,
}

pub struct MockReasoningService {
    scenario: ReasoningScenario,
    pub calls: AtomicUsize,
}

impl MockReasoningService {
    pub fn new(scenario: ReasoningScenario) -> Arc<Self> {
        Arc::new(Self {
            scenario,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for MockReasoningService {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.scenario {
            ReasoningScenario::Static(text) => Ok(text.clone()),
            ReasoningScenario::Sequential(responses) => {
                let index = call.min(responses.len().saturating_sub(1));
                Ok(responses[index].clone())
            }
            ReasoningScenario::Fail(message) => {
                Err(VerifyError::ReasoningService(message.clone()))
            }
            ReasoningScenario::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hanging service should be cancelled or timed out")
            }
        }
    }
}

/// Scripted oracle behavior.
pub enum OracleScenario {
    Respond(OracleResponse),
    Fail(String),
}

pub struct MockOracle {
    scenario: OracleScenario,
    pub calls: AtomicUsize,
}

impl MockOracle {
    pub fn new(scenario: OracleScenario) -> Arc<Self> {
        Arc::new(Self {
            scenario,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unreachable_engine() -> Arc<Self> {
        Self::new(OracleScenario::Fail("oracle executable not found".into()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OracleClient for MockOracle {
    async fn submit(&self, _request: &OracleRequest) -> Result<OracleResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.scenario {
            OracleScenario::Respond(response) => Ok(response.clone()),
            OracleScenario::Fail(message) => Err(VerifyError::Oracle(message.clone())),
        }
    }
}

pub fn sample_corpus() -> Arc<CorpusIndex> {
    Arc::new(CorpusIndex::from_records(
        vec![
            PolicyRecord::new(
                "164.506(c)(2)",
                "Treatment disclosures",
                "A covered entity may disclose protected health information for \
                 treatment activities of another health care provider",
                PolicyClass::Procedural,
            ),
            PolicyRecord::new(
                "164.510(b)(3)",
                "Limited disclosures",
                "Professional judgment permits disclosure to persons involved in the \
                 individual's care, including family members picking up prescriptions",
                PolicyClass::Procedural,
            ),
            PolicyRecord::new(
                "164.506(c)(3)",
                "Payment disclosures",
                "A covered entity may disclose protected health information for the \
                 payment activities of the entity receiving the information",
                PolicyClass::Procedural,
            ),
        ],
        vec![PolicyRecord::new(
            "164.502(a)",
            "Prohibited uses and disclosures",
            "A covered entity may not use or disclose protected health information \
             except as permitted or required; authorization required otherwise",
            PolicyClass::Primary,
        )],
    ))
}

pub fn build_orchestrator(
    reasoning: Arc<MockReasoningService>,
    oracle: Arc<MockOracle>,
) -> Orchestrator {
    let config = VerifyConfig::default();
    let cache = Arc::new(ClassifierCache::new(EvictionPolicy::Unbounded));
    Orchestrator::new(sample_corpus(), reasoning, oracle, cache, &config)
}
