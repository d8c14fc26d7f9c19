//! Tiered compliance verification dispatcher.
//!
//! Routes a yes/no compliance question about a regulated disclosure
//! through successively more rigorous verification strategies — a static
//! pattern catalog, an assisted classifier backed by an external
//! reasoning service, and a formal verification oracle — and always
//! terminates with one adjudicated [`VerificationResult`].

pub mod classifier;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod error;
pub mod fact;
pub mod oracle;
pub mod orchestrator;
pub mod pattern;
pub mod router;
pub mod verdict;

pub use classifier::{
    AssistedClassifier, ClassifierCache, CommandReasoningService, EvictionPolicy,
    ReasoningService, UnavailableReasoningService,
};
pub use config::VerifyConfig;
pub use corpus::{CorpusIndex, PolicyClass, PolicyRecord};
pub use error::{FactError, Result, VerifyError};
pub use fact::{Fact, FactSet, FormalQuery};
pub use oracle::{FormalVerifierAdapter, OracleClient, OracleResponse, SubprocessOracle};
pub use orchestrator::{CancelSignal, Orchestrator, VerificationRequest};
pub use pattern::{ExceptionTemplate, PatternMatcher};
pub use router::{RouteDecision, Router, Track};
pub use verdict::{ProceduralException, Provenance, Tier, VerificationResult};
