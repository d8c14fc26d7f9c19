//! Tier 1B: assisted procedural classification through an external
//! reasoning service, seeded with router-ranked policy excerpts.
//!
//! Every fault at this boundary degrades to an inapplicable exception;
//! nothing propagates to the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::error::{Result, VerifyError};
use crate::fact::FactSet;
use crate::verdict::{ProceduralException, Provenance};

/// Boundary to the external reasoning service: one text prompt in, free
/// text with an embedded structured object out.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Reasoning service reached through a configured external command:
/// prompt on stdin, response on stdout.
pub struct CommandReasoningService {
    program: PathBuf,
    timeout: Duration,
}

impl CommandReasoningService {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReasoningService for CommandReasoningService {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(program = %self.program.display(), "Invoking reasoning command");

        let mut child = Command::new(&self.program)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VerifyError::ReasoningService(format!("failed to spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VerifyError::Timeout(format!(
                    "reasoning command after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VerifyError::ReasoningService(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Placeholder service for deployments without a reasoning backend; the
/// classifier tier degrades on every request.
pub struct UnavailableReasoningService;

#[async_trait]
impl ReasoningService for UnavailableReasoningService {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(VerifyError::ReasoningService(
            "no reasoning service configured".into(),
        ))
    }
}

/// Structured object expected inside the reasoning service's free-text
/// response.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClassifierResponse {
    pub matches: bool,
    #[serde(default)]
    pub exception_name: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Locate the first balanced `{...}` object in free text that parses as a
/// classifier response. Tolerates prose, code fences, and leading junk.
pub fn extract_embedded_object(text: &str) -> Option<ClassifierResponse> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(end) = find_balanced_end(bytes, open) {
            if let Ok(response) = serde_json::from_str::<ClassifierResponse>(&text[open..=end]) {
                return Some(response);
            }
        }
        start = open + 1;
    }

    None
}

/// Index of the `}` closing the object opened at `open`, tracking nesting
/// and string literals.
fn find_balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Bound on the classifier cache. Entries are never invalidated, so an
/// unbounded cache grows for the process lifetime; deployments should
/// configure an LRU bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Unbounded,
    Lru { max_entries: usize },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    exception: ProceduralException,
    last_access: u64,
    cached_at: DateTime<Utc>,
}

/// Exact-input response cache for the assisted classifier. Injected into
/// the orchestrator rather than held as module state, so independent
/// pipelines can share or isolate it explicitly.
pub struct ClassifierCache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
    policy: EvictionPolicy,
    clock: AtomicU64,
}

impl ClassifierCache {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            clock: AtomicU64::new(0),
        }
    }

    pub fn get(&self, query: &str, facts_key: &str) -> Option<ProceduralException> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&(query.to_string(), facts_key.to_string()))?;
        entry.last_access = tick;
        Some(entry.exception.clone())
    }

    pub fn insert(&self, query: &str, facts_key: &str, exception: ProceduralException) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();

        if let EvictionPolicy::Lru { max_entries } = self.policy {
            let key = (query.to_string(), facts_key.to_string());
            if entries.len() >= max_entries && !entries.contains_key(&key) {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
                {
                    debug!(query = %oldest.0, "Evicting least recently used cache entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            (query.to_string(), facts_key.to_string()),
            CacheEntry {
                exception,
                last_access: tick,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Age of the oldest cached entry, if any.
    pub fn oldest_entry_age(&self) -> Option<chrono::Duration> {
        let entries = self.entries.read();
        entries
            .values()
            .map(|e| e.cached_at)
            .min()
            .map(|oldest| Utc::now() - oldest)
    }
}

/// Outcome of one classification attempt, with any degradation warnings.
#[derive(Debug, Clone)]
pub struct ClassifierOutcome {
    pub exception: ProceduralException,
    pub warnings: Vec<String>,
    pub from_cache: bool,
}

pub struct AssistedClassifier {
    service: Arc<dyn ReasoningService>,
    cache: Arc<ClassifierCache>,
    config: ClassifierConfig,
}

impl AssistedClassifier {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        cache: Arc<ClassifierCache>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            service,
            cache,
            config,
        }
    }

    /// Classify the query against procedural policy excerpts. Any fault
    /// (timeout, service error, unparseable response) yields an
    /// inapplicable exception plus a warning; this method never fails.
    pub async fn classify(
        &self,
        query: &str,
        facts: &FactSet,
        excerpts: &str,
    ) -> ClassifierOutcome {
        let facts_key = facts.cache_key();

        if let Some(exception) = self.cache.get(query, &facts_key) {
            debug!(query = %query, "Classifier cache hit");
            return ClassifierOutcome {
                exception,
                warnings: Vec::new(),
                from_cache: true,
            };
        }

        if excerpts.is_empty() {
            debug!("No procedural excerpts available, skipping assisted classification");
            return ClassifierOutcome {
                exception: ProceduralException::inapplicable(Provenance::Assisted),
                warnings: Vec::new(),
                from_cache: false,
            };
        }

        let prompt = self.build_prompt(query, facts, excerpts);
        let request = self.service.complete(&prompt);
        let response = match timeout(Duration::from_secs(self.config.timeout_secs), request).await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "Assisted classification failed");
                return self.degraded(format!("Assisted classification failed: {}", e));
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.timeout_secs,
                    "Assisted classification timed out"
                );
                return self.degraded(format!(
                    "Assisted classification timed out after {}s",
                    self.config.timeout_secs
                ));
            }
        };

        let Some(parsed) = extract_embedded_object(&response) else {
            warn!("Reasoning response contained no parseable object");
            return self.degraded(
                "Assisted classification returned an unparseable response; treated as no match"
                    .to_string(),
            );
        };

        let exception = ProceduralException {
            name: parsed
                .exception_name
                .unwrap_or_else(|| "Assisted-Detected Exception".to_string()),
            citation: parsed
                .section
                .map(|s| format!("45 CFR §{}", s))
                .unwrap_or_default(),
            rationale: parsed.reasoning,
            applies: parsed.matches,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            provenance: Provenance::Assisted,
        };

        // Only successfully parsed outcomes are cached; a fault may succeed
        // on a later identical request once the service recovers.
        self.cache.insert(query, &facts_key, exception.clone());

        debug!(
            applies = exception.applies,
            confidence = exception.confidence,
            "Assisted classification complete"
        );

        ClassifierOutcome {
            exception,
            warnings: Vec::new(),
            from_cache: false,
        }
    }

    fn degraded(&self, warning: String) -> ClassifierOutcome {
        ClassifierOutcome {
            exception: ProceduralException::inapplicable(Provenance::Assisted),
            warnings: vec![warning],
            from_cache: false,
        }
    }

    fn build_prompt(&self, query: &str, facts: &FactSet, excerpts: &str) -> String {
        let fact_lines = facts
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a compliance analyst for regulated health-information \
             disclosures. Determine whether this scenario matches a PROCEDURAL \
             exception.\n\n\
             Query: {query}\n\
             Facts:\n{fact_lines}\n\n\
             PROCEDURAL POLICIES (these allow disclosure without explicit \
             authorization):\n{excerpts}\n\n\
             Procedural policies typically contain language like \"may use or \
             disclose\", \"is permitted to\", \"professional judgment\", or \
             \"does not require authorization\".\n\n\
             Does the query match ANY procedural policy above?\n\n\
             Output ONLY valid JSON:\n\
             {{\n\
                 \"matches\": true/false,\n\
                 \"exception_name\": \"Brief name\" or null,\n\
                 \"section\": \"164.XXX\" or null,\n\
                 \"confidence\": 0.0-1.0,\n\
                 \"reasoning\": \"Brief explanation of the match or mismatch\"\n\
             }}"
        )
    }
}
