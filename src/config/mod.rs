//! Configuration for the verification pipeline. All thresholds and
//! external-boundary settings live here; components receive their own
//! sub-config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, VerifyError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub corpus: CorpusConfig,
    pub router: RouterConfig,
    pub pattern: PatternConfig,
    pub classifier: ClassifierConfig,
    pub oracle: OracleConfig,
    pub fallback: FallbackConfig,
}

impl VerifyConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| VerifyError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate values for consistency; collects every problem rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.router.procedural_bias <= 0.0 {
            errors.push("router.procedural_bias must be positive");
        }
        if self.router.max_ranked_records == 0 {
            errors.push("router.max_ranked_records must be greater than 0");
        }
        if self.router.max_excerpt_policies == 0 {
            errors.push("router.max_excerpt_policies must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.pattern.accept_threshold) {
            errors.push("pattern.accept_threshold must be between 0.0 and 1.0");
        }
        let weight_sum = self.pattern.keyword_weight + self.pattern.pattern_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            errors.push("pattern keyword_weight and pattern_weight must sum to 1.0");
        }

        if !(0.0..=1.0).contains(&self.classifier.accept_threshold) {
            errors.push("classifier.accept_threshold must be between 0.0 and 1.0");
        }
        if self.classifier.timeout_secs == 0 {
            errors.push("classifier.timeout_secs must be greater than 0");
        }

        if self.oracle.timeout_secs == 0 {
            errors.push("oracle.timeout_secs must be greater than 0");
        }
        if self.oracle.regulation.is_empty() {
            errors.push("oracle.regulation must not be empty");
        }
        if !(0.0..=1.0).contains(&self.oracle.compliant_confidence)
            || !(0.0..=1.0).contains(&self.oracle.violation_confidence)
        {
            errors.push("oracle confidence values must be between 0.0 and 1.0");
        }

        if !(0.0..=1.0).contains(&self.fallback.compliant_confidence) {
            errors.push("fallback.compliant_confidence must be between 0.0 and 1.0");
        }
        if self.fallback.compliant_confidence == 0.0 {
            errors.push("fallback.compliant_confidence must be positive");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VerifyError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub procedural_path: PathBuf,
    pub primary_path: PathBuf,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            procedural_path: PathBuf::from("policies/procedural_policies.json"),
            primary_path: PathBuf::from("policies/primary_policies.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// The procedural track wins whenever its score is at least this
    /// fraction of the primary score; ties favor the cheaper tier.
    pub procedural_bias: f64,
    pub max_ranked_records: usize,
    pub max_excerpt_policies: usize,
    pub max_excerpt_chars: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            procedural_bias: 0.8,
            max_ranked_records: 20,
            max_excerpt_policies: 15,
            max_excerpt_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub accept_threshold: f64,
    pub keyword_weight: f64,
    pub pattern_weight: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.70,
            keyword_weight: 0.4,
            pattern_weight: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub accept_threshold: f64,
    pub timeout_secs: u64,
    /// External reasoning command (prompt on stdin, response on stdout).
    /// When absent the assisted tier degrades on every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,
    /// Cache bound; 0 means unbounded.
    pub max_cache_entries: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.65,
            timeout_secs: 15,
            command: None,
            max_cache_entries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub program: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub regulation: String,
    pub version: String,
    pub compliant_confidence: f64,
    pub violation_confidence: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("precis"),
            working_dir: None,
            timeout_secs: 30,
            regulation: "HIPAA".to_string(),
            version: "1.0".to_string(),
            compliant_confidence: 0.95,
            violation_confidence: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Confidence assigned when a fallback heuristic finds a permitted
    /// purpose; kept low because nothing was formally checked.
    pub compliant_confidence: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            compliant_confidence: 0.60,
        }
    }
}
