//! Fact validation against the fixed predicate arity table, and formal
//! query well-formedness checks.
//!
//! Facts arrive from an external extraction service and are not trusted:
//! each is checked against the registered arity table before it can enter
//! a verification pipeline. Rejected facts are dropped with a warning.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FactError, Result, VerifyError};

/// Version of the registered predicate table. Bumped whenever a predicate
/// is added, removed, or changes arity.
pub const ARITY_TABLE_VERSION: u32 = 1;

/// Registered arity for a predicate, or `None` if the predicate is unknown.
pub fn registered_arity(predicate: &str) -> Option<usize> {
    match predicate {
        "coveredEntity" | "protectedHealthInfo" | "publicHealthAuthority" | "requiredByLaw" => {
            Some(1)
        }
        "hasAuthorization" => Some(3),
        "disclose" | "permittedUseOrDisclosure" => Some(4),
        _ => None,
    }
}

/// Conclusion predicates assert the very permission under test and must
/// not be forwarded to the formal oracle.
pub fn is_conclusion_predicate(predicate: &str) -> bool {
    matches!(predicate, "permittedUseOrDisclosure" | "hasAuthorization")
}

/// A single extracted predicate application: name plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub predicate: String,
    pub arguments: Vec<String>,
}

impl Fact {
    pub fn new(predicate: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            predicate: predicate.into(),
            arguments,
        }
    }

    /// Build a fact from the flat list form `[predicate, arg...]` used on
    /// the extraction wire.
    pub fn from_list(items: &[String]) -> Option<Self> {
        let (predicate, arguments) = items.split_first()?;
        Some(Self::new(predicate.clone(), arguments.to_vec()))
    }

    pub fn validate(&self) -> std::result::Result<(), FactError> {
        let expected = registered_arity(&self.predicate)
            .ok_or_else(|| FactError::UnknownPredicate(self.predicate.clone()))?;
        if self.arguments.len() != expected {
            return Err(FactError::ArityMismatch {
                predicate: self.predicate.clone(),
                expected,
                actual: self.arguments.len(),
            });
        }
        Ok(())
    }

    /// Purpose argument of a disclosure-shaped fact.
    pub fn purpose(&self) -> Option<&str> {
        match self.predicate.as_str() {
            "disclose" | "permittedUseOrDisclosure" => {
                self.arguments.get(3).map(String::as_str)
            }
            _ => None,
        }
    }

    /// Recipient argument of a disclosure fact.
    pub fn recipient(&self) -> Option<&str> {
        match self.predicate.as_str() {
            "disclose" => self.arguments.get(1).map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.predicate, self.arguments.join(","))
    }
}

/// Validated, immutable fact set for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactSet {
    facts: Vec<Fact>,
}

impl FactSet {
    /// Validate candidate facts against the arity table. Facts that fail
    /// are dropped and reported as warnings; validation never fails the
    /// request.
    pub fn validate(candidates: Vec<Fact>) -> (Self, Vec<String>) {
        let mut facts = Vec::with_capacity(candidates.len());
        let mut warnings = Vec::new();

        for fact in candidates {
            match fact.validate() {
                Ok(()) => facts.push(fact),
                Err(reason) => {
                    tracing::warn!(fact = %fact, reason = %reason, "Dropping invalid fact");
                    warnings.push(format!("Fact '{}' dropped: {}", fact, reason));
                }
            }
        }

        (Self { facts }, warnings)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn with_predicate<'a>(&'a self, predicate: &'a str) -> impl Iterator<Item = &'a Fact> {
        self.facts.iter().filter(move |f| f.predicate == predicate)
    }

    /// First argument of the first fact with the given predicate.
    pub fn first_argument<'a>(&'a self, predicate: &'a str) -> Option<&'a str> {
        self.with_predicate(predicate)
            .next()
            .and_then(|f| f.arguments.first().map(String::as_str))
    }

    /// Canonical key for exact-input caching. Preserves fact order, so
    /// identical requests produce identical keys.
    pub fn cache_key(&self) -> String {
        self.facts
            .iter()
            .map(Fact::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Caller-owned quantified logical expression, submitted opaquely to the
/// formal oracle. The only local check is that every free variable in the
/// body is bound by a quantifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormalQuery(String);

const CONNECTIVES: &[&str] = &[
    "and", "or", "not", "implies", "iff", "true", "false", "forall", "exists",
];

impl FormalQuery {
    pub fn new(formula: impl Into<String>) -> Self {
        Self(formula.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that every variable in argument position is bound by an
    /// enclosing quantifier list. Constants (leading uppercase, `@`-tagged,
    /// or quoted) are ignored.
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(VerifyError::InvalidFormula("empty formula".into()));
        }

        let tokens = tokenize(&self.0);
        let mut bound: Vec<String> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            match &tokens[i] {
                Token::Ident(word) if word == "forall" || word == "exists" => {
                    // Collect the quantified variable list up to the dot.
                    i += 1;
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Ident(var) => bound.push(var.clone()),
                            Token::Dot => break,
                            Token::Open => {
                                return Err(VerifyError::InvalidFormula(
                                    "quantifier list not terminated by '.'".into(),
                                ));
                            }
                        }
                        i += 1;
                    }
                }
                Token::Ident(word) => {
                    let applied = matches!(tokens.get(i + 1), Some(Token::Open));
                    let is_variable = !applied
                        && !CONNECTIVES.contains(&word.as_str())
                        && word.chars().next().is_some_and(|c| c.is_lowercase());
                    if is_variable && !bound.iter().any(|b| b == word) {
                        return Err(VerifyError::InvalidFormula(format!(
                            "unbound variable '{}'",
                            word
                        )));
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Ok(())
    }
}

impl fmt::Display for FormalQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Dot,
    Open,
}

fn tokenize(formula: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = formula.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_alphabetic() || c == '_' || c == '@' {
            let mut ident = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '@' {
                    ident.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            // Constants are tagged (@Treatment) or capitalized; they never
            // need binding, so drop them here.
            if !ident.starts_with('@') {
                tokens.push(Token::Ident(ident));
            }
        } else if c == '"' {
            // Skip quoted string constants.
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
            }
        } else {
            if c == '.' {
                tokens.push(Token::Dot);
            } else if c == '(' {
                tokens.push(Token::Open);
            }
            chars.next();
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_registered_arity() {
        assert_eq!(registered_arity("coveredEntity"), Some(1));
        assert_eq!(registered_arity("disclose"), Some(4));
        assert_eq!(registered_arity("hasAuthorization"), Some(3));
        assert_eq!(registered_arity("businessAssociate"), None);
    }

    #[test]
    fn test_fact_validation() {
        let ok = Fact::from_list(&list(&["disclose", "A", "B", "C", "D"])).unwrap();
        assert!(ok.validate().is_ok());

        let short = Fact::from_list(&list(&["disclose", "A", "B"])).unwrap();
        assert_eq!(
            short.validate(),
            Err(FactError::ArityMismatch {
                predicate: "disclose".into(),
                expected: 4,
                actual: 2,
            })
        );

        let unknown = Fact::new("frobnicate", vec!["X".into()]);
        assert_eq!(
            unknown.validate(),
            Err(FactError::UnknownPredicate("frobnicate".into()))
        );
    }

    #[test]
    fn test_fact_set_drops_invalid_with_warning() {
        let candidates = vec![
            Fact::new("coveredEntity", vec!["Hospital1".into()]),
            Fact::new("disclose", vec!["A".into(), "B".into()]),
            Fact::new("mystery", vec![]),
        ];

        let (set, warnings) = FactSet::validate(candidates);
        assert_eq!(set.len(), 1);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("arity mismatch"));
        assert!(warnings[1].contains("unknown predicate"));
    }

    #[test]
    fn test_fact_accessors() {
        let (set, _) = FactSet::validate(vec![
            Fact::new("coveredEntity", vec!["Hospital1".into()]),
            Fact::from_list(&list(&["disclose", "Hospital1", "Specialist1", "Rec1", "Treatment"]))
                .unwrap(),
        ]);

        assert_eq!(set.first_argument("coveredEntity"), Some("Hospital1"));
        let disclose = set.with_predicate("disclose").next().unwrap();
        assert_eq!(disclose.recipient(), Some("Specialist1"));
        assert_eq!(disclose.purpose(), Some("Treatment"));
    }

    #[test]
    fn test_cache_key_is_order_sensitive_and_stable() {
        let a = Fact::new("coveredEntity", vec!["H".into()]);
        let b = Fact::new("requiredByLaw", vec!["L".into()]);

        let (set1, _) = FactSet::validate(vec![a.clone(), b.clone()]);
        let (set2, _) = FactSet::validate(vec![a.clone(), b.clone()]);
        let (set3, _) = FactSet::validate(vec![b, a]);

        assert_eq!(set1.cache_key(), set2.cache_key());
        assert_ne!(set1.cache_key(), set3.cache_key());
    }

    #[test]
    fn test_formula_all_bound() {
        let formula = FormalQuery::new(
            "forall ce, patient, phi, purpose. \
             (coveredEntity(ce) and disclose(ce, patient, phi, purpose)) \
             implies permittedUseOrDisclosure(ce, patient, phi, purpose)",
        );
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn test_formula_unbound_variable() {
        let formula =
            FormalQuery::new("forall ce. coveredEntity(ce) implies disclose(ce, x, phi, p)");
        let err = formula.validate().unwrap_err();
        assert!(err.to_string().contains("unbound variable 'x'"));
    }

    #[test]
    fn test_formula_nested_quantifier_binds() {
        let formula = FormalQuery::new(
            "forall ce. coveredEntity(ce) implies \
             (exists auth. hasAuthorization(ce, auth, auth))",
        );
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn test_formula_constants_ignored() {
        let formula = FormalQuery::new(
            "forall ce, p, phi. disclose(ce, p, phi, @Treatment) implies coveredEntity(Hospital1)",
        );
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn test_empty_formula_rejected() {
        assert!(FormalQuery::new("   ").validate().is_err());
    }
}
