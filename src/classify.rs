//! Failure classification for executor errors.
//!
//! ```text
//! executor error ──classify──> FailureClass ──verdict──> BanInfo {status, reason}
//!                                   │
//!                                   ├─ Transient     → recorded, retried by RetryPolicy
//!                                   ├─ LoginFailure  → do_later, one end-of-batch retry
//!                                   └─ Banned / Compromised → Global Standby + alert
//! ```
//!
//! [`PatternClassifier`] is the default [`FailureClassifier`]: ordered,
//! case-insensitive regex lists matched against the full error chain.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};
use crate::interfaces::FailureClassifier;
use crate::job::BanInfo;

// ============================================================================
// Failure Classes
// ============================================================================

/// How an executor failure affects the job and the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Anything not recognized below; retried, then recorded.
    Transient,
    /// Could not sign in; deferred to the end-of-batch retry.
    LoginFailure,
    /// The account was banned or suspended.
    Banned { reason: String },
    /// The account shows signs of compromise.
    Compromised { reason: String },
}

impl FailureClass {
    /// Get a human-readable description of this failure class.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Transient failure",
            Self::LoginFailure => "Login failure",
            Self::Banned { .. } => "Account banned",
            Self::Compromised { .. } => "Account compromised",
        }
    }

    /// Whether this class escalates to Global Standby.
    #[must_use]
    pub fn is_ban_like(&self) -> bool {
        matches!(self, Self::Banned { .. } | Self::Compromised { .. })
    }

    /// Whether an immediate retry could help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// `{status, reason}` view used in result summaries.
    #[must_use]
    pub fn verdict(&self) -> BanInfo {
        match self {
            Self::Banned { reason } | Self::Compromised { reason } => BanInfo {
                status: true,
                reason: reason.clone(),
            },
            _ => BanInfo::default(),
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Banned { reason } | Self::Compromised { reason } => {
                write!(f, "{}: {}", self.description(), reason)
            }
            _ => f.write_str(self.description()),
        }
    }
}

// ============================================================================
// Pattern Classifier
// ============================================================================

/// Regex lists used by [`PatternClassifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub compromise_patterns: Vec<String>,
    pub ban_patterns: Vec<String>,
    pub login_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let owned = |patterns: &[&str]| patterns.iter().map(|p| p.to_string()).collect();
        Self {
            compromise_patterns: owned(&[
                r"compromised",
                r"unusual (sign-?in|activity)",
                r"security (check|challenge) required",
            ]),
            ban_patterns: owned(&[
                r"account (has been )?(suspended|banned|locked)",
                r"\bbanned\b",
                r"\bsuspended\b",
            ]),
            login_patterns: owned(&[
                r"log-?in failed",
                r"sign-?in failed",
                r"invalid (credentials|password)",
                r"(two[- ]factor|2fa) (required|timeout)",
                r"not logged in",
            ]),
        }
    }
}

/// Classifies failures by matching the error chain against ordered patterns.
///
/// Compromise patterns are checked first, then bans, then login failures.
#[derive(Debug)]
pub struct PatternClassifier {
    compromise: Vec<Regex>,
    ban: Vec<Regex>,
    login: Vec<Regex>,
}

impl PatternClassifier {
    /// Build a classifier from configured patterns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first pattern that fails to compile.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        Ok(Self {
            compromise: compile("compromise_patterns", &config.compromise_patterns)?,
            ban: compile("ban_patterns", &config.ban_patterns)?,
            login: compile("login_patterns", &config.login_patterns)?,
        })
    }

    /// Classify raw error text.
    #[must_use]
    pub fn classify_text(&self, text: &str) -> FailureClass {
        let reason = || first_line(text);

        if self.compromise.iter().any(|re| re.is_match(text)) {
            FailureClass::Compromised { reason: reason() }
        } else if self.ban.iter().any(|re| re.is_match(text)) {
            FailureClass::Banned { reason: reason() }
        } else if self.login.iter().any(|re| re.is_match(text)) {
            FailureClass::LoginFailure
        } else {
            FailureClass::Transient
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        // The built-in patterns are known to compile
        Self::new(&ClassifierConfig::default()).unwrap_or(Self {
            compromise: Vec::new(),
            ban: Vec::new(),
            login: Vec::new(),
        })
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, error: &anyhow::Error) -> FailureClass {
        self.classify_text(&format!("{error:#}"))
    }
}

fn compile(field: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){p}"))
                .map_err(|e| DroverError::invalid_config(field, format!("{p:?}: {e}")))
        })
        .collect()
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ban() {
        let classifier = PatternClassifier::default();
        let class = classifier.classify(&anyhow::anyhow!("Account has been suspended"));
        assert_eq!(
            class,
            FailureClass::Banned {
                reason: "Account has been suspended".into()
            }
        );
        assert!(class.is_ban_like());
        assert!(class.verdict().status);
    }

    #[test]
    fn test_compromise_wins_over_ban() {
        let classifier = PatternClassifier::default();
        let class = classifier.classify_text("account locked: unusual sign-in activity");
        assert!(matches!(class, FailureClass::Compromised { .. }));
    }

    #[test]
    fn test_classify_login_failure() {
        let classifier = PatternClassifier::default();
        let class = classifier.classify(&anyhow::anyhow!("Login failed for user"));
        assert_eq!(class, FailureClass::LoginFailure);
        assert!(!class.is_ban_like());
        assert!(!class.is_retryable());
        assert!(!class.verdict().status);
    }

    #[test]
    fn test_unknown_is_transient() {
        let classifier = PatternClassifier::default();
        let class = classifier.classify(&anyhow::anyhow!("connection reset by peer"));
        assert_eq!(class, FailureClass::Transient);
        assert!(class.is_retryable());
    }

    #[test]
    fn test_matches_error_context_chain() {
        let classifier = PatternClassifier::default();
        let error = anyhow::anyhow!("account banned").context("secondary variant failed");
        assert!(classifier.classify(&error).is_ban_like());
    }

    #[test]
    fn test_reason_is_first_line() {
        let classifier = PatternClassifier::default();
        let class = classifier.classify_text("  banned for abuse \nstack trace here");
        assert_eq!(class.verdict().reason, "banned for abuse");
    }

    #[test]
    fn test_custom_patterns() {
        let config = ClassifierConfig {
            compromise_patterns: vec![],
            ban_patterns: vec!["forbidden-zone".into()],
            login_patterns: vec!["captcha".into()],
        };
        let classifier = PatternClassifier::new(&config).expect("compile");
        assert!(classifier.classify_text("FORBIDDEN-ZONE").is_ban_like());
        assert_eq!(
            classifier.classify_text("captcha shown"),
            FailureClass::LoginFailure
        );
        assert_eq!(
            classifier.classify_text("account suspended"),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = ClassifierConfig {
            ban_patterns: vec!["(unclosed".into()],
            ..ClassifierConfig::default()
        };
        let err = PatternClassifier::new(&config).expect_err("invalid regex");
        assert!(matches!(err, DroverError::InvalidConfig { .. }));
    }

    #[test]
    fn test_display_includes_reason() {
        let class = FailureClass::Compromised {
            reason: "security challenge required".into(),
        };
        assert_eq!(
            class.to_string(),
            "Account compromised: security challenge required"
        );
    }
}
